use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationCacheConfig {
    /// How long a delegation record is served without a refresh.
    #[serde(with = "duration_ms", rename = "ttl_ms")]
    pub ttl: Duration,
    #[serde(with = "duration_ms", rename = "refresh_timeout_ms")]
    pub refresh_timeout: Duration,
}

impl Default for DelegationCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(3),
        }
    }
}

/// Exponential backoff with jitter between subscription attempts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Fraction of the current delay added as random jitter, in `[0, 1)`.
    pub jitter_ratio: f64,
    /// Consecutive failed attempts before the subscription is closed.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
            max_attempts: Some(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    #[serde(with = "duration_ms", rename = "open_timeout_ms")]
    pub open_timeout: Duration,
    /// Treat a silent stream as disconnected after this long.
    #[serde(with = "optional_duration_ms", rename = "heartbeat_timeout_ms")]
    pub heartbeat_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(5),
            heartbeat_timeout: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub(crate) mod optional_duration_ms {
    use serde::{
        Deserialize,
        Deserializer,
        Serializer,
    };
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                s.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
