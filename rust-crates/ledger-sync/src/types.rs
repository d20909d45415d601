use crate::Error;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    fmt,
    str::FromStr,
    time::Duration,
};

/// Fixed-length identifier of an on-chain account. Written as base58, the
/// form ledgers use on the wire; `0x`-prefixed hex is also accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId([u8; AccountId::LEN]);

/// Programs own accounts and are addressed like them.
pub type ProgramId = AccountId;

impl AccountId {
    pub const LEN: usize = 32;

    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a stable id from a human readable label such as `"game-42"`.
    pub fn from_label(label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl From<[u8; AccountId::LEN]> for AccountId {
    fn from(bytes: [u8; AccountId::LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for AccountId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bytes = match trimmed.strip_prefix("0x") {
            Some(hex_digits) => hex::decode(hex_digits)
                .map_err(|e| Error::InvalidAccountId(format!("{s}: {e}")))?,
            None => bs58::decode(trimmed)
                .into_vec()
                .map_err(|e| Error::InvalidAccountId(format!("{s}: {e}")))?,
        };
        let bytes: [u8; Self::LEN] = bytes.try_into().map_err(|raw: Vec<u8>| {
            Error::InvalidAccountId(format!(
                "{s}: expected {} bytes, got {}",
                Self::LEN,
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for AccountId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = bs58::encode(self.0).into_string();
        write!(f, "AccountId({}..{})", &full[..6], &full[full.len() - 4..])
    }
}

/// Which ledger currently executes an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerKind {
    Base,
    Ephemeral,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerKind::Base => "base",
            LedgerKind::Ephemeral => "ephemeral",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intent {
    Read,
    Write,
}

/// Submission settings handed to a transport provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityProfile {
    pub skip_preflight: bool,
    #[serde(with = "crate::config::duration_ms", rename = "confirmation_timeout_ms")]
    pub confirmation_timeout: Duration,
}

impl ReliabilityProfile {
    pub const fn read() -> Self {
        Self {
            skip_preflight: false,
            confirmation_timeout: Duration::from_secs(10),
        }
    }

    /// Full preflight and a long confirmation wait, for the base ledger.
    pub const fn durable_write() -> Self {
        Self {
            skip_preflight: false,
            confirmation_timeout: Duration::from_secs(60),
        }
    }

    /// No preflight and a short confirmation wait, for the ephemeral ledger.
    pub const fn fast_write() -> Self {
        Self {
            skip_preflight: true,
            confirmation_timeout: Duration::from_secs(5),
        }
    }

    pub const fn write_default_for(kind: LedgerKind) -> Self {
        match kind {
            LedgerKind::Base => Self::durable_write(),
            LedgerKind::Ephemeral => Self::fast_write(),
        }
    }
}

/// A state change pushed by a ledger subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountEvent {
    pub account_id: AccountId,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl AccountEvent {
    pub fn new(account_id: AccountId, sequence: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            account_id,
            sequence,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Latest applied state of one game account. Replaced whole, never edited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameStateSnapshot {
    pub account_id: AccountId,
    pub payload: Vec<u8>,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountEvent> for GameStateSnapshot {
    fn from(event: AccountEvent) -> Self {
        Self {
            account_id: event.account_id,
            payload: event.payload,
            sequence: event.sequence,
            updated_at: event.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn from_str__round_trips_display() {
        // given
        let id = AccountId::from_label("game-42");

        // when
        let parsed: AccountId = id.to_string().parse().unwrap();

        // then
        assert_eq!(parsed, id);
    }

    #[test]
    fn from_str__reads_base58_program_id() {
        // given
        let text = "DELeGGvXpWV2fqJUhqcF5ZSYMS4JTLjteaAMARRSaeSh";

        // when
        let id: AccountId = text.parse().unwrap();

        // then
        assert_eq!(id.to_string(), text);
    }

    #[test]
    fn from_str__accepts_prefixed_hex() {
        let id = AccountId::from_label("game-42");
        let hex_text = format!("0x{}", hex::encode(id.as_bytes()));

        assert_eq!(hex_text.parse::<AccountId>().unwrap(), id);
    }

    #[test]
    fn from_str__rejects_non_base58_characters() {
        let err = "0OIl".parse::<AccountId>().unwrap_err();
        assert!(matches!(err, Error::InvalidAccountId(_)));
    }

    #[test]
    fn from_str__rejects_wrong_length() {
        let err = "abcd".parse::<AccountId>().unwrap_err();
        assert!(matches!(err, Error::InvalidAccountId(_)));
    }

    #[test]
    fn from_label__is_stable_and_distinct() {
        assert_eq!(AccountId::from_label("game-42"), AccountId::from_label("game-42"));
        assert_ne!(AccountId::from_label("game-42"), AccountId::from_label("game-43"));
    }

    #[test]
    fn write_default_for__ephemeral_skips_preflight() {
        let fast = ReliabilityProfile::write_default_for(LedgerKind::Ephemeral);
        let durable = ReliabilityProfile::write_default_for(LedgerKind::Base);
        assert!(fast.skip_preflight);
        assert!(!durable.skip_preflight);
        assert!(fast.confirmation_timeout < durable.confirmation_timeout);
    }
}
