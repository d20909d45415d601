use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use ledger_sync::{
    AccountId,
    DelegationCacheConfig,
    SubscriptionConfig,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use url::Url;

pub const DEFAULT_BASE_HTTP_URL: &str = "http://127.0.0.1:8899";
pub const DEFAULT_BASE_WS_URL: &str = "ws://127.0.0.1:8900";
pub const DEFAULT_EPHEMERAL_HTTP_URL: &str = "http://127.0.0.1:7799";
pub const DEFAULT_EPHEMERAL_WS_URL: &str = "ws://127.0.0.1:7800";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub http_url: Option<Url>,
    pub ws_url: Option<Url>,
}

impl EndpointConfig {
    fn resolve(&self, http_default: &str, ws_default: &str) -> Result<EndpointUrls> {
        let http_url = match &self.http_url {
            Some(url) => url.clone(),
            None => Url::parse(http_default).wrap_err("invalid default HTTP url")?,
        };
        let ws_url = match &self.ws_url {
            Some(url) => url.clone(),
            None => Url::parse(ws_default).wrap_err("invalid default WebSocket url")?,
        };
        Ok(EndpointUrls { http_url, ws_url })
    }
}

/// Contents of the optional `--config` JSON file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base: EndpointConfig,
    pub ephemeral: EndpointConfig,
    pub delegation_program: Option<AccountId>,
    pub delegation_cache: DelegationCacheConfig,
    pub subscription: SubscriptionConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .wrap_err_with(|| format!("parsing config file {}", path.display()))
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            base_http_url,
            base_ws_url,
            ephemeral_http_url,
            ephemeral_ws_url,
            delegation_program,
            cache_ttl_ms,
            max_attempts,
        } = overrides;
        if base_http_url.is_some() {
            self.base.http_url = base_http_url;
        }
        if base_ws_url.is_some() {
            self.base.ws_url = base_ws_url;
        }
        if ephemeral_http_url.is_some() {
            self.ephemeral.http_url = ephemeral_http_url;
        }
        if ephemeral_ws_url.is_some() {
            self.ephemeral.ws_url = ephemeral_ws_url;
        }
        if delegation_program.is_some() {
            self.delegation_program = delegation_program;
        }
        if let Some(ttl) = cache_ttl_ms {
            self.delegation_cache.ttl = Duration::from_millis(ttl);
        }
        if let Some(max) = max_attempts {
            self.subscription.backoff.max_attempts = (max > 0).then_some(max);
        }
    }

    pub fn resolve(self) -> Result<Settings> {
        let delegation_program = self.delegation_program.ok_or_else(|| {
            eyre!("no delegation program configured; pass --delegation-program or set it in the config file")
        })?;
        Ok(Settings {
            base: self.base.resolve(DEFAULT_BASE_HTTP_URL, DEFAULT_BASE_WS_URL)?,
            ephemeral: self
                .ephemeral
                .resolve(DEFAULT_EPHEMERAL_HTTP_URL, DEFAULT_EPHEMERAL_WS_URL)?,
            delegation_program,
            delegation_cache: self.delegation_cache,
            subscription: self.subscription,
        })
    }
}

/// Command-line values that take precedence over the config file.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct Overrides {
    /// JSON-RPC url of the base ledger.
    #[arg(long)]
    pub base_http_url: Option<Url>,

    /// WebSocket url of the base ledger.
    #[arg(long)]
    pub base_ws_url: Option<Url>,

    #[arg(long)]
    pub ephemeral_http_url: Option<Url>,

    #[arg(long)]
    pub ephemeral_ws_url: Option<Url>,

    /// Base58 id of the program that owns delegated accounts.
    #[arg(long)]
    pub delegation_program: Option<AccountId>,

    #[arg(long)]
    pub cache_ttl_ms: Option<u64>,

    /// Failed attempts before a subscription gives up; 0 retries forever.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointUrls {
    pub http_url: Url,
    pub ws_url: Url,
}

/// Fully resolved client settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub base: EndpointUrls,
    pub ephemeral: EndpointUrls,
    pub delegation_program: AccountId,
    pub delegation_cache: DelegationCacheConfig,
    pub subscription: SubscriptionConfig,
}

pub fn load_settings(path: Option<&PathBuf>, overrides: Overrides) -> Result<Settings> {
    let mut config = match path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    config.apply(overrides);
    config.resolve()
}
