use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::fs;

use crate::errors::PoolError;
use crate::gateway::{PairingConfig, PoolConfig, ReconnectPolicy};
use crate::resilience::{BreakerConfig, OperationPolicy, PolicyTable, RateLimitConfig};

// -----------------------------------------------------------------------------
// ----- GatewayConfig ---------------------------------------------------------

/// Everything read from `pairgate.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    /// Directory for the file-backed credential store. `None` keeps
    /// credentials in memory only.
    pub credentials_dir: Option<PathBuf>,
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Static -------------------------------------------------

impl GatewayConfig {
    pub async fn from_file_async(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<GatewayConfig, ConfigError> {
        let doc: GatewayFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;
        let cfg = doc.into_config();
        cfg.validate()?;
        Ok(cfg)
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Public -------------------------------------------------

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;

        if pool.device_name.trim().is_empty() {
            return Err(invalid("pool.device_name", "must not be empty"));
        }
        nonzero(pool.maintenance_interval, "pool.maintenance_interval")?;
        if pool.event_buffer == 0 {
            return Err(invalid("pool.event_buffer", "must be at least 1"));
        }

        let r = &pool.reconnect;
        nonzero(r.base_delay, "reconnect.base_delay")?;
        if r.base_delay > r.max_delay {
            return Err(invalid("reconnect.base_delay", "must not exceed max_delay"));
        }
        if r.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be at least 1"));
        }

        if pool.breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        nonzero(pool.breaker.cooldown, "circuit_breaker.cooldown")?;

        for (limits, section) in [
            (&pool.rate_limit, "rate_limit"),
            (&pool.gateway_rate_limit, "rate_limit.gateway"),
        ] {
            if limits.max_requests == 0 {
                return Err(invalid(format!("{section}.max_requests"), "must be at least 1"));
            }
            nonzero(limits.window, &format!("{section}.window"))?;
        }

        nonzero(pool.pairing.qr_ttl, "pairing.qr_ttl")?;
        nonzero(pool.pairing.code_ttl, "pairing.code_ttl")?;
        nonzero(pool.pairing.code_wait, "pairing.code_wait")?;

        nonzero(pool.guards.open.timeout, "guards.open_timeout")?;
        nonzero(pool.guards.send.timeout, "guards.send_timeout")?;
        nonzero(pool.guards.load_credentials.timeout, "guards.store_timeout")?;

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewayFile {
    #[serde(default)]
    pool: PoolSection,

    #[serde(default)]
    reconnect: ReconnectSection,

    #[serde(default)]
    circuit_breaker: BreakerSection,

    #[serde(default)]
    rate_limit: RateLimitSection,

    #[serde(default)]
    pairing: PairingSection,

    #[serde(default)]
    guards: GuardsSection,

    #[serde(default)]
    credentials: CredentialsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    device_name: Option<String>,
    restore_on_init: Option<bool>,
    #[serde(default, deserialize_with = "de_duration")]
    maintenance_interval: Option<Duration>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconnectSection {
    #[serde(default, deserialize_with = "de_duration")]
    base_delay: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    max_delay: Option<Duration>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BreakerSection {
    failure_threshold: Option<u32>,
    #[serde(default, deserialize_with = "de_duration")]
    cooldown: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitSection {
    max_requests: Option<u32>,
    #[serde(default, deserialize_with = "de_duration")]
    window: Option<Duration>,
    gateway_max_requests: Option<u32>,
    #[serde(default, deserialize_with = "de_duration")]
    gateway_window: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PairingSection {
    #[serde(default, deserialize_with = "de_duration")]
    qr_ttl: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    code_ttl: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    code_wait: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GuardsSection {
    #[serde(default, deserialize_with = "de_duration")]
    open_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    send_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_duration")]
    store_timeout: Option<Duration>,
    store_retries: Option<u32>,
    #[serde(default, deserialize_with = "de_duration")]
    store_retry_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialsSection {
    dir: Option<PathBuf>,
}

impl GatewayFile {
    fn into_config(self) -> GatewayConfig {
        let d = PoolConfig::default();

        let reconnect = ReconnectPolicy {
            base_delay: self.reconnect.base_delay.unwrap_or(d.reconnect.base_delay),
            max_delay: self.reconnect.max_delay.unwrap_or(d.reconnect.max_delay),
            max_attempts: self.reconnect.max_attempts.unwrap_or(d.reconnect.max_attempts),
        };

        let breaker = BreakerConfig {
            failure_threshold: self
                .circuit_breaker
                .failure_threshold
                .unwrap_or(d.breaker.failure_threshold),
            cooldown: self.circuit_breaker.cooldown.unwrap_or(d.breaker.cooldown),
        };

        let rl = self.rate_limit;
        let rate_limit = RateLimitConfig {
            max_requests: rl.max_requests.unwrap_or(d.rate_limit.max_requests),
            window: rl.window.unwrap_or(d.rate_limit.window),
        };
        let gateway_rate_limit = RateLimitConfig {
            max_requests: rl
                .gateway_max_requests
                .unwrap_or(d.gateway_rate_limit.max_requests),
            window: rl.gateway_window.unwrap_or(d.gateway_rate_limit.window),
        };

        let pairing = PairingConfig {
            qr_ttl: self.pairing.qr_ttl.unwrap_or(d.pairing.qr_ttl),
            code_ttl: self.pairing.code_ttl.unwrap_or(d.pairing.code_ttl),
            code_wait: self.pairing.code_wait.unwrap_or(d.pairing.code_wait),
        };

        let g = self.guards;
        let store = OperationPolicy {
            timeout: g.store_timeout.unwrap_or(d.guards.load_credentials.timeout),
            retries: g.store_retries.unwrap_or(d.guards.load_credentials.retries),
            retry_delay: g
                .store_retry_delay
                .unwrap_or(d.guards.load_credentials.retry_delay),
        };
        let guards = PolicyTable {
            open: OperationPolicy {
                timeout: g.open_timeout.unwrap_or(d.guards.open.timeout),
                ..d.guards.open
            },
            send: OperationPolicy {
                timeout: g.send_timeout.unwrap_or(d.guards.send.timeout),
                ..d.guards.send
            },
            load_credentials: store,
            save_credentials: store,
        };

        GatewayConfig {
            pool: PoolConfig {
                device_name: self.pool.device_name.unwrap_or(d.device_name),
                restore_on_init: self.pool.restore_on_init.unwrap_or(d.restore_on_init),
                maintenance_interval: self
                    .pool
                    .maintenance_interval
                    .unwrap_or(d.maintenance_interval),
                event_buffer: self.pool.event_buffer.unwrap_or(d.event_buffer),
                reconnect,
                breaker,
                rate_limit,
                gateway_rate_limit,
                pairing,
                guards,
            },
            credentials_dir: self.credentials.dir,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

fn nonzero(value: Duration, field: &str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// Integer milliseconds (`30000`) or a humantime string (`"30s"`, `"5m"`).
fn de_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Unexpected, Visitor};
    use std::fmt;

    struct OptVisitor;
    struct DurationVisitor;

    impl<'de> Visitor<'de> for OptVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("integer milliseconds or a duration string (e.g., \"30s\")")
        }
        fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_some<D2>(self, d2: D2) -> Result<Self::Value, D2::Error>
        where
            D2: serde::Deserializer<'de>,
        {
            d2.deserialize_any(DurationVisitor)
        }
    }

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("integer milliseconds or a duration string (e.g., \"30s\")")
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                return Err(E::invalid_value(Unexpected::Signed(v), &self));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_option(OptVisitor)
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("read error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        PoolError::configuration(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
