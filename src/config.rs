use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{CatalogError, EngineSettings, Precedence, SlotCatalog};
use crate::limits::MAX_HOLD_TTL_MS;
use crate::model::TimeOfDay;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither")]
    TlsPair,
    #[error("invalid time grid: {0}")]
    Grid(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before a tenant's log is compacted.
    pub compact_threshold: u64,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub engine: EngineSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let hold_ttl_secs: u64 = env.parse("SLOTBOOK_HOLD_TTL_SECS", 420)?;
        if hold_ttl_secs == 0 || hold_ttl_secs.saturating_mul(1000) > MAX_HOLD_TTL_MS as u64 {
            return Err(env.invalid(
                "SLOTBOOK_HOLD_TTL_SECS",
                format!("must be between 1 and {}", MAX_HOLD_TTL_MS / 1000),
            ));
        }
        let buffer_minutes: u64 = env.parse("SLOTBOOK_BUFFER_MINUTES", 60)?;
        if buffer_minutes > 24 * 60 {
            return Err(env.invalid("SLOTBOOK_BUFFER_MINUTES", "must not exceed one day".into()));
        }
        let sweep_secs: u64 = env.parse("SLOTBOOK_SWEEP_INTERVAL_SECS", 60)?;
        if sweep_secs == 0 {
            return Err(env.invalid("SLOTBOOK_SWEEP_INTERVAL_SECS", "must be positive".into()));
        }
        let max_connections: usize = env.parse("SLOTBOOK_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(env.invalid("SLOTBOOK_MAX_CONNECTIONS", "must be positive".into()));
        }

        let grid_start: TimeOfDay = env.parse_with("SLOTBOOK_GRID_START", "09:00")?;
        let grid_end: TimeOfDay = env.parse_with("SLOTBOOK_GRID_END", "17:30")?;
        let grid_step: u32 = env.parse("SLOTBOOK_GRID_STEP_MINUTES", 30)?;
        let catalog = SlotCatalog::build(grid_start, grid_end, grid_step)?;
        let precedence: Precedence = env.parse_with("SLOTBOOK_AVAILABILITY_PRECEDENCE", "first")?;

        let tls = match (env.get("SLOTBOOK_TLS_CERT"), env.get("SLOTBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        Ok(Self {
            bind: env.get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env.parse("SLOTBOOK_PORT", 5433)?,
            data_dir: env.get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: env.get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections,
            compact_threshold: env.parse("SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            tls,
            metrics_port: env.parse_opt("SLOTBOOK_METRICS_PORT")?,
            sweep_interval: Duration::from_secs(sweep_secs),
            engine: EngineSettings {
                hold_ttl: Duration::from_secs(hold_ttl_secs),
                buffer: Duration::from_secs(buffer_minutes * 60),
                catalog: Arc::new(catalog),
                precedence,
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Set and non-blank.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn invalid(&self, var: &'static str, reason: String) -> ConfigError {
        ConfigError::Invalid {
            var,
            value: self.get(var).unwrap_or_default(),
            reason,
        }
    }

    fn parse_opt<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(var)?.unwrap_or(default))
    }

    /// Like [`Env::parse`], with the default given in its textual form.
    fn parse_with<T>(&self, var: &'static str, default: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(var).unwrap_or_else(|| default.to_string());
        raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        })
    }
}
