//! YAML runtime configuration.
//!
//! Boot-time counterpart of the hot-reload store: the file carries the
//! listener/pool/breaker/backfill settings plus the initial conversion
//! snapshot. Every section has defaults so a minimal file only needs the
//! backend address and the tables map.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConversionSnapshot, TableRule};
use crate::exception::{QuotientError, QuotientResult};
use crate::rounding::RoundingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy: ListenerSettings,
    pub backend: BackendSettings,
    pub circuit_breaker: BreakerSettings,
    pub conversion: ConversionSettings,
    pub backfill: BackfillSettings,
    pub logging: LoggingSettings,
    pub tables: HashMap<String, TableRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub host: String,
    pub port: u16,
    /// Maximum concurrently leased backend connections.
    pub pool_size: usize,
    /// Maximum idle connections retained for reuse.
    pub max_idle: usize,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub max_idle_secs: u64,
    pub max_age_secs: u64,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub cooldown_ms: u64,
    pub max_probes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub ratio: u32,
    pub precision: u32,
    pub rounding_mode: RoundingMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub enabled: bool,
    /// MySQL connection URL for the backfill engine's own connections.
    pub database_url: String,
    pub id_column: String,
    pub batch_size: u32,
    pub sleep_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy: ListenerSettings::default(),
            backend: BackendSettings::default(),
            circuit_breaker: BreakerSettings::default(),
            conversion: ConversionSettings::default(),
            backfill: BackfillSettings::default(),
            logging: LoggingSettings::default(),
            tables: HashMap::new(),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3307,
            max_sessions: 512,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            pool_size: 10,
            max_idle: 10,
            connect_timeout_ms: 5_000,
            acquire_timeout_ms: 5_000,
            max_idle_secs: 300,
            max_age_secs: 1_800,
            reap_interval_secs: 30,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            cooldown_ms: 30_000,
            max_probes: 3,
        }
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            ratio: 1000,
            precision: 4,
            rounding_mode: RoundingMode::Bankers,
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: String::new(),
            id_column: "id".to_string(),
            batch_size: 1_000,
            sleep_interval_ms: 100,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> QuotientResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QuotientError::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> QuotientResult<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| QuotientError::invalid_config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> QuotientResult<()> {
        if self.proxy.port == 0 {
            return Err(QuotientError::invalid_config("proxy port is required"));
        }
        if self.backend.host.is_empty() {
            return Err(QuotientError::invalid_config("backend host is required"));
        }
        if self.backend.port == 0 {
            return Err(QuotientError::invalid_config("backend port is required"));
        }
        if self.backend.pool_size == 0 {
            return Err(QuotientError::invalid_config("pool size must be positive"));
        }
        if self.backfill.enabled && self.backfill.database_url.is_empty() {
            return Err(QuotientError::invalid_config(
                "backfill requires a database_url",
            ));
        }
        self.snapshot().validate()
    }

    /// Assemble the initial conversion snapshot from the conversion section
    /// and the tables map.
    pub fn snapshot(&self) -> ConversionSnapshot {
        ConversionSnapshot {
            ratio: self.conversion.ratio,
            precision: self.conversion.precision,
            rounding_mode: self.conversion.rounding_mode,
            tables: self.tables.clone(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend.host, self.backend.port)
    }
}

impl BackendSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl BackfillSettings {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
