//! Typed, layered-loadable runtime configuration (§6, §10.3).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::repository::SortSpec;

/// Every tunable enumerated in §6's configuration table, `Default`-able for
/// pure in-code construction (the common path for a library) and, behind
/// the `env-config` feature, loadable the way the teacher's
/// `arcana-config::ConfigLoader` layers `default.toml` + environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendaConfig {
    /// Poll interval, in milliseconds. Default 5000.
    #[serde(default = "default_process_every_ms")]
    pub process_every_ms: u64,

    /// Global running cap across all names. 0 = unlimited. Default 20.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Per-name concurrency when a `define` call doesn't declare one. Default 5.
    #[serde(default = "default_default_concurrency")]
    pub default_concurrency: u32,

    /// Global locked cap. 0 = unlimited. Default 0.
    #[serde(default)]
    pub lock_limit: u32,

    /// Per-name default lock limit. Default 0.
    #[serde(default)]
    pub default_lock_limit: u32,

    /// Default lock TTL, in milliseconds. Default 600000.
    #[serde(default = "default_lock_lifetime_ms")]
    pub default_lock_lifetime_ms: u64,

    /// Instance identifier, stored in `last_modified_by`.
    #[serde(default = "default_instance_name")]
    pub name: String,

    /// Ask the backend to materialize its recommended indexes on startup.
    #[serde(default)]
    pub ensure_index: bool,

    /// Tiebreak sort applied to claim and list queries when the caller
    /// doesn't specify one. Default `(nextRunAt asc, priority desc)`.
    #[serde(default)]
    pub sort: SortSpec,
}

impl Default for AgendaConfig {
    fn default() -> Self {
        Self {
            process_every_ms: default_process_every_ms(),
            max_concurrency: default_max_concurrency(),
            default_concurrency: default_default_concurrency(),
            lock_limit: 0,
            default_lock_limit: 0,
            default_lock_lifetime_ms: default_lock_lifetime_ms(),
            name: default_instance_name(),
            ensure_index: false,
            sort: SortSpec::default(),
        }
    }
}

fn default_process_every_ms() -> u64 {
    5_000
}

fn default_max_concurrency() -> u32 {
    20
}

fn default_default_concurrency() -> u32 {
    5
}

fn default_lock_lifetime_ms() -> u64 {
    600_000
}

fn default_instance_name() -> String {
    format!("agenda-{}", uuid::Uuid::now_v7())
}

impl AgendaConfig {
    pub fn process_every(&self) -> Duration {
        Duration::from_millis(self.process_every_ms)
    }

    pub fn default_lock_lifetime(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.default_lock_lifetime_ms as i64)
    }
}

/// Loads [`AgendaConfig`] the way the teacher's `ConfigLoader` layers
/// `config/default.toml` with `AGENDA__`-prefixed environment overrides
/// (double underscore is the nesting separator, matching `config`'s
/// `Environment::separator`).
#[cfg(feature = "env-config")]
pub mod loader {
    use super::AgendaConfig;
    use crate::error::{AgendaError, AgendaResult};
    use config::{Config, Environment, File};
    use std::path::Path;
    use tracing::debug;

    /// Loads from `{config_dir}/default.toml` (if present), then applies
    /// `AGENDA__FIELD_NAME` environment overrides.
    pub fn load(config_dir: &str) -> AgendaResult<AgendaConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!(error = %e, "no .env file found, continuing with process environment only");
        }

        let mut builder = Config::builder();

        let default_path = format!("{config_dir}/default.toml");
        if Path::new(&default_path).exists() {
            builder = builder.add_source(File::with_name(&default_path).required(false));
        }

        builder = builder.add_source(Environment::with_prefix("AGENDA").separator("__").try_parsing(true));

        let config = builder
            .build()
            .map_err(|e| AgendaError::Configuration(e.to_string()))?;

        config.try_deserialize().map_err(|e| AgendaError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = AgendaConfig::default();
        assert_eq!(config.process_every_ms, 5_000);
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.default_concurrency, 5);
        assert_eq!(config.default_lock_lifetime_ms, 600_000);
    }
}
