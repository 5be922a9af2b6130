//! Plugin runtime configuration
//!
//! Layered loading with the `config` crate: built-in defaults, then an
//! optional file, then `PLUGIN_RUNTIME__*` environment variables
//! (e.g. `PLUGIN_RUNTIME__LIFECYCLE__DEFAULT_TIMEOUT=5000`).

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::lifecycle::LifecycleConfig;
use crate::rate_limit::RateLimitConfig;
use crate::registry::RegistryConfig;
use crate::sandbox::SandboxConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PLUGIN_RUNTIME";

/// Runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub registry: RegistryConfig,
    pub lifecycle: LifecycleConfig,
    pub sandbox: SandboxConfig,
    pub rate_limit: RateLimitConfig,
}

impl RuntimeConfig {
    /// Load defaults, then `path` if given, then the environment, and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let defaults = Config::try_from(&Self::default()).map_err(invalid)?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let loaded: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(invalid)?;
        loaded.validate()?;
        debug!(?loaded, "Loaded plugin runtime configuration");
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.registry.validate()?;
        self.lifecycle.validate()?;
        self.sandbox.default_limits.validate()?;
        self.rate_limit.validate()
    }
}

fn invalid(err: config::ConfigError) -> ConfigurationError {
    ConfigurationError::InvalidRuntimeConfig(err.to_string())
}

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
