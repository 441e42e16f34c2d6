//! Configuration loader with layered sources.

use config::{Config, ConfigError, Environment, File};
use conveyor_core::{ConveyorError, ConveyorResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable selecting the environment-specific file.
pub const ENVIRONMENT_VAR: &str = "CONVEYOR_ENVIRONMENT";

/// Default prefix for environment variable overrides.
pub const DEFAULT_ENV_PREFIX: &str = "CONVEYOR";

/// Configuration that can check its own invariants after loading.
pub trait ValidateConfig {
    /// Returns an error describing the first violated invariant.
    fn validate(&self) -> ConveyorResult<()>;
}

/// Where configuration is read from.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    /// Directory holding `default.toml`, `{environment}.toml` and `local.toml`.
    pub config_dir: String,
    /// Environment name; selects `{environment}.toml`.
    pub environment: String,
    /// Prefix for environment variable overrides (`{PREFIX}__SECTION__KEY`).
    pub env_prefix: String,
}

impl ConfigSources {
    /// Sources rooted at `config_dir`, environment taken from `CONVEYOR_ENVIRONMENT`.
    pub fn new(config_dir: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: std::env::var(ENVIRONMENT_VAR)
                .unwrap_or_else(|_| "development".to_string()),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Overrides the environment name.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Overrides the environment variable prefix.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }
}

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader<T> {
    config: Arc<RwLock<T>>,
    sources: ConfigSources,
}

impl<T> ConfigLoader<T>
where
    T: DeserializeOwned + Serialize + ValidateConfig + Clone + Send + Sync,
{
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `{dir}/default.toml` - Default values
    /// 2. `{dir}/{environment}.toml` - Environment-specific overrides
    /// 3. `{dir}/local.toml` - Local overrides
    /// 4. Environment variables with the configured prefix
    pub fn new(sources: ConfigSources) -> ConveyorResult<Self> {
        let config = Self::load_config(&sources)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            sources,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> ConveyorResult<Self> {
        Self::new(ConfigSources::new("./config"))
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> T {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from its sources.
    ///
    /// The previous configuration stays in place when the new one is invalid.
    pub async fn reload(&self) -> ConveyorResult<()> {
        let new_config = Self::load_config(&self.sources)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Gets a specific configuration value by dotted key path.
    pub async fn get_value<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }

    fn load_config(sources: &ConfigSources) -> ConveyorResult<T> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        info!(
            environment = %sources.environment,
            config_dir = %sources.config_dir,
            "Loading configuration"
        );

        let mut builder = Config::builder();

        for name in ["default", sources.environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", sources.config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(&sources.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: T = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;

        Ok(config)
    }
}

fn config_error(err: ConfigError) -> ConveyorError {
    ConveyorError::Configuration(err.to_string())
}
