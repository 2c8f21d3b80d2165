use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use upstream_guard_core::PipelineConfig;
use validator::Validate;

use crate::logging::LogFormat;

pub const ENV_PREFIX: &str = "UPSTREAM_GUARD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "upstream_guard=info,upstream_guard_pipeline=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogSettings,
    #[validate(nested)]
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load `config/default`, `config/local` and `UPSTREAM_GUARD__*` overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config"))
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        Self::load_with_env(dir, environment())
    }

    /// Same as [`AppConfig::load_from`] with an explicit environment source.
    pub fn load_with_env(dir: &Path, env: Environment) -> Result<Self> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
            .add_source(File::with_name(&dir.join("local").to_string_lossy()).required(false))
            .add_source(env)
            .build()
            .with_context(|| format!("failed to read configuration from {}", dir.display()))?;

        let app: AppConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        app.validate().context("configuration failed validation")?;
        Ok(app)
    }
}

/// `UPSTREAM_GUARD__PIPELINE__QUEUE__MAX_CONCURRENT=8` sets `pipeline.queue.max_concurrent`.
pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
