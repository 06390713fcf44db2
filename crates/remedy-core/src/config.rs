//! Engine configuration loader.
//!
//! Reads `engine.toml` and deserializes it into [`EngineConfig`]. The lenient
//! loader falls back to defaults when the file is missing or malformed; the
//! strict parser reports errors instead.

use std::path::Path;

use remedy_types::config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid engine config: {0}")]
    Invalid(String),
}

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse or validate, logs a warning and
///   returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No engine config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to load {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Parse and check an engine config document.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;

    if !(0.0..=1.0).contains(&config.preservation_threshold) {
        return Err(ConfigError::Invalid(format!(
            "preservation_threshold {} must be within [0, 1]",
            config.preservation_threshold
        )));
    }
    if let Some(max) = config.max_plan_complexity
        && !(0.0..=1.0).contains(&max)
    {
        return Err(ConfigError::Invalid(format!(
            "max_plan_complexity {max} must be within [0, 1]"
        )));
    }
    if !(0.0..=1.0).contains(&config.retry.jitter) {
        return Err(ConfigError::Invalid(format!(
            "retry.jitter {} must be within [0, 1]",
            config.retry.jitter
        )));
    }
    if config.resources.cpu <= 0.0 || config.resources.memory <= 0.0 {
        return Err(ConfigError::Invalid(
            "resource budgets must be positive".to_string(),
        ));
    }

    Ok(config)
}
