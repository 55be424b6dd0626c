//! Engine configuration loader.
//!
//! Reads a TOML file into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed, so the engine always starts.

use std::path::{Path, PathBuf};

use tasklane_types::config::EngineConfig;

/// File name looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tasklane.toml";

/// Resolve the config path: an explicit path wins, otherwise
/// `tasklane.toml` in the working directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load engine configuration from `path`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise: the parsed config, with defaults for absent fields.
pub async fn load_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(
                parallel_limit = config.context.parallel_limit,
                max_retries = config.retry.max_retries,
                "Loaded {}",
                path.display()
            );
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Render a configuration back to TOML.
pub fn render_config(config: &EngineConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
