//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stagecraft/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use stagecraft_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STAGECRAFT_DATA_DIR";

/// Resolve the data directory.
///
/// `STAGECRAFT_DATA_DIR` wins; otherwise `~/.stagecraft`, or `.stagecraft` in
/// the working directory when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".stagecraft"))
        .unwrap_or_else(|| PathBuf::from(".stagecraft"))
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: a warning, then the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            if config.max_concurrency == 0 {
                tracing::warn!(
                    "max_concurrency = 0 in {} is invalid, using 1",
                    config_path.display()
                );
                return EngineConfig {
                    max_concurrency: 1,
                    ..config
                };
            }
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_concurrency = 8

[budget]
tokens = 250000

[agent]
base_url = "http://agents:9100"
timeout_secs = 30
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.budget.tokens, Some(250_000));
        assert_eq!(config.agent.base_url, "http://agents:9100");
        assert_eq!(config.agent.timeout_secs, 30);
        assert_eq!(config.server.port, 8080);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_concurrency = \"many\"")
            .await
            .unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_concurrency = 0")
            .await
            .unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_concurrency, 1);
    }
}
