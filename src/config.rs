use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub spaces_root: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub payload_chunk_size: usize,
}

fn default_chunk_size() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_enabled")]
    pub enabled: bool,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: default_index_enabled(),
            path: default_index_path(),
        }
    }
}

fn default_index_enabled() -> bool {
    true
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Default configuration rooted at `dir`: spaces under `dir/spaces`,
    /// the index at `dir/index.sqlite`.
    pub fn for_root(dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                spaces_root: dir.join("spaces"),
                payload_chunk_size: default_chunk_size(),
            },
            index: IndexConfig {
                enabled: true,
                path: dir.join("index.sqlite"),
            },
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.storage.payload_chunk_size == 0 {
        anyhow::bail!("storage.payload_chunk_size must be > 0");
    }

    if config.query.default_limit == 0 {
        anyhow::bail!("query.default_limit must be >= 1");
    }

    if config.query.default_limit > config.query.max_limit {
        anyhow::bail!(
            "query.default_limit ({}) must not exceed query.max_limit ({})",
            config.query.default_limit,
            config.query.max_limit
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            spaces_root = "/tmp/spaces"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.storage.payload_chunk_size, 1024);
        assert!(config.index.enabled);
        assert_eq!(config.query.default_limit, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            spaces_root = "/tmp/spaces"
            payload_chunk_size = 0
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_default_limit_above_max() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            spaces_root = "/tmp/spaces"

            [query]
            default_limit = 50
            max_limit = 20
            "#,
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("max_limit"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/strata.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/strata.toml"));
    }
}
