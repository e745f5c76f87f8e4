use crate::shared::validate_identifier_value;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(String),
    #[error("failed to create cache directory {path}: {source}")]
    CreateCacheDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub const CONFIG_PATH_ENV: &str = "FABSIGHT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "fabsight.yaml";

fn default_db_path() -> PathBuf {
    PathBuf::from("data.sqlite")
}

fn default_docs_path() -> PathBuf {
    PathBuf::from("docs")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("runtime_cache")
}

fn default_model() -> String {
    "gpt-4.1".to_string()
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_query_rows() -> usize {
    1000
}

fn default_loop_bound() -> u32 {
    20
}

fn default_tool_ids() -> Vec<String> {
    vec![
        "8950XR-P1".to_string(),
        "8950XR-P2".to_string(),
        "8950XR-P3".to_string(),
        "8950XR-P4".to_string(),
    ]
}

/// Process configuration for one agent instance. All values are opaque inputs
/// from the loop's perspective; the loop never re-reads them from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_docs_path")]
    pub docs_path: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_query_rows")]
    pub max_query_rows: usize,
    #[serde(default = "default_loop_bound")]
    pub loop_bound: u32,
    #[serde(default = "default_tool_ids")]
    pub tool_ids: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            docs_path: default_docs_path(),
            cache_dir: default_cache_dir(),
            model: default_model(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            max_query_rows: default_max_query_rows(),
            loop_bound: default_loop_bound(),
            tool_ids: default_tool_ids(),
        }
    }
}

impl AgentConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AgentConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(config)
    }

    /// Loads config from an optional file, falling back to defaults, then
    /// applies `FABSIGHT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_path(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("FABSIGHT_DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("FABSIGHT_DOCS_PATH") {
            self.docs_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("FABSIGHT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("FABSIGHT_MODEL") {
            self.model = value;
        }
        if let Some(value) = lookup("FABSIGHT_API_BASE") {
            self.api_base = value;
        }
        if let Some(value) = lookup("FABSIGHT_MAX_QUERY_ROWS") {
            self.max_query_rows = value.parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "FABSIGHT_MAX_QUERY_ROWS must be a positive integer, got `{value}`"
                ))
            })?;
        }
        if let Some(value) = lookup("FABSIGHT_LOOP_BOUND") {
            self.loop_bound = value.parse().map_err(|_| {
                ConfigError::Validation(format!(
                    "FABSIGHT_LOOP_BOUND must be a positive integer, got `{value}`"
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("model must be non-empty".to_string()));
        }
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::Validation(
                "api_base must be non-empty".to_string(),
            ));
        }
        if self.max_query_rows == 0 {
            return Err(ConfigError::Validation(
                "max_query_rows must be at least 1".to_string(),
            ));
        }
        if self.loop_bound == 0 {
            return Err(ConfigError::Validation(
                "loop_bound must be at least 1".to_string(),
            ));
        }
        if self.tool_ids.is_empty() {
            return Err(ConfigError::Validation(
                "tool_ids must name at least one tool".to_string(),
            ));
        }
        for tool in &self.tool_ids {
            validate_identifier_value("tool id", tool).map_err(ConfigError::Validation)?;
        }
        Ok(())
    }

    pub fn ensure_cache_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.cache_dir).map_err(|source| ConfigError::CreateCacheDir {
            path: self.cache_dir.display().to_string(),
            source,
        })
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok()
    }
}
