//! Configuration types and loading for asksql.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{APP_NAME, Error, env_prefix};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the session store database.
    pub database: PathBuf,

    /// Warehouse queried by generated SQL.
    pub warehouse: WarehouseConfig,

    /// Completion provider settings.
    pub llm: LlmConfig,

    /// Context index settings.
    pub index: IndexConfig,

    /// Pipeline tuning.
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);

        Self {
            database: data_dir.join("sessions.db"),
            warehouse: WarehouseConfig {
                path: data_dir.join("analytics.db"),
                ..WarehouseConfig::default()
            },
            llm: LlmConfig::default(),
            index: IndexConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a specific file, then apply `ASKSQL_*` overrides.
    ///
    /// Nested keys use a double underscore, e.g. `ASKSQL_LLM__API_KEY`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(&env_prefix())
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME)
            .join("config.toml")
    }

    /// Save configuration to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure config exists at the given path, creating defaults if missing.
    pub fn ensure_at(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut config = Self::default();
            config.expand_paths();
            config.save_to_path(path)?;
        }
        Self::load_from_path(path)
    }

    /// Expand a path, replacing ~ with home directory.
    pub fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::full(path)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| path.to_string());
        PathBuf::from(expanded)
    }

    fn expand_paths(&mut self) {
        self.database = Self::expand_path(&self.database.to_string_lossy());
        self.warehouse.path = Self::expand_path(&self.warehouse.path.to_string_lossy());
        self.index.knowledge_file = self
            .index
            .knowledge_file
            .as_ref()
            .map(|p| Self::expand_path(&p.to_string_lossy()));
    }

    fn validate(&self) -> Result<()> {
        if self.warehouse.max_rows == 0 {
            return Err(Error::Config("warehouse.max_rows must be > 0".to_string()));
        }
        if self.index.dimensions == 0 {
            return Err(Error::Config("index.dimensions must be > 0".to_string()));
        }
        if self.llm.timeout_secs == 0
            || self.warehouse.timeout_secs == 0
            || self.index.timeout_secs == 0
        {
            return Err(Error::Config("timeouts must be > 0 seconds".to_string()));
        }
        Ok(())
    }
}

/// Warehouse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// SQLite warehouse file. Opened read-only.
    pub path: PathBuf,

    /// Maximum rows returned by a single query.
    pub max_rows: usize,

    /// Statement timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("analytics.db"),
            max_rows: 1000,
            timeout_secs: 30,
        }
    }
}

/// Completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider family: "openai", "groq", "ollama" or "gemini".
    pub provider: String,

    /// API base URL. Empty means the provider's default.
    pub base_url: String,

    /// API key, if the provider needs one.
    pub api_key: Option<String>,

    /// Model name passed to the provider.
    pub model: String,

    /// Token budget for a single completion.
    pub max_tokens: u32,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Delay before the single retry of a transient failure.
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: String::new(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2000,
            timeout_secs: 60,
            retry_backoff_ms: 2000,
        }
    }
}

/// Context index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Fragments retrieved per question (clamped to 1..=8).
    pub top_k: usize,

    /// OpenAI-compatible embeddings endpoint; the local hashing embedder is used when unset.
    pub embedding_endpoint: Option<String>,

    /// Model name sent to the embeddings endpoint.
    pub embedding_model: Option<String>,

    /// Bearer token for the embeddings endpoint.
    pub embedding_api_key: Option<String>,

    /// Vector size of the local hashing embedder.
    pub dimensions: usize,

    /// TOML file with curated knowledge replacing the built-in set.
    pub knowledge_file: Option<PathBuf>,

    /// Embedding request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            embedding_endpoint: None,
            embedding_model: None,
            embedding_api_key: None,
            dimensions: 256,
            knowledge_file: None,
            timeout_secs: 15,
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prior turns shown to the question refiner.
    pub history_turns: usize,

    /// Rows rendered into the answer prompt.
    pub synthesis_row_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_turns: 6,
            synthesis_row_cap: 20,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
