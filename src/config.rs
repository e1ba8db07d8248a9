/// Engine configuration, loaded from RON with environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Module schema file. The packaged schema is used when unset.
    pub modules_path: Option<PathBuf>,
    /// Prompt catalog file. The packaged catalog is used when unset.
    pub prompts_path: Option<PathBuf>,
    pub generator: GeneratorConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
    pub credentials: CredentialsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("worldsmith.db"),
            modules_path: None,
            prompts_path: None,
            generator: GeneratorConfig::default(),
            worker: WorkerConfig::default(),
            log: LogConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub model: String,
    /// Bound on a single generator call, HTTP and workflow alike.
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 120,
            temperature: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    /// Upper bound of the random delay added to each idle poll.
    pub idle_jitter_ms: u64,
    /// A `RUNNING` job older than this is considered abandoned.
    pub lease_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            idle_jitter_ms: 500,
            lease_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive. `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Environment variable holding the shared fallback key.
    pub api_key_env: Option<String>,
    pub owners: BTreeMap<String, OwnerCredentials>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            api_key_env: Some("WORLDSMITH_API_KEY".to_string()),
            owners: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerCredentials {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl EngineConfig {
    pub fn parse_ron(input: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a RON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::parse_ron(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// `WORLDSMITH_DATABASE`, `WORLDSMITH_LOG`, `WORLDSMITH_BASE_URL` and
    /// `WORLDSMITH_MODEL` replace their settings when set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("WORLDSMITH_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("WORLDSMITH_LOG") {
            self.log.level = v;
        }
        if let Some(v) = get("WORLDSMITH_BASE_URL") {
            self.generator.base_url = v;
        }
        if let Some(v) = get("WORLDSMITH_MODEL") {
            self.generator.model = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generator.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "generator.timeout_secs must be positive".to_string(),
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.worker.lease_timeout_secs <= self.generator.timeout_secs {
            return Err(ConfigError::Invalid(
                "worker.lease_timeout_secs must exceed generator.timeout_secs".to_string(),
            ));
        }
        Ok(())
    }
}
