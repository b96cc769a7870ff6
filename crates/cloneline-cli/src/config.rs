//! Configuration loading from TOML files

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use cloneline_core::DEFAULT_QUEUE_CAPACITY;

/// Global configuration for cloneline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub workers: WorkersConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(deserialize_with = "deserialize_env_path")]
    pub default_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_dir: PathBuf::from("./shards"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default: usize,
    pub max: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            default: cpus.min(8),
            max: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// File extensions to tokenize.
    pub extensions: Vec<String>,
    /// Files larger than this are skipped (bytes).
    pub max_file_bytes: u64,
    /// Capacity of each stage queue.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extensions: ["java", "js", "py", "c", "h", "cpp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_file_bytes: 16 * 1024 * 1024,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Deserialize a path that may contain an environment variable reference
/// like ${VAR}
fn deserialize_env_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PathBuf::from(expand_env_var(&s)))
}

/// Expand a whole-string ${VAR} reference to its value; anything else
/// passes through unchanged.
fn expand_env_var(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        if let Ok(value) = std::env::var(var_name) {
            return value;
        }
    }
    s.to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./cloneline.toml (current directory)
    /// 2. ~/.config/cloneline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("cloneline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "cloneline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
