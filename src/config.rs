use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const APP_DIR: &str = "modelport";
const CONFIG_FILE: &str = "config.json";

/// Default name of the duplex channel opened by clients.
pub const DEFAULT_CHANNEL_NAME: &str = "model-channel";

static CONFIG_LOCK: Mutex<()> = const_mutex(());

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not find config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel_name: String,
    /// minijinja template for the system turn; the built-in one is used when unset.
    pub system_prompt: Option<String>,
    pub daemon: DaemonConfig,
    pub llama: LlamaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            system_prompt: None,
            daemon: DaemonConfig::default(),
            llama: LlamaConfig::default(),
        }
    }
}

/// How a client launches the privileged host process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            program: "modelportd".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    /// Root of an OpenAI-compatible llama.cpp server.
    pub base_url: String,
    /// Where `download-model` fetches the weights from.
    pub model_url: Option<String>,
    /// File name under the models directory.
    pub model_file: String,
    /// Expected lowercase hex SHA-256 of the model file.
    pub sha256: Option<String>,
    /// Context window in tokens, reported as the session's input quota.
    pub context_size: u64,
    pub request_timeout_secs: u64,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            model_url: None,
            model_file: "model.gguf".to_string(),
            sha256: None,
            context_size: 4096,
            request_timeout_secs: 10,
        }
    }
}

fn get_config_dir() -> Result<PathBuf, ConfigError> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Directory holding downloaded model files.
pub fn models_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::data_local_dir()
        .ok_or(ConfigError::NoConfigDir)?
        .join(APP_DIR)
        .join("models");
    Ok(dir)
}

/// Loads the config from the default location, falling back to defaults when absent.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let _guard = CONFIG_LOCK.lock();
    let dir = path.parent().ok_or(ConfigError::NoConfigDir)?;
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let content = serde_json::to_string_pretty(config)?;

    // Write to temp file, then atomic rename
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.persist(path).map_err(|e| ConfigError::Io(e.error))?;

    log::debug!("Saved config to {}", path.display());
    Ok(())
}
