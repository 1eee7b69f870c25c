use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_GRPC_ADDR: &str = "127.0.0.1:50051";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub vector_stores: Vec<String>,
    /// Base URL of the Responses API; defaults to the provider endpoint.
    pub openai_base_url: Option<String>,
    /// Endpoint of the command runner's gRPC service.
    pub runner_endpoint: Option<String>,
    /// Address the websocket server listens on.
    pub ws_addr: Option<String>,
    /// Address the Generate gRPC server listens on.
    pub grpc_addr: Option<String>,
    pub cache_size: Option<usize>,
    /// How many file-search hits to ask the provider for.
    pub max_file_search_results: Option<u32>,
    /// Base URL file-search file names are linked under in the UI.
    pub file_link_base: Option<String>,
}

impl Config {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn ws_addr(&self) -> String {
        self.ws_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_WS_ADDR.to_string())
    }

    pub fn grpc_addr(&self) -> String {
        self.grpc_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_GRPC_ADDR.to_string())
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Configuration("Could not find config directory".to_string()))?
        .join("bosun");

    fs::create_dir_all(&config_dir)
        .map_err(|e| Error::Configuration(format!("Failed to create config directory: {e}")))?;

    Ok(config_dir.join("config.json"))
}

/// Load the configuration, falling back to defaults when no file exists.
pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(Config::default());
    }

    let config_str = fs::read_to_string(&config_path)
        .map_err(|e| Error::Configuration(format!("Failed to read config file: {e}")))?;

    let config: Config = serde_json::from_str(&config_str)
        .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

    Ok(config)
}

/// Save the configuration
pub fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path()?;
    let config_json = serde_json::to_string_pretty(config)
        .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;

    fs::write(&config_path, config_json)
        .map_err(|e| Error::Configuration(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// The provider API key comes from the environment, never the config file.
pub fn api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| Error::Configuration("OPENAI_API_KEY is not set".to_string()))
}
