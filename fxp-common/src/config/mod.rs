mod defaults;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use defaults::*;
use serde::{Deserialize, Serialize};
use tracing::*;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Lowest request identifier handed out by the client protocol
    #[serde(default = "_default_request_id_offset")]
    pub request_id_offset: u32,

    /// Upper bound on memory spent buffering names for a sorted listing
    #[serde(default = "_default_max_names_memory")]
    pub max_names_memory: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_id_offset: _default_request_id_offset(),
            max_names_memory: _default_max_names_memory(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    #[serde(default = "_default_read_chunk_size")]
    pub read_chunk_size: u32,

    /// Byte budget for requests in flight at once
    #[serde(default = "_default_window_size")]
    pub window_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: _default_read_chunk_size(),
            window_size: _default_window_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ScpConfig {
    /// Channel backlog above which the source stops pushing file data
    #[serde(default = "_default_scp_max_backlog")]
    pub max_backlog: usize,

    #[serde(default = "_default_scp_read_chunk_size")]
    pub read_chunk_size: u64,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            max_backlog: _default_scp_max_backlog(),
            read_chunk_size: _default_scp_read_chunk_size(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Names returned per READDIR reply
    #[serde(default = "_default_max_readdir_entries")]
    pub max_readdir_entries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_readdir_entries: _default_max_readdir_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct FxpConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub scp: ScpConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl FxpConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .context("Could not load config")?
            .try_deserialize()
            .context("Could not parse config")
    }
}

pub fn load_config(path: &Path) -> Result<FxpConfig> {
    let config: FxpConfig = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("FXP").separator("__"))
        .build()
        .context("Could not load config")?
        .try_deserialize()
        .context("Could not parse config")?;

    info!(
        "Using config: {path:?} (window: {} bytes, scp backlog: {} bytes)",
        config.transfer.window_size, config.scp.max_backlog,
    );
    Ok(config)
}
