use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Server configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Address the request listener binds to.
    pub listen: Option<SocketAddr>,
    /// Cap on concurrently registered socket peers.
    pub max_sockets: Option<usize>,
    /// Consoles to register at startup.
    #[serde(default)]
    pub consoles: Vec<ConsoleDef>,
}

/// A single console entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleDef {
    /// Unique console name, matched by client patterns.
    pub name: String,
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file
    /// doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
