//! Small helpers for loading config structs the way every binary in the workspace does it:
//! a required JSON (or TOML) file on disk, deserialized with serde and failing loudly if
//! it's missing or malformed. Grounded on the `serde_json::from_reader` pattern the
//! authenticator service used for its own config and user files.

use serde::de::DeserializeOwned;
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Open(io::Error),
    ParseJson(serde_json::Error),
    ParseToml(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Open(err) => write!(f, "failed to open config file: {}", err),
            ConfigError::ParseJson(err) => write!(f, "failed to parse config file: {}", err),
            ConfigError::ParseToml(err) => write!(f, "failed to parse config file: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Reads and deserializes a JSON config file from `path`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let file = File::open(path).map_err(ConfigError::Open)?;
    serde_json::from_reader(file).map_err(ConfigError::ParseJson)
}

/// Reads and deserializes a TOML config file from `path`.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(ConfigError::Open)?;
    serdeconv::from_toml_str(&contents).map_err(|err| ConfigError::ParseToml(err.to_string()))
}
