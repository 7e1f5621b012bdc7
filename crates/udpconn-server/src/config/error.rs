use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on configuration file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config.toml: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("failed to serialize config.toml: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
    #[error("configuration validation failed: {reason}")]
    Validation { reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
