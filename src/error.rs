//! Error types for GhanaMap.
//!
//! The map core itself never errors on data conditions: absence and
//! invalidity are reported through `Option` return values. Errors exist
//! only at the host boundary, where configuration is validated or loaded
//! from disk.

use thiserror::Error;

/// GhanaMap error type.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, MapError>;
