//! Crate-wide error type.
//!
//! Component-specific failures that callers branch on (fetching,
//! notifying, persisting) have their own enums next to the component.
//! This type covers startup and plumbing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
