// ABOUTME: Error types for the coven-tools crates.
// ABOUTME: Covers config loading, store I/O, HTTP, and (de)serialization failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration store answered, but not with what we asked for.
    #[error("Store returned {status}: {body}")]
    Store { status: u16, body: String },

    /// The store could not be reached or its payload was unusable.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// True for failures worth retrying (request timed out on the wire).
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout(),
            Error::Store { body, .. } | Error::StoreUnavailable(body) => {
                body.to_lowercase().contains("timeout")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
