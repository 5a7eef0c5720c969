//! Crate error type.
//!
//! Component errors with their own retry semantics (credentials, status
//! queries, delivery) live next to their components; this type covers
//! storage, configuration and startup.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry storage: {0}")]
    Database(#[from] sqlx::Error),

    #[error("registry migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored data that cannot be mapped back to domain types.
    #[error("corrupt registry data: {0}")]
    Corrupt(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("logging setup: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("Watch", "1/alpha");
        assert_eq!(err.to_string(), "Watch 1/alpha not found");
    }

    #[test]
    fn test_io_is_transparent() {
        let err: Error = std::io::Error::other("disk gone").into();
        assert_eq!(err.to_string(), "disk gone");
    }
}
