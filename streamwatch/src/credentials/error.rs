//! Credential error types.

use thiserror::Error;

/// Errors that can occur while obtaining an access token.
///
/// `Clone` because the result of one in-flight exchange is handed to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// No client id or secret configured.
    #[error("Missing client credentials")]
    MissingCredentials,

    /// The OAuth endpoint rejected the client id or secret.
    #[error("Invalid client credentials: {0}")]
    InvalidCredentials(String),

    /// The exchange returned an unexpected status.
    #[error("Token exchange failed with status {status}: {body}")]
    ExchangeFailed { status: u16, body: String },

    /// Network error.
    #[error("Network error: {0}")]
    Network(String),

    /// The token response could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl CredentialError {
    /// Check if this error needs an operator to fix the configuration.
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::MissingCredentials | Self::InvalidCredentials(_))
    }

    /// Check if this error is transient and may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::ExchangeFailed { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::ParseError(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
