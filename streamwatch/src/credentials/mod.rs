//! Credential management module.
//!
//! This module owns the app access token used for the status API.
//!
//! # Architecture
//!
//! - [`TokenExchange`]: the client-credentials exchange against the OAuth endpoint
//! - [`CredentialManager`]: caches the token and serializes refreshes
//! - [`AccessToken`]: opaque bearer value with an absolute expiry

mod error;
mod exchange;
mod manager;
mod token;

pub use error::CredentialError;
pub use exchange::{IssuedToken, TokenExchange, TwitchTokenExchange};
pub use manager::CredentialManager;
pub use token::AccessToken;
