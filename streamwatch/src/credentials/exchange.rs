//! Client-credentials exchange against the platform's OAuth endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::CredentialError;
use crate::config::TwitchConfig;

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// A freshly issued token as reported by the OAuth endpoint.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// One client-credentials exchange.
///
/// Implementations perform exactly one request per call; caching and retry
/// policy belong to the caller.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<IssuedToken, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Twitch app access token exchange (`grant_type=client_credentials`).
pub struct TwitchTokenExchange {
    client: Client,
    oauth_url: String,
    client_id: String,
    client_secret: String,
}

impl TwitchTokenExchange {
    pub fn new(client: Client, config: &TwitchConfig) -> Self {
        Self {
            client,
            oauth_url: config.oauth_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }
}

#[async_trait]
impl TokenExchange for TwitchTokenExchange {
    #[instrument(skip(self), fields(client_id = %self.client_id))]
    async fn exchange(&self) -> Result<IssuedToken, CredentialError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CredentialError::MissingCredentials);
        }

        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let response = self.client.post(&self.oauth_url).form(&form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token exchange rejected");
            return Err(match status.as_u16() {
                400 | 401 | 403 => CredentialError::InvalidCredentials(body),
                code => CredentialError::ExchangeFailed { status: code, body },
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::ParseError(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(CredentialError::ParseError(
                "empty access_token in token response".to_string(),
            ));
        }

        debug!(
            token_type = token.token_type.as_deref().unwrap_or("unknown"),
            expires_in = ?token.expires_in,
            "Token exchange succeeded"
        );

        Ok(IssuedToken {
            access_token: token.access_token,
            expires_in: token
                .expires_in
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parsing() {
        let token: TokenResponse = serde_json::from_str(
            r#"{"access_token":"jostpf5q0uzmxmkba9iyug38kjtgh","expires_in":5011271,"token_type":"bearer"}"#,
        )
        .unwrap();
        assert_eq!(token.access_token, "jostpf5q0uzmxmkba9iyug38kjtgh");
        assert_eq!(token.expires_in, Some(5011271));

        let minimal: TokenResponse = serde_json::from_str(r#"{"access_token":"t"}"#).unwrap();
        assert!(minimal.expires_in.is_none());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        crate::utils::http_client::install_rustls_provider();
        let exchange = TwitchTokenExchange::new(Client::new(), &TwitchConfig::default());
        let err = exchange.exchange().await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingCredentials));
    }
}
