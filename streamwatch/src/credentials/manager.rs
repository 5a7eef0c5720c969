//! Access token cache with single-flight refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::CredentialError;
use super::exchange::TokenExchange;
use super::token::AccessToken;

type TokenFuture = Shared<BoxFuture<'static, Result<AccessToken, CredentialError>>>;

#[derive(Default)]
struct TokenState {
    cached: Option<AccessToken>,
    /// Exchange currently running, tagged with its generation.
    in_flight: Option<(u64, TokenFuture)>,
    next_generation: u64,
}

/// Hands out a valid access token, refreshing it when needed.
///
/// At most one exchange runs at a time. Callers arriving while an exchange is
/// in flight await that same exchange and receive its result, whether success
/// or failure. Failures are never cached: the next call starts a new exchange.
pub struct CredentialManager {
    exchange: Arc<dyn TokenExchange>,
    refresh_margin: Duration,
    state: Mutex<TokenState>,
    consecutive_failures: AtomicU32,
}

impl CredentialManager {
    pub fn new(exchange: Arc<dyn TokenExchange>, refresh_margin: Duration) -> Self {
        Self {
            exchange,
            refresh_margin,
            state: Mutex::new(TokenState::default()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Return a token valid for longer than the refresh margin.
    ///
    /// # Cancel Safety
    ///
    /// Dropping this future does not cancel the exchange for other waiters;
    /// the shared exchange is driven by whichever caller polls it next.
    pub async fn get_token(&self) -> Result<AccessToken, CredentialError> {
        let (generation, exchange) = {
            let mut state = self.state.lock();

            if let Some(token) = &state.cached
                && token.is_fresh(self.refresh_margin)
            {
                return Ok(token.clone());
            }

            match &state.in_flight {
                Some((generation, exchange)) => {
                    debug!("Awaiting in-flight token exchange");
                    (*generation, exchange.clone())
                }
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;

                    let exchange = self.start_exchange();
                    state.in_flight = Some((generation, exchange.clone()));
                    (generation, exchange)
                }
            }
        }; // Lock released before awaiting

        let result = exchange.await;
        self.settle(generation, &result);
        result
    }

    /// Drop the cached token if it is still `token`.
    ///
    /// Used when the API rejects a token before its advertised expiry. A token
    /// that has already been replaced is left alone.
    pub fn invalidate(&self, token: &AccessToken) {
        let mut state = self.state.lock();
        if state.cached.as_ref() == Some(token) {
            info!("Discarding rejected access token");
            state.cached = None;
        }
    }

    /// Number of exchanges that failed since the last success.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Whether a token is cached and fresh, without triggering a refresh.
    pub fn has_valid_token(&self) -> bool {
        self.state
            .lock()
            .cached
            .as_ref()
            .is_some_and(|t| t.is_fresh(self.refresh_margin))
    }

    fn start_exchange(&self) -> TokenFuture {
        let exchange = Arc::clone(&self.exchange);
        async move {
            let issued = exchange.exchange().await?;
            Ok(AccessToken::new(issued.access_token, issued.expires_in))
        }
        .boxed()
        .shared()
    }

    /// Record the outcome of exchange `generation`, once.
    fn settle(&self, generation: u64, result: &Result<AccessToken, CredentialError>) {
        let mut state = self.state.lock();

        let is_current = matches!(&state.in_flight, Some((g, _)) if *g == generation);
        if !is_current {
            return;
        }
        state.in_flight = None;

        match result {
            Ok(token) => {
                if token.remaining() <= self.refresh_margin {
                    warn!(
                        lifetime = ?token.remaining(),
                        margin = ?self.refresh_margin,
                        "Issued token lifetime is within the refresh margin"
                    );
                }
                info!(expires_in = ?token.remaining(), "Obtained access token");
                state.cached = Some(token.clone());
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, failures, "Token exchange failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::IssuedToken;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingExchange {
        calls: AtomicUsize,
        lifetime: Duration,
        fail: bool,
        delay: Duration,
    }

    impl CountingExchange {
        fn new(lifetime: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                lifetime,
                fail: false,
                delay: Duration::from_millis(20),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchange for CountingExchange {
        async fn exchange(&self) -> Result<IssuedToken, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(CredentialError::InvalidCredentials("invalid client".into()));
            }
            Ok(IssuedToken {
                access_token: format!("token-{}", n),
                expires_in: self.lifetime,
            })
        }
    }

    fn manager(exchange: Arc<CountingExchange>) -> Arc<CredentialManager> {
        Arc::new(CredentialManager::new(exchange, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let manager = manager(exchange.clone());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        let tokens: Vec<AccessToken> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(exchange.calls(), 1);
        assert!(tokens.iter().all(|t| t.secret() == "token-1"));
        assert!(manager.has_valid_token());
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let manager = manager(exchange.clone());

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_token_within_margin_is_refreshed() {
        // 30s lifetime is inside the 60s margin, so every call refreshes.
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(30)));
        let manager = manager(exchange.clone());

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(exchange.calls(), 2);
        assert_ne!(first.secret(), second.secret());
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let exchange = Arc::new(CountingExchange::failing());
        let manager = manager(exchange.clone());

        let results = futures::future::join_all((0..10).map(|_| manager.get_token())).await;

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(exchange.calls(), 1);
        assert_eq!(manager.failure_count(), 1);
        assert!(!manager.has_valid_token());

        // Next call retries the exchange.
        assert!(manager.get_token().await.is_err());
        assert_eq!(exchange.calls(), 2);
        assert_eq!(manager.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_exchange() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let manager = manager(exchange.clone());

        let stale = manager.get_token().await.unwrap();
        manager.invalidate(&stale);
        let fresh = manager.get_token().await.unwrap();

        assert_eq!(exchange.calls(), 2);
        assert_ne!(stale, fresh);

        // Invalidating the replaced token is a no-op.
        manager.invalidate(&stale);
        assert_eq!(manager.get_token().await.unwrap(), fresh);
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_strand_exchange() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let manager = manager(exchange.clone());

        let early = manager.clone();
        let handle = tokio::spawn(async move { early.get_token().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.abort();
        let _ = handle.await;

        let token = manager.get_token().await.unwrap();
        assert_eq!(token.secret(), "token-1");
        assert_eq!(exchange.calls(), 1);
    }
}
