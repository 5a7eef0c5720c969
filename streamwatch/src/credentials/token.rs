use std::fmt;
use std::time::{Duration, Instant};

/// Longest lifetime trusted from the token endpoint (one year).
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An app access token and the instant it stops being valid.
///
/// The bearer value is only reachable through [`AccessToken::secret`] and
/// never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    /// Create a token valid for `lifetime` from now.
    ///
    /// Lifetimes beyond [`MAX_TOKEN_LIFETIME`] are clamped to it.
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now
            .checked_add(lifetime.min(MAX_TOKEN_LIFETIME))
            .unwrap_or(now);
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// The bearer value, for the `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the token stays valid for longer than `margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.remaining() > margin
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("remaining", &self.remaining())
            .finish()
    }
}
