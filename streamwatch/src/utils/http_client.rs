use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// User agent sent with every outgoing request.
pub const USER_AGENT: &str = concat!("streamwatch/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client shared by the credential and status API calls.
///
/// A zero `timeout` leaves the request timeout unset.
pub fn build_client(timeout: Duration) -> crate::Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if !timeout.is_zero() {
        builder = builder.timeout(timeout);
    }

    Ok(builder.build()?)
}
