// ABOUTME: PostgreSQL connection helpers with TLS and retry support
// ABOUTME: Spawns the connection driver task and masks passwords in logs

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, strip_password_from_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy. Only the first call has any effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialized, ignoring");
    }
    if allow_self_signed {
        tracing::warn!("Accepting self-signed TLS certificates (insecure)");
    }
}

fn allow_self_signed() -> bool {
    *ALLOW_SELF_SIGNED.get().unwrap_or(&false)
}

/// Connect to PostgreSQL and spawn the connection driver.
///
/// The returned client is usable immediately; connection-level errors after
/// startup are logged by the driver task.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let display_url = strip_password_from_url(url);
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", display_url))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    tracing::debug!("Connected to {}", display_url);
    Ok(client)
}

/// Connect with a few retries for transient network failures at startup.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}
