//! TLS listener for the mutating webhook

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

/// Serve [`super::router`] over TLS until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    cert: &Path,
    key: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    // rustls 0.23 needs a process-wide provider installed once
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tls_config = RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| Error::ConfigError(format!("webhook TLS config: {e}")))?;

    let handle = Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }

    info!(addr = %addr, "Starting admission webhook server");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(super::router().into_make_service())
        .await
        .map_err(|e| Error::ConfigError(format!("webhook server: {e}")))
}
