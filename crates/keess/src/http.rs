//! Liveness and metrics endpoints.
use std::net::SocketAddr;

use axum::{Router, http::StatusCode, routing::get};
use prometheus::TextEncoder;
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("http server failed"))]
    Serve { source: std::io::Error },
}

/// Serves `/health` and `/metrics` until shutdown is signalled.
pub async fn serve(address: SocketAddr, mut shutdown: watch::Receiver<()>) -> Result<(), Error> {
    let router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics));

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(%address, "serving health and metrics");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context(ServeSnafu)
}

/// Returns 200 while the process is live.
async fn health() -> &'static str {
    "ok"
}

async fn metrics() -> Result<String, StatusCode> {
    let mut body = String::new();
    TextEncoder::new()
        .encode_utf8(&prometheus::gather(), &mut body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_answers() {
        assert_eq!(health().await, "ok");
    }

    #[tokio::test]
    async fn metrics_render_in_text_format() {
        crate::metrics::CREDENTIALS_RELOADS.inc();
        let body = metrics().await.expect("metrics encode");
        assert!(body.contains("keess_credentials_reloads_total"));
    }
}
