//! API HTTP server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::handlers::{
    health_handler, inbound_handler, ping_handler, send_sms_handler, send_ussd_handler,
    sms_status_handler, stats_handler,
};
use super::tls::{build_tls_acceptor, TlsListener};
use super::ApiState;
use crate::config::ServerConfig;

/// Build the API router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/ping", get(ping_handler))
        .route("/api/v1/sms", post(send_sms_handler))
        .route("/api/v1/sms/{id}", get(sms_status_handler))
        .route("/api/v1/inbound/{slot}", get(inbound_handler))
        .route("/api/v1/ussd", post(send_ussd_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/stats", get(stats_handler))
        .with_state(state)
}

/// API HTTP(S) server.
pub struct ApiServer {
    config: ServerConfig,
    state: Arc<ApiState>,
    acceptor: Option<TlsAcceptor>,
}

impl ApiServer {
    /// Create the server. Loads certificate and key when configured.
    pub fn new(config: &ServerConfig, state: Arc<ApiState>) -> io::Result<Self> {
        Ok(Self {
            config: config.clone(),
            state,
            acceptor: build_tls_acceptor(config)?,
        })
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind((self.config.host.as_str(), self.config.port)).await
    }

    /// Serve on `listener` until shutdown. TLS is used when a certificate
    /// is configured.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let acceptor = self.acceptor;
        let address: SocketAddr = listener.local_addr()?;
        let app = router(self.state);
        let stopped = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("API server shutting down");
        };

        info!(
            address = %address,
            tls = acceptor.is_some(),
            min_tls_version = ?self.config.min_tls_version,
            "starting API server"
        );

        match acceptor {
            Some(acceptor) => {
                axum::serve(TlsListener::new(listener, acceptor), app)
                    .with_graceful_shutdown(stopped)
                    .await
            }
            None => axum::serve(listener, app).with_graceful_shutdown(stopped).await,
        }
    }
}
