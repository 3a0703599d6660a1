//! Web server module

mod push;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::config::{Config, PushConfig};
use crate::gate::ConcurrencyGate;
use crate::serializer::SharedSerializer;
use crate::stream::RecordStream;

pub struct AppState {
    pub gate: ConcurrencyGate,
    pub stream: Arc<dyn RecordStream>,
    pub serializer: SharedSerializer,
    pub config: PushConfig,
}

impl AppState {
    pub fn new(
        stream: Arc<dyn RecordStream>,
        serializer: SharedSerializer,
        config: &PushConfig,
    ) -> Self {
        let config = config.clone().with_defaults();
        Self {
            gate: ConcurrencyGate::new(config.max_concurrency),
            stream,
            serializer,
            config,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(push::push_handler))
        .route("/push", post(push::push_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Healthy while the writer still accepts records
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.stream.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "closed")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// Serve until SIGINT/SIGTERM, then let in-flight requests finish.
pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    if config.tls_enabled() {
        let tls = RustlsConfig::from_pem_file(&config.server.tls_cert, &config.server.tls_key)
            .await
            .context("failed to load TLS certificate and key")?;
        let socket_addr = tokio::net::lookup_host(&addr)
            .await?
            .next()
            .with_context(|| format!("could not resolve {}", addr))?;

        let handle = axum_server::Handle::new();
        let grace = Duration::from_secs(config.server.shutdown_grace_secs);
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(grace));
        });

        info!("Push endpoint listening on https://{}", socket_addr);
        axum_server::bind_rustls(socket_addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Push endpoint listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight requests");
}
