// Axum admin handler — exposes store statistics and health over local HTTP.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::session::SessionStore;

#[derive(Debug, Serialize)]
struct Health {
    accepting: bool,
    live_sessions: usize,
    shutdown_clean: Option<bool>,
}

pub struct StatsServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StatsServer {
    /// Start the admin server on a random local port, returning a handle.
    pub async fn start(store: Arc<SessionStore>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .with_state(store);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!("stats server listening on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// GET /stats — statistics snapshot, 404 when tracking is disabled.
async fn stats_handler(State(store): State<Arc<SessionStore>>) -> Response {
    match store.current_statistics() {
        Some(stats) => {
            debug!(
                "stats: sessions={} runners={} size={}",
                stats.session_count, stats.runner_count, stats.store_size
            );
            Json(stats).into_response()
        }
        None => (StatusCode::NOT_FOUND, "statistics tracking is disabled").into_response(),
    }
}

/// GET /health — 200 while accepting sessions, 503 once shutting down.
async fn health_handler(State(store): State<Arc<SessionStore>>) -> Response {
    let health = Health {
        accepting: store.is_accepting(),
        live_sessions: store.live_session_count(),
        shutdown_clean: store.shutdown_was_clean(),
    };
    let status = if health.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}
