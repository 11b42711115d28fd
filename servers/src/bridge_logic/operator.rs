//! Operator-facing status server.
//!
//! Only started once the initial sensor snapshot is complete, so reaching
//! `/health` doubles as a readiness probe for the whole bridge.

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct OperatorServer {
    host: String,
    port: u16,
}

/// Handle to a running server. Dropping it also shuts the server down, but
/// without waiting for in-flight requests; prefer `stop`.
pub struct OperatorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl OperatorServer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    pub async fn start(&self) -> std::io::Result<OperatorHandle> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler));

        let host = if self.host.is_empty() { "0.0.0.0" } else { &self.host };
        let listener = tokio::net::TcpListener::bind((host, self.port)).await?;
        let addr: SocketAddr = listener.local_addr()?;
        log::info!("Operator server listening on {}", addr);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                    log::info!("Operator server shutting down.");
                })
                .await;
            if let Err(err) = served {
                log::error!("Operator server error: {}", err);
            }
        });

        Ok(OperatorHandle { shutdown, task })
    }
}

impl OperatorHandle {
    /// Stop the server and wait for in-flight requests to finish, without a
    /// forced timeout.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn status_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop() {
        let server = OperatorServer::new("127.0.0.1", 0);
        let handle = server.start().await.unwrap();
        handle.stop().await;
    }
}
