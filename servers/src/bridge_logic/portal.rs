//! WebSocket client for the control-system portal.
//!
//! One socket carries both directions of traffic: RPC requests multiplexed by
//! id, and asynchronous sensor-update frames. An IO task owns the socket;
//! callers hold a cheap cloneable handle and await oneshot responders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::Uri;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use crate::bridge_logic::model::{
    InboundFrame, PortalRequest, SensorUpdate, Sitemap, StrategyResult,
};
use crate::bridge_logic::tracker::SamplingSetup;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("invalid portal URL: {0}")]
    Url(#[from] http::uri::InvalidUri),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("portal connection closed")]
    Closed,
    #[error("portal request failed: {0}")]
    Remote(String),
    #[error("unexpected portal response: {0}")]
    BadResponse(String),
}

enum Command {
    Request {
        request: PortalRequest,
        responder: oneshot::Sender<Result<Value, PortalError>>,
    },
    Disconnect,
}

/// Handle to the portal connection. Cloning shares the underlying socket.
#[derive(Clone)]
pub struct PortalClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl PortalClient {
    /// Connect to the portal. Returns the client handle and the channel on
    /// which sensor updates arrive; the channel closes when the connection
    /// drops.
    pub async fn connect(
        url: &str,
    ) -> Result<(PortalClient, mpsc::UnboundedReceiver<SensorUpdate>), PortalError> {
        let uri: Uri = url.parse()?;
        log::info!("Connecting to portal: {}", uri);
        let (ws_stream, _) = connect_async(uri).await?;
        log::info!("Connected to portal");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        tokio::spawn(io_task(ws_stream, cmd_rx, update_tx));

        let client = PortalClient {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        Ok((client, update_rx))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PortalError> {
        let request = PortalRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };
        let (responder, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { request, responder })
            .map_err(|_| PortalError::Closed)?;
        response.await.map_err(|_| PortalError::Closed)?
    }

    pub async fn sitemap(&self) -> Result<Sitemap, PortalError> {
        let result = self.request("sitemap", json!({})).await?;
        serde_json::from_value(result).map_err(|err| PortalError::BadResponse(err.to_string()))
    }

    /// Resolve the control-system name of a subarray component (`sub`, `cbf`
    /// or `sdp`).
    pub async fn subarray_lookup(&self, component: &str) -> Result<String, PortalError> {
        let result = self
            .request("subarray_lookup", json!({ "component": component }))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PortalError::BadResponse(format!("expected a name, got {}", result)))
    }

    /// Subscribe to one or more sensors. Returns the number of matching
    /// channels reported by the portal.
    pub async fn subscribe(&self, namespace: &str, sensors: &[String]) -> Result<u64, PortalError> {
        let result = self
            .request(
                "subscribe",
                json!({ "namespace": namespace, "sensors": sensors }),
            )
            .await?;
        result
            .as_u64()
            .ok_or_else(|| PortalError::BadResponse(format!("expected a count, got {}", result)))
    }

    pub async fn set_sampling_strategy(
        &self,
        namespace: &str,
        sensor: &str,
        strategy: &str,
    ) -> Result<StrategyResult, PortalError> {
        let result = self
            .request(
                "set_sampling_strategy",
                json!({ "namespace": namespace, "sensor": sensor, "strategy": strategy }),
            )
            .await?;
        serde_json::from_value(result).map_err(|err| PortalError::BadResponse(err.to_string()))
    }

    /// Unsubscribe from the given sensors, or from everything in the
    /// namespace when `sensors` is `None`.
    pub async fn unsubscribe(
        &self,
        namespace: &str,
        sensors: Option<&[String]>,
    ) -> Result<(), PortalError> {
        self.request(
            "unsubscribe",
            json!({ "namespace": namespace, "sensors": sensors }),
        )
        .await?;
        Ok(())
    }

    /// Ask the IO task to close the socket. Safe to call on a connection that
    /// already dropped.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

async fn io_task<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    update_tx: mpsc::UnboundedSender<SensorUpdate>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws_stream.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, PortalError>>> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Request { request, responder }) => {
                        let frame = match serde_json::to_string(&request) {
                            Ok(frame) => frame,
                            Err(err) => {
                                let _ = responder.send(Err(PortalError::BadResponse(err.to_string())));
                                continue;
                            }
                        };
                        log::debug!("Sending request: {}", frame);
                        pending.insert(request.id, responder);
                        if let Err(err) = write.send(WsMessage::Text(frame.into())).await {
                            log::error!("Failed to send portal request: {}", err);
                            break;
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = write.close().await;
                        break;
                    }
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&text, &mut pending, &update_tx);
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("Portal closed the connection");
                        break;
                    }
                    Some(Ok(other)) => {
                        log::warn!("Ignoring unexpected portal frame: {:?}", other);
                    }
                    Some(Err(err)) => {
                        log::error!("Portal connection error: {}", err);
                        break;
                    }
                }
            }
        }
    }

    // Fail anything still in flight so callers are not left hanging
    for (_, responder) in pending.drain() {
        let _ = responder.send(Err(PortalError::Closed));
    }
}

fn handle_frame(
    text: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, PortalError>>>,
    update_tx: &mpsc::UnboundedSender<SensorUpdate>,
) {
    match InboundFrame::parse(text) {
        Ok(InboundFrame::Response(response)) => match pending.remove(&response.id) {
            Some(responder) => {
                let outcome = match response.error {
                    Some(error) => Err(PortalError::Remote(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = responder.send(outcome);
            }
            None => {
                log::warn!("Response for unknown request id {}", response.id);
            }
        },
        Ok(InboundFrame::Updates(updates)) => {
            for update in updates {
                if update_tx.send(update).is_err() {
                    return;
                }
            }
        }
        Err(err) => {
            log::warn!("Failed to parse portal frame: {} ({})", err, text);
        }
    }
}

/// Adapter giving the subscription tracker a way to set sampling strategies
/// through the portal.
pub struct PortalSampling<'a> {
    pub portal: &'a PortalClient,
    pub namespace: &'a str,
}

impl SamplingSetup for PortalSampling<'_> {
    async fn set_strategy(&mut self, name: &str, strategy: &str) -> Result<(), String> {
        match self
            .portal
            .set_sampling_strategy(self.namespace, name, strategy)
            .await
        {
            Ok(result) if result.success => Ok(()),
            Ok(result) => Err(result.info),
            Err(err) => Err(err.to_string()),
        }
    }
}
