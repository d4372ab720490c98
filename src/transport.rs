//! # Relay Transports
//!
//! One abstract seam between the agent and the relay: [`Transport`], with
//! two concrete implementations.
//!
//! - [`HttpTransport`] — stateless pull. `send` POSTs an envelope, `receive`
//!   polls the inbox endpoint. `listen` is unsupported.
//! - [`WebSocketTransport`] — persistent push. Maintains a background
//!   connection task that answers heartbeat pings, reconnects on drop with
//!   capped exponential backoff plus random jitter, and buffers inbound
//!   envelopes until a listener is registered (or `receive` drains them).
//!
//! Envelopes cross this seam as wire-format `serde_json::Value` objects;
//! all signing, verification, and decryption stay above the transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{Result, UamError};

/// Timeout for the initial connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request timeout on the HTTP transport.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnection backoff parameters: `min(BASE * 2^attempt, MAX) + jitter`,
/// jitter uniform in `[0, JITTER)`. The attempt counter resets on every
/// successful connection.
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_JITTER: Duration = Duration::from_secs(1);

/// Push-delivery callback. Tolerates being invoked from a different task
/// than the one that called `connect`.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_envelope(&self, envelope: Value);
}

/// Abstract relay transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish whatever the implementation needs. No-op allowed.
    async fn connect(&self) -> Result<()>;

    /// Release resources. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Deliver one wire-format envelope.
    async fn send(&self, envelope: &Value) -> Result<()>;

    /// Return up to `limit` inbound wire envelopes. Empty is success.
    async fn receive(&self, limit: usize) -> Result<Vec<Value>>;

    /// Register a push handler. Fails on pull transports.
    async fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;
}

// ============================================================================
// HTTP transport (pull)
// ============================================================================

/// Stateless polling transport over the relay REST API.
///
/// A single pooled client is created on `connect` and reused for every
/// request until `disconnect`.
pub struct HttpTransport {
    relay_url: String,
    token: String,
    address: String,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(
        relay_url: impl Into<String>,
        token: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            token: token.into(),
            address: address.into(),
            client: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| UamError::Transport("transport not connected".into()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<()> {
        let mut headers = reqwest::header::HeaderMap::new();
        let bearer = format!("Bearer {}", self.token);
        let mut auth = reqwest::header::HeaderValue::from_str(&bearer)
            .map_err(|_| UamError::Transport("token contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| UamError::Transport(e.to_string()))?;
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.client.write().await = None;
        Ok(())
    }

    async fn send(&self, envelope: &Value) -> Result<()> {
        let client = self.client().await?;
        let resp = client
            .post(format!("{}/api/v1/send", self.relay_url))
            .json(&json!({ "envelope": envelope }))
            .send()
            .await
            .map_err(|e| UamError::Transport(format!("send failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(UamError::Transport(format!(
                "relay rejected send: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>> {
        let client = self.client().await?;
        let resp = client
            .get(format!("{}/api/v1/inbox/{}", self.relay_url, self.address))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| UamError::Transport(format!("inbox poll failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(UamError::Transport(format!(
                "relay rejected inbox poll: {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| UamError::Transport(format!("malformed inbox response: {e}")))?;
        Ok(body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn listen(&self, _handler: Arc<dyn InboundHandler>) -> Result<()> {
        Err(UamError::Transport(
            "http transport has no push channel; poll receive() or use the websocket transport"
                .into(),
        ))
    }
}

// ============================================================================
// WebSocket transport (push)
// ============================================================================

struct WsShared {
    /// Envelopes that arrived with no listener registered.
    pending: Mutex<VecDeque<Value>>,
    handler: RwLock<Option<Arc<dyn InboundHandler>>>,
    /// Writer half of the live connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    shutdown: AtomicBool,
}

/// Persistent push transport over the relay WebSocket endpoint.
pub struct WebSocketTransport {
    url: String,
    shared: Arc<WsShared>,
    connected_rx: Mutex<watch::Receiver<bool>>,
    connected_tx: watch::Sender<bool>,
    loop_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// `ws_url` is the relay's WebSocket endpoint; the bearer token rides
    /// the query string per the relay contract.
    pub fn new(ws_url: impl Into<String>, token: &str) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            url: format!("{}?token={token}", ws_url.into()),
            shared: Arc::new(WsShared {
                pending: Mutex::new(VecDeque::new()),
                handler: RwLock::new(None),
                outbound: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
            connected_rx: Mutex::new(connected_rx),
            connected_tx,
            loop_task: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        {
            let mut task = self.loop_task.lock().await;
            if task.is_some() {
                return Ok(());
            }
            self.shared.shutdown.store(false, Ordering::SeqCst);
            let handle = tokio::spawn(connection_loop(
                self.url.clone(),
                self.shared.clone(),
                self.connected_tx.clone(),
            ));
            *task = Some(handle);
        }

        // Wait for the first successful connection
        let mut rx = self.connected_rx.lock().unwrap().clone();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, wait)
            .await
            .map_err(|_| UamError::Transport("websocket connect timed out".into()))?;
        if !*self.connected_rx.lock().unwrap().borrow() {
            return Err(UamError::Transport("websocket connection failed".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.loop_task.lock().await.take() {
            task.abort();
        }
        *self.shared.outbound.lock().unwrap() = None;
        let _ = self.connected_tx.send(false);
        Ok(())
    }

    async fn send(&self, envelope: &Value) -> Result<()> {
        let sender = self
            .shared
            .outbound
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| UamError::Transport("websocket not connected".into()))?;
        let text = serde_json::to_string(envelope)
            .map_err(|e| UamError::Transport(e.to_string()))?;
        sender
            .send(WsMessage::Text(text))
            .map_err(|_| UamError::Transport("websocket writer closed".into()))
    }

    async fn receive(&self, limit: usize) -> Result<Vec<Value>> {
        let mut pending = self.shared.pending.lock().unwrap();
        let take = limit.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        *self.shared.handler.write().await = Some(handler);
        Ok(())
    }
}

/// Reconnection loop. Runs until `disconnect` aborts it.
async fn connection_loop(url: String, shared: Arc<WsShared>, connected_tx: watch::Sender<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _resp)) => {
                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
                *shared.outbound.lock().unwrap() = Some(tx.clone());
                let _ = connected_tx.send(true);
                attempt = 0;
                info!("websocket connected to relay");

                loop {
                    tokio::select! {
                        outgoing = rx.recv() => match outgoing {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        incoming = stream.next() => match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                handle_frame(&shared, &tx, &text).await;
                            }
                            Some(Ok(WsMessage::Ping(payload))) => {
                                let _ = tx.send(WsMessage::Pong(payload));
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "websocket read error");
                                break;
                            }
                        },
                    }
                }

                *shared.outbound.lock().unwrap() = None;
                let _ = connected_tx.send(false);
            }
            Err(e) => {
                debug!(error = %e, "websocket connect attempt failed");
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        attempt = attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.0..RECONNECT_JITTER.as_secs_f64());
        let delay = reconnect_delay(attempt) + Duration::from_secs_f64(jitter);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "websocket disconnected, reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Deterministic part of the backoff schedule (jitter added by the caller).
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = BASE_RECONNECT_DELAY.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    Duration::from_secs_f64(exp.min(MAX_RECONNECT_DELAY.as_secs_f64()))
}

/// Route one inbound text frame.
async fn handle_frame(shared: &Arc<WsShared>, tx: &mpsc::UnboundedSender<WsMessage>, text: &str) {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "dropping unparseable websocket frame");
            return;
        }
    };

    match message.get("type").and_then(Value::as_str) {
        Some("ping") => {
            // Relay heartbeat
            let _ = tx.send(WsMessage::Text(json!({"type": "pong"}).to_string()));
        }
        Some("pong") => {}
        Some("ack") => {
            debug!(
                message_id = message.get("message_id").and_then(serde_json::Value::as_str),
                "relay acknowledged message"
            );
        }
        Some("error") => {
            warn!(
                code = message.get("code").and_then(serde_json::Value::as_str),
                detail = message.get("detail").and_then(serde_json::Value::as_str),
                "relay reported error"
            );
        }
        _ if message.get("uam_version").is_some() => {
            let handler = shared.handler.read().await.clone();
            match handler {
                Some(handler) => handler.on_envelope(message).await,
                None => shared.pending.lock().unwrap().push_back(message),
            }
        }
        _ => debug!("ignoring unrecognized websocket frame"),
    }
}
