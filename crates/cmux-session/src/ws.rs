//! Connection channel over one multiplexed WebSocket to the session host.
//!
//! All panes share a single socket. Requests are correlated with replies by
//! `request_id`; stream events are routed to the pane's subscription. When the
//! socket drops, every pending request fails and every subscriber receives
//! `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::channel::{
    AttachRequest, AttachResult, ConnectionChannel, PaneId, SubscriberRegistry, Subscription,
};
use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::wire::{self, ClientMessage, Incoming, Reply};

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<SessionResult<Reply>>>>>;

pub struct WsChannel {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingReplies,
    registry: Arc<SubscriberRegistry>,
    next_request: AtomicU64,
    request_timeout: Duration,
    connected: Arc<AtomicBool>,
    io_task: JoinHandle<()>,
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("connected", &self.is_connected())
            .field("subscribers", &self.registry.len())
            .finish()
    }
}

impl WsChannel {
    /// Connect to the host's mux endpoint. `http(s)://` URLs are accepted and
    /// rewritten to `ws(s)://`.
    pub async fn connect(url: &str, config: &EngineConfig) -> SessionResult<Self> {
        let ws_url = url
            .replace("http://", "ws://")
            .replace("https://", "wss://")
            .trim_end_matches('/')
            .to_string();

        info!("[channel] Connecting to {}", ws_url);
        let (stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SessionError::Transport(format!("connect to {}: {}", ws_url, e)))?;
        info!("[channel] Connected to {}", ws_url);

        Ok(Self::from_stream(stream, config))
    }

    /// Run the channel over an already-established WebSocket.
    pub fn from_stream<S>(stream: WebSocketStream<S>, config: &EngineConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let registry = SubscriberRegistry::new(config.event_buffer);
        let connected = Arc::new(AtomicBool::new(true));

        let io_task = tokio::spawn(run_io(
            stream,
            outbound_rx,
            pending.clone(),
            registry.clone(),
            connected.clone(),
        ));

        Self {
            outbound,
            pending,
            registry,
            next_request: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            connected,
            io_task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientMessage) -> SessionResult<Reply> {
        if !self.is_connected() {
            return Err(SessionError::ChannelClosed);
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        // The reader may have drained `pending` between the check above and
        // the insert; nobody would answer this waiter then
        if !self.is_connected() {
            self.pending.lock().remove(&request_id);
            return Err(SessionError::ChannelClosed);
        }

        if self.outbound.send(build(request_id)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(SessionError::ChannelClosed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                warn!("[channel] Request {} timed out", request_id);
                Err(SessionError::Timeout("session host reply"))
            }
        }
    }

    async fn request_ok(&self, build: impl FnOnce(u64) -> ClientMessage) -> SessionResult<()> {
        match self.request(build).await? {
            Reply::Ok => Ok(()),
            Reply::Attached(_) => Err(SessionError::Protocol(
                "attach reply to a non-attach request".into(),
            )),
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

async fn run_io<S>(
    stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    pending: PendingReplies,
    registry: Arc<SubscriberRegistry>,
    connected: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = stream.split();

    let reason = loop {
        tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&text, &pending, &registry).await,
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(text, &pending, &registry).await,
                    Err(e) => warn!("[channel] Skipping non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break "session host closed the connection".to_string(),
                Some(Err(e)) => {
                    error!("[channel] WebSocket error: {}", e);
                    break format!("websocket error: {}", e);
                }
                Some(Ok(_)) => {}
            },
            Some(msg) = outbound_rx.recv() => {
                let request_id = msg.request_id();
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        if let Some(tx) = pending.lock().remove(&request_id) {
                            let _ = tx.send(Err(SessionError::Protocol(e.to_string())));
                        }
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(json)).await {
                    error!("[channel] Failed to send request {}: {}", request_id, e);
                    break format!("websocket send failed: {}", e);
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let waiters: Vec<_> = pending.lock().drain().collect();
    info!(
        "[channel] Connection lost ({}); failing {} pending requests, notifying {} subscribers",
        reason,
        waiters.len(),
        registry.len()
    );
    for (_, tx) in waiters {
        let _ = tx.send(Err(SessionError::Transport(reason.clone())));
    }
    registry.disconnect_all(&reason);
}

async fn handle_frame(text: &str, pending: &PendingReplies, registry: &SubscriberRegistry) {
    match wire::parse_server_frame(text) {
        Ok(Incoming::Reply { request_id, reply }) => {
            let waiter = pending.lock().remove(&request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(reply.map_err(SessionError::Rejected));
                }
                None => debug!("[channel] Reply for unknown request {}", request_id),
            }
        }
        Ok(Incoming::Event { pane_id, event }) => {
            registry.dispatch(&pane_id, event).await;
        }
        Err(e) => warn!("[channel] Skipping malformed frame: {}", e),
    }
}

#[async_trait]
impl ConnectionChannel for WsChannel {
    fn subscribe(&self, pane_id: &PaneId) -> Subscription {
        self.registry.subscribe(pane_id)
    }

    async fn create_or_attach(&self, request: AttachRequest) -> SessionResult<AttachResult> {
        let reply = self
            .request(|request_id| ClientMessage::CreateOrAttach {
                request_id,
                request,
            })
            .await
            .map_err(|e| match e {
                SessionError::Rejected(message) => SessionError::AttachFailed(message),
                other => other,
            })?;
        match reply {
            Reply::Attached(result) => Ok(result),
            Reply::Ok => Err(SessionError::Protocol(
                "create_or_attach answered without attach result".into(),
            )),
        }
    }

    async fn write(&self, pane_id: &PaneId, data: &[u8]) -> SessionResult<()> {
        let data = wire::encode_bytes(data);
        self.request_ok(|request_id| ClientMessage::Write {
            request_id,
            pane_id: pane_id.clone(),
            data,
        })
        .await
    }

    async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> SessionResult<()> {
        self.request_ok(|request_id| ClientMessage::Resize {
            request_id,
            pane_id: pane_id.clone(),
            cols,
            rows,
        })
        .await
    }

    async fn detach(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.request_ok(|request_id| ClientMessage::Detach {
            request_id,
            pane_id: pane_id.clone(),
        })
        .await
    }

    async fn kill(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.request_ok(|request_id| ClientMessage::Kill {
            request_id,
            pane_id: pane_id.clone(),
        })
        .await
    }

    async fn clear_scrollback(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.request_ok(|request_id| ClientMessage::ClearScrollback {
            request_id,
            pane_id: pane_id.clone(),
        })
        .await
    }
}
