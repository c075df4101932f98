//! Connection channel to the out-of-process session host.
//!
//! The host owns the PTYs. The engine only sees it through request/response
//! calls (attach, write, resize, detach, kill, clear-scrollback) and one pushed
//! event stream per pane. At most one subscription per pane is live: subscribing
//! again replaces the previous one, whose receiver then ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::SessionResult;

/// Stable pane identifier owned by the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PaneId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PaneId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Arguments for `create_or_attach`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub pane_id: PaneId,
    pub tab_id: String,
    pub workspace_id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Revive a session the user deliberately killed into a fresh shell
    #[serde(default)]
    pub allow_killed: bool,
}

/// How an attach was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    /// A new backend process was started
    Fresh,
    /// Backend and host both stayed alive; the live stream resumes
    WarmReattach,
    /// Backend outlived a host restart; only a snapshot is available
    ColdRestore,
}

/// Response to `create_or_attach`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachResult {
    /// Opaque identifier of the backend PTY, when the host reports one
    pub backend_handle: Option<String>,
    pub is_cold_restore: bool,
    pub previous_cwd: Option<String>,
    pub scrollback: Option<Vec<u8>>,
    /// Serialized screen state, preferred over `scrollback` when present
    pub snapshot_ansi: Option<Vec<u8>>,
}

impl AttachResult {
    pub fn kind(&self) -> AttachKind {
        if self.is_cold_restore {
            AttachKind::ColdRestore
        } else if self.initial_content().is_some() {
            AttachKind::WarmReattach
        } else {
            AttachKind::Fresh
        }
    }

    /// Bytes to seed the display with before live output.
    pub fn initial_content(&self) -> Option<&[u8]> {
        self.snapshot_ansi
            .as_deref()
            .or(self.scrollback.as_deref())
            .filter(|bytes| !bytes.is_empty())
    }
}

/// Server-pushed event for one pane, in backend order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Exit(i32),
    Error(String),
    /// The connection itself dropped; the backend may still be alive
    Disconnected(String),
}

/// Receiving end of one pane's event stream.
///
/// Dropping it unregisters the pane, unless a newer subscription has
/// already replaced it.
#[derive(Debug)]
pub struct Subscription {
    pane_id: PaneId,
    id: u64,
    events: mpsc::Receiver<StreamEvent>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn pane_id(&self) -> &PaneId {
        &self.pane_id
    }

    /// Next event, or `None` once the subscription was replaced or the
    /// channel shut down.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.pane_id, self.id);
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

/// Per-pane subscriber table shared by channel implementations.
#[derive(Debug)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<PaneId, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    /// Open the subscription for a pane, closing any previous one first.
    pub fn subscribe(self: &Arc<Self>, pane_id: &PaneId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .subscribers
            .lock()
            .insert(pane_id.clone(), Subscriber { id, tx });
        if replaced.is_some() {
            info!("[channel:{}] Replaced existing subscription", pane_id);
        }
        Subscription {
            pane_id: pane_id.clone(),
            id,
            events: rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver an event to the pane's subscriber, waiting for buffer space.
    /// Returns false when nobody is subscribed.
    pub async fn dispatch(&self, pane_id: &PaneId, event: StreamEvent) -> bool {
        let target = self
            .subscribers
            .lock()
            .get(pane_id)
            .map(|s| (s.id, s.tx.clone()));
        let Some((id, tx)) = target else {
            debug!("[channel:{}] No subscriber for event", pane_id);
            return false;
        };
        if tx.send(event).await.is_err() {
            self.remove(pane_id, id);
            return false;
        }
        true
    }

    /// Send `Disconnected` to every subscriber and close all subscriptions.
    pub fn disconnect_all(&self, reason: &str) {
        let drained: Vec<_> = self.subscribers.lock().drain().collect();
        for (pane_id, subscriber) in drained {
            if subscriber
                .tx
                .try_send(StreamEvent::Disconnected(reason.to_string()))
                .is_err()
            {
                debug!("[channel:{}] Subscriber gone before disconnect", pane_id);
            }
        }
    }

    pub fn is_subscribed(&self, pane_id: &PaneId) -> bool {
        self.subscribers.lock().contains_key(pane_id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, pane_id: &PaneId, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.get(pane_id).is_some_and(|s| s.id == id) {
            subscribers.remove(pane_id);
        }
    }
}

/// RPC surface of the session host.
#[async_trait]
pub trait ConnectionChannel: Send + Sync + 'static {
    /// Open the event stream for a pane, replacing any previous subscription.
    fn subscribe(&self, pane_id: &PaneId) -> Subscription;

    async fn create_or_attach(&self, request: AttachRequest) -> SessionResult<AttachResult>;

    async fn write(&self, pane_id: &PaneId, data: &[u8]) -> SessionResult<()>;

    async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> SessionResult<()>;

    /// Release the pane's lease; the backend process keeps running.
    async fn detach(&self, pane_id: &PaneId) -> SessionResult<()>;

    async fn kill(&self, pane_id: &PaneId) -> SessionResult<()>;

    async fn clear_scrollback(&self, pane_id: &PaneId) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_subscription_replaces_first() {
        let registry = SubscriberRegistry::new(8);
        let pane = PaneId::new("pane-1");

        let mut first = registry.subscribe(&pane);
        let mut second = registry.subscribe(&pane);
        assert_eq!(registry.len(), 1);

        assert!(registry.dispatch(&pane, StreamEvent::Data(b"x".to_vec())).await);
        assert_eq!(first.recv().await, None, "replaced subscription ends");
        assert_eq!(second.recv().await, Some(StreamEvent::Data(b"x".to_vec())));
    }

    #[tokio::test]
    async fn test_dropping_stale_subscription_keeps_newer() {
        let registry = SubscriberRegistry::new(8);
        let pane = PaneId::new("pane-1");

        let first = registry.subscribe(&pane);
        let _second = registry.subscribe(&pane);
        drop(first);
        assert!(registry.is_subscribed(&pane));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let registry = SubscriberRegistry::new(8);
        let pane = PaneId::new("pane-1");
        drop(registry.subscribe(&pane));
        assert!(registry.is_empty());
        assert!(!registry.dispatch(&pane, StreamEvent::Exit(0)).await);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let registry = SubscriberRegistry::new(8);
        let mut a = registry.subscribe(&PaneId::new("a"));
        let mut b = registry.subscribe(&PaneId::new("b"));
        registry.disconnect_all("host restarted");

        for sub in [&mut a, &mut b] {
            assert_eq!(
                sub.recv().await,
                Some(StreamEvent::Disconnected("host restarted".into()))
            );
            assert_eq!(sub.recv().await, None);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_attach_kind() {
        let fresh = AttachResult::default();
        assert_eq!(fresh.kind(), AttachKind::Fresh);

        let warm = AttachResult {
            scrollback: Some(b"abc".to_vec()),
            ..AttachResult::default()
        };
        assert_eq!(warm.kind(), AttachKind::WarmReattach);

        let cold = AttachResult {
            is_cold_restore: true,
            scrollback: Some(b"abc".to_vec()),
            snapshot_ansi: Some(b"screen".to_vec()),
            ..AttachResult::default()
        };
        assert_eq!(cold.kind(), AttachKind::ColdRestore);
        assert_eq!(cold.initial_content(), Some(&b"screen"[..]));
    }
}
