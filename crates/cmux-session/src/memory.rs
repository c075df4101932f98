//! In-process connection channel.
//!
//! Stands in for the session host in tests and demos: attach results are
//! scripted per pane, every call is recorded, and stream events are injected
//! with `push_event`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{
    AttachRequest, AttachResult, ConnectionChannel, PaneId, StreamEvent, SubscriberRegistry,
    Subscription,
};
use crate::error::{SessionError, SessionResult};

/// Exit code the in-memory host reports for a killed session (SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// A recorded channel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    CreateOrAttach(AttachRequest),
    Write(PaneId, Vec<u8>),
    Resize(PaneId, u16, u16),
    Detach(PaneId),
    Kill(PaneId),
    ClearScrollback(PaneId),
}

#[derive(Debug)]
pub struct MemoryChannel {
    registry: Arc<SubscriberRegistry>,
    calls: Mutex<Vec<ChannelCall>>,
    scripted: Mutex<HashMap<PaneId, VecDeque<Result<AttachResult, String>>>>,
    attach_delay: Mutex<Duration>,
    exit_on_kill: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            registry: SubscriberRegistry::new(1024),
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            attach_delay: Mutex::new(Duration::ZERO),
            exit_on_kill: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue the outcome of the next `create_or_attach` for a pane.
    /// Unscripted attaches succeed as fresh sessions.
    pub fn script_attach(&self, pane_id: &PaneId, outcome: Result<AttachResult, String>) {
        self.scripted
            .lock()
            .entry(pane_id.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Make every `create_or_attach` take this long.
    pub fn set_attach_delay(&self, delay: Duration) {
        *self.attach_delay.lock() = delay;
    }

    /// Whether `kill` answers with an `Exit` event (default true).
    pub fn set_exit_on_kill(&self, enabled: bool) {
        self.exit_on_kill.store(enabled, Ordering::SeqCst);
    }

    /// Inject a stream event for a pane. Returns false if nobody is subscribed.
    pub async fn push_event(&self, pane_id: &PaneId, event: StreamEvent) -> bool {
        self.registry.dispatch(pane_id, event).await
    }

    /// Simulate the connection dropping.
    pub fn disconnect_all(&self, reason: &str) {
        self.registry.disconnect_all(reason);
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&ChannelCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    /// Panes in the order their attach requests reached the host.
    pub fn attach_order(&self) -> Vec<PaneId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ChannelCall::CreateOrAttach(request) => Some(request.pane_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_subscribed(&self, pane_id: &PaneId) -> bool {
        self.registry.is_subscribed(pane_id)
    }

    /// Highest number of attaches that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ConnectionChannel for MemoryChannel {
    fn subscribe(&self, pane_id: &PaneId) -> Subscription {
        self.registry.subscribe(pane_id)
    }

    async fn create_or_attach(&self, request: AttachRequest) -> SessionResult<AttachResult> {
        let pane_id = request.pane_id.clone();
        self.record(ChannelCall::CreateOrAttach(request));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.attach_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self
            .scripted
            .lock()
            .get_mut(&pane_id)
            .and_then(VecDeque::pop_front);
        match outcome {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(SessionError::AttachFailed(message)),
            None => Ok(AttachResult {
                backend_handle: Some(format!("pty-{}", pane_id)),
                ..AttachResult::default()
            }),
        }
    }

    async fn write(&self, pane_id: &PaneId, data: &[u8]) -> SessionResult<()> {
        self.record(ChannelCall::Write(pane_id.clone(), data.to_vec()));
        Ok(())
    }

    async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> SessionResult<()> {
        self.record(ChannelCall::Resize(pane_id.clone(), cols, rows));
        Ok(())
    }

    async fn detach(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.record(ChannelCall::Detach(pane_id.clone()));
        Ok(())
    }

    async fn kill(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.record(ChannelCall::Kill(pane_id.clone()));
        if self.exit_on_kill.load(Ordering::SeqCst) {
            self.registry
                .dispatch(pane_id, StreamEvent::Exit(KILLED_EXIT_CODE))
                .await;
        }
        Ok(())
    }

    async fn clear_scrollback(&self, pane_id: &PaneId) -> SessionResult<()> {
        self.record(ChannelCall::ClearScrollback(pane_id.clone()));
        Ok(())
    }
}
