//! Session lifecycle orchestration.
//!
//! `SessionManager` owns one `Session` per pane, keyed by `PaneId`, and wires
//! the channel, scheduler, output pipeline and restore gate together:
//!
//! - mounting a pane queues an attach with the scheduler; the session only
//!   enters `Attaching` once a slot is granted
//! - the pane's event stream is subscribed before `create_or_attach` is sent,
//!   so nothing the backend produces in between is missed
//! - output passes through the pane's `OutputPipeline`, is recorded, and is
//!   gated by the restore coordinator until the surface has painted
//! - unmounting schedules a detach after a grace window; a remount inside the
//!   window reuses the live session without any channel call
//!
//! Surface callbacks are sent to a per-mount delivery task so they run in
//! order and never under the session lock. Every attach bumps the session's
//! generation; stream events, timers and attach replies tagged with an older
//! generation are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cmux_terminal::{OutputPipeline, ProcessedChunk};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{AttachRequest, AttachResult, ConnectionChannel, PaneId, StreamEvent, Subscription};
use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::record::ScrollbackRecord;
use crate::restore::{Delivery, RestoreCoordinator};
use crate::scheduler::{AttachPermit, AttachScheduler, CancelHandle, PRIORITY_BACKGROUND, PRIORITY_FOCUSED};
use crate::session::{ColdRestoreState, ExitReason, SessionSnapshot, SessionState};
use crate::surface::RenderSurface;

const PASTE_START: &str = "\x1b[200~";
const PASTE_END: &str = "\x1b[201~";

/// Everything the host knows about a pane when it mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub pane_id: PaneId,
    pub tab_id: String,
    pub workspace_id: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<String>,
    pub initial_commands: Option<Vec<String>>,
    pub focused: bool,
}

impl MountOptions {
    pub fn new(
        pane_id: impl Into<PaneId>,
        tab_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            pane_id: pane_id.into(),
            tab_id: tab_id.into(),
            workspace_id: workspace_id.into(),
            cols: 80,
            rows: 24,
            cwd: None,
            initial_commands: None,
            focused: false,
        }
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn initial_commands(mut self, commands: Vec<String>) -> Self {
        self.initial_commands = Some(commands);
        self
    }

    pub fn focused(mut self, focused: bool) -> Self {
        self.focused = focused;
        self
    }
}

/// Wrap pasted text for a program that enabled bracketed paste. End markers
/// inside the text are removed so the paste cannot terminate early.
pub fn wrap_paste(text: &str, bracketed: bool) -> Vec<u8> {
    if !bracketed {
        return text.as_bytes().to_vec();
    }
    let mut body = text.to_string();
    while body.contains(PASTE_END) {
        body = body.replace(PASTE_END, "");
    }
    let mut out = Vec::with_capacity(body.len() + PASTE_START.len() + PASTE_END.len());
    out.extend_from_slice(PASTE_START.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(PASTE_END.as_bytes());
    out
}

/// Ordered work for a surface's delivery task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SurfaceEvent {
    Output(Vec<u8>),
    Title(String),
    Cwd(String),
    State(SessionState),
    Error(String),
}

async fn run_surface(
    mut events: mpsc::UnboundedReceiver<SurfaceEvent>,
    surface: Arc<dyn RenderSurface>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SurfaceEvent::Output(bytes) => surface.write(&bytes),
            SurfaceEvent::Title(title) => surface.on_title_change(&title),
            SurfaceEvent::Cwd(cwd) => surface.on_cwd_change(&cwd),
            SurfaceEvent::State(state) => surface.on_state_change(&state),
            SurfaceEvent::Error(message) => surface.on_error(&message),
        }
    }
}

struct Mount {
    id: u64,
    outbox: mpsc::UnboundedSender<SurfaceEvent>,
    fallback: Option<JoinHandle<()>>,
}

impl Mount {
    fn send(&self, event: SurfaceEvent) {
        if self.outbox.send(event).is_err() {
            debug!("[session] Surface delivery task already gone");
        }
    }

    fn cancel_fallback(&mut self) {
        if let Some(timer) = self.fallback.take() {
            timer.abort();
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.cancel_fallback();
    }
}

struct Session {
    pane_id: PaneId,
    tab_id: String,
    workspace_id: String,
    cols: u16,
    rows: u16,
    requested_cwd: Option<String>,
    initial_commands: Option<Vec<String>>,
    focused: bool,

    backend_handle: Option<String>,
    state: SessionState,
    pipeline: OutputPipeline,
    live_output_seen: bool,
    cwd: Option<String>,
    title: Option<String>,
    cold_restore: Option<ColdRestoreState>,
    record: ScrollbackRecord,
    kill_requested: bool,
    allow_killed: bool,

    generation: u64,
    restore: RestoreCoordinator<SurfaceEvent>,
    mount: Option<Mount>,
    queued: Option<CancelHandle>,
    pending_detach: Option<JoinHandle<()>>,
    stream: Option<JoinHandle<()>>,
}

impl Session {
    fn new(options: &MountOptions, scrollback_limit: usize) -> Self {
        Self {
            pane_id: options.pane_id.clone(),
            tab_id: options.tab_id.clone(),
            workspace_id: options.workspace_id.clone(),
            cols: options.cols,
            rows: options.rows,
            requested_cwd: options.cwd.clone(),
            initial_commands: options.initial_commands.clone(),
            focused: options.focused,
            backend_handle: None,
            state: SessionState::Idle,
            pipeline: OutputPipeline::new(),
            live_output_seen: false,
            cwd: None,
            title: None,
            cold_restore: None,
            record: ScrollbackRecord::new(scrollback_limit),
            kill_requested: false,
            allow_killed: false,
            generation: 0,
            restore: RestoreCoordinator::new(),
            mount: None,
            queued: None,
            pending_detach: None,
            stream: None,
        }
    }

    fn apply_options(&mut self, options: MountOptions) {
        self.tab_id = options.tab_id;
        self.workspace_id = options.workspace_id;
        self.cols = options.cols;
        self.rows = options.rows;
        self.focused = options.focused;
        if options.cwd.is_some() {
            self.requested_cwd = options.cwd;
        }
        if options.initial_commands.is_some() {
            self.initial_commands = options.initial_commands;
        }
    }

    fn attach_request(&self) -> AttachRequest {
        let cwd = self.requested_cwd.clone().or_else(|| {
            self.cold_restore
                .as_ref()
                .and_then(|cold| cold.last_known_cwd.clone())
        });
        AttachRequest {
            pane_id: self.pane_id.clone(),
            tab_id: self.tab_id.clone(),
            workspace_id: self.workspace_id.clone(),
            cols: self.cols,
            rows: self.rows,
            initial_commands: self.initial_commands.clone(),
            cwd,
            allow_killed: self.allow_killed,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Attaching | SessionState::Attached)
    }

    fn priority(&self) -> u8 {
        if self.focused {
            PRIORITY_FOCUSED
        } else {
            PRIORITY_BACKGROUND
        }
    }

    /// Send to the surface immediately, bypassing the restore gate.
    fn send_direct(&self, event: SurfaceEvent) {
        if let Some(mount) = &self.mount {
            mount.send(event);
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery<SurfaceEvent>>) {
        let Some(mount) = &self.mount else {
            return;
        };
        for delivery in deliveries {
            match delivery {
                Delivery::Initial(bytes) => mount.send(SurfaceEvent::Output(bytes)),
                Delivery::Event(event) => mount.send(event),
            }
        }
    }

    /// Queue behind the restore gate, preserving stream order.
    fn emit(&mut self, event: SurfaceEvent) {
        let deliveries = self.restore.push_event(event);
        self.deliver(deliveries);
    }

    /// Attach-driven transition; the surface hears about it right away.
    fn set_state(&mut self, state: SessionState) {
        info!("[session:{}] {} -> {}", self.pane_id, self.state, state);
        self.state = state.clone();
        self.send_direct(SurfaceEvent::State(state));
    }

    /// Stream-driven transition; ordered after the output that preceded it.
    /// The stream is over, so there is no lease left to release.
    fn finish(&mut self, state: SessionState) {
        info!("[session:{}] {} -> {}", self.pane_id, self.state, state);
        if self.cancel_pending_detach() {
            debug!("[session:{}] Ended during grace window", self.pane_id);
        }
        self.state = state.clone();
        self.emit(SurfaceEvent::State(state));
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.live_output_seen = true;
        let chunk = self.pipeline.process(bytes);
        self.absorb(chunk);
    }

    fn flush_pipeline(&mut self) {
        let chunk = self.pipeline.finish();
        self.absorb(chunk);
    }

    fn absorb(&mut self, chunk: ProcessedChunk) {
        if chunk.suppressed > 0 {
            debug!(
                "[session:{}] Suppressed {} query replies",
                self.pane_id, chunk.suppressed
            );
        }
        match chunk.scrollback_cleared_at {
            Some(offset) => {
                debug!("[session:{}] Scrollback cleared by ED3", self.pane_id);
                self.record.push_after_clear(&chunk.output, offset);
                if let Some(cold) = &mut self.cold_restore {
                    cold.scrollback_snapshot = None;
                }
            }
            None => self.record.push(&chunk.output),
        }
        if !chunk.output.is_empty() {
            self.emit(SurfaceEvent::Output(chunk.output));
        }
        if let Some(title) = chunk.title {
            self.title = Some(title.clone());
            self.emit(SurfaceEvent::Title(title));
        }
        if let Some(cwd) = chunk.cwd {
            self.update_cwd(cwd);
        }
    }

    fn update_cwd(&mut self, cwd: String) {
        if let Some(cold) = &mut self.cold_restore {
            cold.last_known_cwd = Some(cwd.clone());
        }
        self.cwd = Some(cwd.clone());
        self.emit(SurfaceEvent::Cwd(cwd));
    }

    /// Run attach content through a fresh pipeline so query replies are
    /// dropped and modes reflect the snapshot. The live pipeline adopts that
    /// state unless live output already moved it on.
    /// Returns the filtered bytes and the title the snapshot set, if any.
    fn replay_initial(&mut self, bytes: &[u8]) -> (Vec<u8>, Option<String>) {
        let mut replay = OutputPipeline::new();
        let mut chunk = replay.process(bytes);
        let tail = replay.finish();
        chunk.output.extend(tail.output);

        let title = tail.title.or(chunk.title);
        if let Some(title) = &title {
            self.title = Some(title.clone());
        }
        if !self.live_output_seen {
            self.pipeline = replay;
        }
        (chunk.output, title)
    }

    fn on_attach_result(&mut self, result: SessionResult<AttachResult>) {
        self.allow_killed = false;
        match result {
            Ok(result) => {
                let kind = result.kind();
                self.backend_handle = result.backend_handle.clone();
                let (initial, snapshot_title) = match result.initial_content() {
                    Some(bytes) => {
                        let (output, title) = self.replay_initial(bytes);
                        (Some(output), title)
                    }
                    None => (None, None),
                };

                if result.is_cold_restore {
                    match &mut self.cold_restore {
                        Some(existing) => {
                            existing.is_restored = true;
                            if existing.last_known_cwd.is_none() {
                                existing.last_known_cwd = result.previous_cwd.clone();
                            }
                        }
                        None => {
                            self.cold_restore = Some(ColdRestoreState {
                                is_restored: true,
                                last_known_cwd: result.previous_cwd.clone(),
                                scrollback_snapshot: initial.clone(),
                            });
                        }
                    }
                }
                if let Some(bytes) = &initial {
                    self.record.prepend(bytes);
                }

                if self.state == SessionState::Attaching {
                    info!(
                        "[session:{}] Attached ({:?}, backend {})",
                        self.pane_id,
                        kind,
                        self.backend_handle.as_deref().unwrap_or("unknown")
                    );
                    self.set_state(SessionState::Attached);
                } else {
                    debug!(
                        "[session:{}] Attach reply arrived while {}",
                        self.pane_id, self.state
                    );
                }

                let deliveries = self.restore.maybe_apply_initial_state(initial);
                self.deliver(deliveries);
                if let Some(title) = snapshot_title {
                    self.emit(SurfaceEvent::Title(title));
                }

                if self.cwd.is_none() {
                    if let Some(previous) = result.previous_cwd {
                        self.update_cwd(previous);
                    }
                }
            }
            Err(e) => {
                warn!("[session:{}] Attach failed: {}", self.pane_id, e);
                self.stop_stream();
                let deliveries = self.restore.maybe_apply_initial_state(None);
                self.deliver(deliveries);
                let reason = match e {
                    SessionError::AttachFailed(reason) => reason,
                    other => other.to_string(),
                };
                self.set_state(SessionState::AttachFailed(reason.clone()));
                self.send_direct(SurfaceEvent::Error(reason));
            }
        }
    }

    fn stop_stream(&mut self) {
        if let Some(task) = self.stream.take() {
            task.abort();
        }
    }

    fn cancel_queued(&mut self) -> bool {
        self.queued.take().is_some_and(|handle| handle.cancel())
    }

    fn cancel_pending_detach(&mut self) -> bool {
        match self.pending_detach.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the previous stream and prepare for a new attach on the same
    /// surface.
    fn reset_for_attach(&mut self) {
        self.stop_stream();
        self.pipeline.reset();
        self.live_output_seen = false;
        self.kill_requested = false;
        self.restore = self.restore.restarted();
    }

    fn snapshot(&self) -> SessionSnapshot {
        let modes = self.pipeline.modes();
        SessionSnapshot {
            pane_id: self.pane_id.clone(),
            backend_handle: self.backend_handle.clone(),
            state: self.state.clone(),
            alternate_screen_active: modes.is_alternate_screen(),
            bracketed_paste_active: modes.is_bracketed_paste(),
            cwd: self.cwd.clone(),
            title: self.title.clone(),
            exit_reason: self.state.exit_reason(),
            cold_restore: self.cold_restore.clone(),
            mounted: self.mount.is_some(),
            focused: self.focused,
            queued: self.queued.is_some(),
            recorded_bytes: self.record.len(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_queued();
        self.cancel_pending_detach();
        self.stop_stream();
    }
}

struct Inner<C> {
    channel: Arc<C>,
    config: EngineConfig,
    scheduler: AttachScheduler,
    sessions: Mutex<HashMap<PaneId, Session>>,
    next_mount: AtomicU64,
}

impl<C: ConnectionChannel> Inner<C> {
    fn enqueue_attach(self: &Arc<Self>, session: &mut Session) {
        session.generation += 1;
        let generation = session.generation;
        let pane_id = session.pane_id.clone();
        let inner = Arc::downgrade(self);
        let handle = self
            .scheduler
            .enqueue(pane_id.clone(), session.priority(), move |permit| {
                if let Some(inner) = inner.upgrade() {
                    tokio::spawn(inner.run_attach(pane_id, generation, permit));
                }
            });
        session.queued = Some(handle);
    }

    async fn run_attach(self: Arc<Self>, pane_id: PaneId, generation: u64, permit: AttachPermit) {
        let request = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&pane_id) else {
                return;
            };
            if session.generation != generation {
                debug!("[session:{}] Skipping superseded attach", pane_id);
                return;
            }
            session.queued = None;
            session.stop_stream();
            let subscription = self.channel.subscribe(&pane_id);
            session.stream = Some(tokio::spawn(consume_stream(
                Arc::downgrade(&self),
                pane_id.clone(),
                generation,
                subscription,
            )));
            session.set_state(SessionState::Attaching);
            session.attach_request()
        };

        let result = self.channel.create_or_attach(request).await;
        permit.done();

        let release_stale_lease = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&pane_id) {
                Some(session) if session.generation == generation => {
                    session.on_attach_result(result);
                    false
                }
                Some(session) => {
                    debug!("[session:{}] Dropping reply for superseded attach", pane_id);
                    result.is_ok()
                        && session.mount.is_none()
                        && session.queued.is_none()
                        && session.state == SessionState::Idle
                }
                None => false,
            }
        };

        if release_stale_lease {
            if let Err(e) = self.channel.detach(&pane_id).await {
                warn!("[session:{}] Failed to release stale attach: {}", pane_id, e);
            }
        }
    }

    /// Returns false once the stream is finished for this attach.
    fn handle_stream_event(&self, pane_id: &PaneId, generation: u64, event: StreamEvent) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(pane_id) else {
            return false;
        };
        if session.generation != generation {
            debug!("[session:{}] Dropping event from superseded attach", pane_id);
            return false;
        }

        match event {
            StreamEvent::Data(bytes) => {
                session.ingest(&bytes);
                true
            }
            StreamEvent::Exit(code) => {
                session.flush_pipeline();
                let reason = if session.kill_requested {
                    ExitReason::Killed
                } else {
                    ExitReason::Crashed(code)
                };
                session.finish(SessionState::Exited(reason));
                false
            }
            StreamEvent::Error(message) => {
                warn!("[session:{}] Backend error: {}", pane_id, message);
                session.emit(SurfaceEvent::Error(message));
                true
            }
            StreamEvent::Disconnected(reason) => {
                warn!("[session:{}] Connection lost: {}", pane_id, reason);
                session.flush_pipeline();
                session.finish(SessionState::Disconnected(reason));
                false
            }
        }
    }

    fn handle_stream_closed(&self, pane_id: &PaneId, generation: u64) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(pane_id) else {
            return;
        };
        if session.generation == generation && session.is_live() {
            session.flush_pipeline();
            session.finish(SessionState::Disconnected("event stream closed".into()));
        }
    }

    fn schedule_detach(self: &Arc<Self>, session: &mut Session) {
        let grace = self.config.detach_grace();
        let inner = Arc::downgrade(self);
        let pane_id = session.pane_id.clone();
        let generation = session.generation;
        debug!("[session:{}] Detaching in {:?} unless remounted", pane_id, grace);
        session.pending_detach = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = inner.upgrade() {
                inner.finish_detach(pane_id, generation).await;
            }
        }));
    }

    async fn finish_detach(&self, pane_id: PaneId, generation: u64) {
        let release = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&pane_id) else {
                return;
            };
            if session.generation != generation || session.mount.is_some() {
                return;
            }
            session.pending_detach = None;
            // Ended sessions keep their state until the user restarts them
            if session.state.is_terminal() {
                return;
            }
            let was_attached = session.state == SessionState::Attached;
            session.generation += 1;
            session.reset_for_attach();
            // The next attach brings its own scrollback
            session.record.clear();
            session.restore = RestoreCoordinator::new();
            session.state = SessionState::Idle;
            was_attached
        };

        info!("[session:{}] Grace window elapsed; detaching", pane_id);
        if release {
            if let Err(e) = self.channel.detach(&pane_id).await {
                warn!("[session:{}] Detach failed: {}", pane_id, e);
            }
        }
    }
}

async fn consume_stream<C: ConnectionChannel>(
    inner: Weak<Inner<C>>,
    pane_id: PaneId,
    generation: u64,
    mut subscription: Subscription,
) {
    while let Some(event) = subscription.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.handle_stream_event(&pane_id, generation, event) {
            return;
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.handle_stream_closed(&pane_id, generation);
    }
}

fn spawn_fallback<C: ConnectionChannel>(
    inner: Weak<Inner<C>>,
    pane_id: PaneId,
    mount_id: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut sessions = inner.sessions.lock();
        let Some(session) = sessions.get_mut(&pane_id) else {
            return;
        };
        if session.mount.as_ref().map(|m| m.id) != Some(mount_id) {
            return;
        }
        if !session.restore.is_painted() {
            debug!(
                "[session:{}] No paint after {:?}; releasing restore",
                pane_id, timeout
            );
        }
        let deliveries = session.restore.on_fallback_timeout();
        session.deliver(deliveries);
    })
}

/// Owns every pane's session. Cheap to clone; clones share state.
///
/// Must be used from within a Tokio runtime.
pub struct SessionManager<C: ConnectionChannel> {
    inner: Arc<Inner<C>>,
}

impl<C: ConnectionChannel> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ConnectionChannel> SessionManager<C> {
    pub fn new(channel: Arc<C>, config: EngineConfig) -> Self {
        let scheduler = AttachScheduler::new(config.attach_concurrency());
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                scheduler,
                sessions: Mutex::new(HashMap::new()),
                next_mount: AtomicU64::new(1),
            }),
        }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.inner.channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Attach a surface to a pane. Creates the session on first mount; a
    /// remount within the detach grace window reuses the live session and
    /// repaints from recorded output.
    pub fn mount(&self, options: MountOptions, surface: Arc<dyn RenderSurface>) {
        let inner = &self.inner;
        let mount_id = inner.next_mount.fetch_add(1, Ordering::Relaxed);
        let pane_id = options.pane_id.clone();

        let (outbox, events) = mpsc::unbounded_channel();
        tokio::spawn(run_surface(events, surface));

        let mut sessions = inner.sessions.lock();
        let session = sessions.entry(pane_id.clone()).or_insert_with(|| {
            info!("[session:{}] New session", pane_id);
            Session::new(&options, inner.config.scrollback_limit_bytes)
        });
        session.apply_options(options);
        let resumed = session.cancel_pending_detach();
        if session.mount.take().is_some() {
            debug!("[session:{}] Replacing mounted surface", pane_id);
        }

        session.restore = if session.restore.is_applied() {
            RestoreCoordinator::seeded(Some(session.record.snapshot()))
        } else {
            std::mem::take(&mut session.restore).handover()
        };

        let fallback = spawn_fallback(
            Arc::downgrade(inner),
            pane_id.clone(),
            mount_id,
            inner.config.first_paint_timeout(),
        );
        session.mount = Some(Mount {
            id: mount_id,
            outbox,
            fallback: Some(fallback),
        });

        session.send_direct(SurfaceEvent::State(session.state.clone()));
        if let Some(title) = session.title.clone() {
            session.send_direct(SurfaceEvent::Title(title));
        }
        if let Some(cwd) = session.cwd.clone() {
            session.send_direct(SurfaceEvent::Cwd(cwd));
        }

        if resumed {
            info!("[session:{}] Remounted within grace window", pane_id);
        } else if session.state == SessionState::Idle && session.queued.is_none() {
            inner.enqueue_attach(session);
        }
    }

    /// Detach the surface. A queued attach is cancelled; a live session is
    /// detached from the host only after the grace window.
    pub fn unmount(&self, pane_id: &PaneId) -> SessionResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;

        session.mount = None;
        if let Some(handle) = session.queued.take() {
            if !handle.cancel() {
                // Dispatched but not yet running; make it skip itself
                session.generation += 1;
            }
            info!("[session:{}] Unmounted before attach started", pane_id);
            return Ok(());
        }
        if session.is_live() && session.pending_detach.is_none() {
            self.inner.schedule_detach(session);
        }
        Ok(())
    }

    /// The surface has painted once; release the restore gate.
    pub fn first_paint(&self, pane_id: &PaneId) -> SessionResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
        if let Some(mount) = &mut session.mount {
            mount.cancel_fallback();
        }
        let deliveries = session.restore.on_first_paint();
        session.deliver(deliveries);
        Ok(())
    }

    pub async fn write(&self, pane_id: &PaneId, data: &[u8]) -> SessionResult<()> {
        self.require_attached(pane_id, "write")?;
        self.inner.channel.write(pane_id, data).await
    }

    /// Send pasted text, bracketed when the program asked for it.
    pub async fn paste(&self, pane_id: &PaneId, text: &str) -> SessionResult<()> {
        let bracketed = {
            let sessions = self.inner.sessions.lock();
            let session = sessions
                .get(pane_id)
                .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
            ensure_attached(session, "paste")?;
            session.pipeline.modes().is_bracketed_paste()
        };
        let payload = wrap_paste(text, bracketed);
        self.inner.channel.write(pane_id, &payload).await
    }

    /// Remember the size for future attaches and forward it when attached.
    pub async fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> SessionResult<()> {
        let attached = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(pane_id)
                .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
            session.cols = cols;
            session.rows = rows;
            session.state == SessionState::Attached
        };
        if attached {
            self.inner.channel.resize(pane_id, cols, rows).await?;
        }
        Ok(())
    }

    /// Drop recorded scrollback here and on the host. The live screen is
    /// untouched.
    pub async fn clear_scrollback(&self, pane_id: &PaneId) -> SessionResult<()> {
        let attached = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(pane_id)
                .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
            session.record.clear();
            if let Some(cold) = &mut session.cold_restore {
                cold.scrollback_snapshot = None;
            }
            session.state == SessionState::Attached
        };
        if attached {
            self.inner.channel.clear_scrollback(pane_id).await?;
        }
        Ok(())
    }

    /// Kill the backend. The exit that follows is reported as `Killed`.
    pub async fn kill(&self, pane_id: &PaneId) -> SessionResult<()> {
        {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(pane_id)
                .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
            if !session.is_live() {
                return Err(invalid_state(session, "kill"));
            }
            session.kill_requested = true;
        }

        info!("[session:{}] Killing backend", pane_id);
        let result = self.inner.channel.kill(pane_id).await;
        if result.is_err() {
            if let Some(session) = self.inner.sessions.lock().get_mut(pane_id) {
                session.kill_requested = false;
            }
        }
        result
    }

    /// Re-enter the scheduler from a terminal state. Killed sessions are
    /// revived into a fresh shell.
    pub fn restart(&self, pane_id: &PaneId) -> SessionResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
        if !session.state.is_terminal() {
            return Err(invalid_state(session, "restart"));
        }
        session.reset_for_attach();
        session.allow_killed = true;
        session.set_state(SessionState::Idle);
        self.inner.enqueue_attach(session);
        Ok(())
    }

    /// Throw away the restored view and its backend in favour of a fresh shell.
    pub async fn discard_restored_view(&self, pane_id: &PaneId) -> SessionResult<()> {
        let (generation, kill_backend) = {
            let mut sessions = self.inner.sessions.lock();
            let session = sessions
                .get_mut(pane_id)
                .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
            if session.cold_restore.is_none() {
                return Err(invalid_state(session, "discard restored view"));
            }
            session.cold_restore = None;
            let live = session.is_live();
            session.cancel_queued();
            session.reset_for_attach();
            session.record.clear();
            session.cwd = None;
            session.title = None;
            session.generation += 1;
            session.set_state(SessionState::Idle);
            (session.generation, live)
        };

        info!("[session:{}] Discarding restored view", pane_id);
        if kill_backend {
            if let Err(e) = self.inner.channel.kill(pane_id).await {
                warn!("[session:{}] Failed to kill restored backend: {}", pane_id, e);
            }
        }

        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get_mut(pane_id) {
            if session.generation == generation && session.queued.is_none() {
                session.allow_killed = true;
                self.inner.enqueue_attach(session);
            }
        }
        Ok(())
    }

    /// The pane is gone: cancel everything, kill the backend and forget the
    /// session, including any cold-restore state.
    pub async fn close(&self, pane_id: &PaneId) -> SessionResult<()> {
        let session = self
            .inner
            .sessions
            .lock()
            .remove(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
        let live = session.is_live();
        drop(session);

        info!("[session:{}] Closed", pane_id);
        if live {
            self.inner.channel.kill(pane_id).await?;
        }
        Ok(())
    }

    /// Focused panes attach ahead of background panes.
    pub fn set_focused(&self, pane_id: &PaneId, focused: bool) -> SessionResult<()> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
        session.focused = focused;
        if session.queued.is_some() {
            self.inner
                .scheduler
                .reprioritize(pane_id, session.priority());
        }
        Ok(())
    }

    pub fn snapshot(&self, pane_id: &PaneId) -> Option<SessionSnapshot> {
        self.inner.sessions.lock().get(pane_id).map(Session::snapshot)
    }

    pub fn pane_ids(&self) -> Vec<PaneId> {
        let mut ids: Vec<_> = self.inner.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn require_attached(&self, pane_id: &PaneId, operation: &'static str) -> SessionResult<()> {
        let sessions = self.inner.sessions.lock();
        let session = sessions
            .get(pane_id)
            .ok_or_else(|| SessionError::SessionNotFound(pane_id.clone()))?;
        ensure_attached(session, operation)
    }
}

fn ensure_attached(session: &Session, operation: &'static str) -> SessionResult<()> {
    if session.state == SessionState::Attached {
        Ok(())
    } else {
        Err(invalid_state(session, operation))
    }
}

fn invalid_state(session: &Session, operation: &'static str) -> SessionError {
    SessionError::InvalidState {
        pane: session.pane_id.clone(),
        operation,
        state: session.state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChannelCall, MemoryChannel};

    #[derive(Default)]
    struct Recorder {
        output: Mutex<Vec<u8>>,
        states: Mutex<Vec<SessionState>>,
    }

    impl RenderSurface for Recorder {
        fn write(&self, bytes: &[u8]) {
            self.output.lock().extend_from_slice(bytes);
        }

        fn on_state_change(&self, state: &SessionState) {
            self.states.lock().push(state.clone());
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_wrap_paste() {
        assert_eq!(wrap_paste("ls", false), b"ls");
        assert_eq!(wrap_paste("ls", true), b"\x1b[200~ls\x1b[201~");
        assert_eq!(
            wrap_paste("a\x1b[201~b\x1b[201\x1b[201~~", true),
            b"\x1b[200~ab\x1b[201~"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_attach_reaches_attached() {
        let channel = Arc::new(MemoryChannel::new());
        let manager = SessionManager::new(channel.clone(), EngineConfig::default());
        let pane = PaneId::new("p");
        let surface = Arc::new(Recorder::default());

        manager.mount(MountOptions::new("p", "t", "w"), surface.clone());
        assert_eq!(manager.snapshot(&pane).unwrap().state, SessionState::Idle);
        settle().await;

        let snapshot = manager.snapshot(&pane).unwrap();
        assert_eq!(snapshot.state, SessionState::Attached);
        assert_eq!(snapshot.backend_handle.as_deref(), Some("pty-p"));
        assert!(channel.is_subscribed(&pane));
        assert_eq!(
            *surface.states.lock(),
            vec![
                SessionState::Idle,
                SessionState::Attaching,
                SessionState::Attached
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_requires_attached() {
        let channel = Arc::new(MemoryChannel::new());
        let manager = SessionManager::new(channel.clone(), EngineConfig::default());
        let pane = PaneId::new("p");
        manager.mount(MountOptions::new("p", "t", "w"), Arc::new(Recorder::default()));

        let err = manager.write(&pane, b"ls\r").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { operation: "write", .. }));

        settle().await;
        manager.write(&pane, b"ls\r").await.unwrap();
        assert_eq!(
            channel.count_calls(|c| matches!(c, ChannelCall::Write(_, data) if data == b"ls\r")),
            1
        );
        assert!(matches!(
            manager.write(&PaneId::new("nope"), b"x").await,
            Err(SessionError::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_events_dropped_after_restart() {
        let channel = Arc::new(MemoryChannel::new());
        let manager = SessionManager::new(channel.clone(), EngineConfig::default());
        let pane = PaneId::new("p");
        let surface = Arc::new(Recorder::default());
        manager.mount(MountOptions::new("p", "t", "w"), surface.clone());
        manager.first_paint(&pane).unwrap();
        settle().await;

        channel.push_event(&pane, StreamEvent::Exit(2)).await;
        settle().await;
        assert_eq!(
            manager.snapshot(&pane).unwrap().exit_reason,
            Some(ExitReason::Crashed(2))
        );

        manager.restart(&pane).unwrap();
        settle().await;
        assert_eq!(manager.snapshot(&pane).unwrap().state, SessionState::Attached);
        assert_eq!(channel.subscriber_count(), 1);
    }
}
