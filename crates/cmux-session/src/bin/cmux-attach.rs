//! Attach the local terminal to a pane session on a cmux session host.
//!
//! Keystrokes are forwarded as-is (raw mode); output goes through the same
//! lifecycle engine the app uses, so query replies are filtered and cold
//! restores are painted before live output. Press Ctrl-\ to detach.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cmux_session::{
    EngineConfig, ExitReason, MountOptions, PaneId, RenderSurface, SessionManager, SessionState,
    WsChannel,
};
use crossterm::{execute, terminal};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Ctrl-\
const DETACH_KEY: u8 = 0x1c;

/// Keystrokes held while the session is still attaching.
const MAX_EARLY_INPUT: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "cmux-attach")]
#[command(about = "Attach this terminal to a pane session")]
#[command(version)]
struct Cli {
    /// Session host mux endpoint
    #[arg(
        short = 'S',
        long,
        env = "CMUX_SESSION_URL",
        default_value = "ws://localhost:39383/mux"
    )]
    url: String,

    /// Pane to attach
    pane: String,

    /// Tab the pane belongs to (random when omitted)
    #[arg(long, env = "CMUX_TAB_ID")]
    tab: Option<String>,

    /// Workspace the pane belongs to
    #[arg(long, env = "CMUX_WORKSPACE_ID", default_value = "default")]
    workspace: String,

    /// Working directory for a newly created session
    #[arg(short, long)]
    cwd: Option<String>,

    /// Command to run when the session is created (repeatable)
    #[arg(short = 'e', long = "exec")]
    commands: Vec<String>,
}

/// Writes pane output straight to stdout and reports state changes to main.
struct StdoutSurface {
    state: watch::Sender<SessionState>,
}

impl RenderSurface for StdoutSurface {
    fn write(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }

    fn on_title_change(&self, title: &str) {
        let _ = execute!(std::io::stdout(), terminal::SetTitle(title));
    }

    fn on_state_change(&self, state: &SessionState) {
        self.state.send_replace(state.clone());
    }

    fn on_error(&self, message: &str) {
        warn!("[attach] {}", message);
    }
}

/// Raw mode for the lifetime of the attach, restored on drop.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Terminal resize notifications (SIGWINCH). Never fires off unix.
struct ResizeSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl ResizeSignal {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let inner = signal(SignalKind::window_change()).context("Failed to watch SIGWINCH")?;
            Ok(Self { inner })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            self.inner.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    }
}

/// Holds keystrokes typed before the session is attached and releases them,
/// in order, once it is.
#[derive(Debug, Default)]
struct InputGate {
    attached: bool,
    held: Vec<u8>,
}

impl InputGate {
    /// Bytes to send now, if any.
    fn accept(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        if input.is_empty() {
            return None;
        }
        if self.attached {
            return Some(input.to_vec());
        }
        if self.held.len() + input.len() > MAX_EARLY_INPUT {
            warn!("[attach] Input dropped: session not attached yet");
            return None;
        }
        self.held.extend_from_slice(input);
        None
    }

    /// Returns held input when the session just became attached.
    fn set_attached(&mut self, attached: bool) -> Option<Vec<u8>> {
        self.attached = attached;
        if attached && !self.held.is_empty() {
            Some(std::mem::take(&mut self.held))
        } else {
            None
        }
    }
}

enum Outcome {
    Detached,
    Ended(SessionState),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never mix with pane output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = EngineConfig::from_env();
    let channel = WsChannel::connect(&cli.url, &config)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;
    let manager = SessionManager::new(Arc::new(channel), config);

    let pane_id = PaneId::new(cli.pane);
    let (cols, rows) = terminal::size().context("Failed to read terminal size")?;
    let tab = cli
        .tab
        .unwrap_or_else(|| format!("attach-{}", Uuid::new_v4()));

    let mut options = MountOptions::new(pane_id.clone(), tab, cli.workspace)
        .size(cols, rows)
        .focused(true);
    if let Some(cwd) = cli.cwd {
        options = options.cwd(cwd);
    }
    if !cli.commands.is_empty() {
        options = options.initial_commands(cli.commands);
    }

    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let guard = RawModeGuard::enable()?;

    manager.mount(options, Arc::new(StdoutSurface { state: state_tx }));
    // Nothing to lay out; the terminal is ready as soon as we are
    manager.first_paint(&pane_id)?;

    let outcome = attach_loop(&manager, &pane_id, state_rx).await;

    manager.unmount(&pane_id)?;
    // Let the grace window run out so the host sees a clean detach
    tokio::time::sleep(manager.config().detach_grace() + Duration::from_millis(50)).await;
    drop(guard);

    match outcome? {
        Outcome::Detached => {
            eprintln!("[detached from {}]", pane_id);
            Ok(())
        }
        Outcome::Ended(SessionState::Exited(ExitReason::Crashed(code))) => {
            eprintln!("[{} exited with code {}]", pane_id, code);
            std::process::exit(code);
        }
        Outcome::Ended(state) => {
            eprintln!("[{}: {}]", pane_id, state);
            Ok(())
        }
    }
}

async fn attach_loop(
    manager: &SessionManager<WsChannel>,
    pane_id: &PaneId,
    mut state_rx: watch::Receiver<SessionState>,
) -> Result<Outcome> {
    let mut stdin = tokio::io::stdin();
    let mut resize = ResizeSignal::new()?;
    let mut buf = [0u8; 4096];
    let mut input_gate = InputGate::default();

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(Outcome::Detached);
                }
                let state = state_rx.borrow_and_update().clone();
                if state.is_terminal() {
                    return Ok(Outcome::Ended(state));
                }
                if let Some(held) = input_gate.set_attached(state == SessionState::Attached) {
                    forward(manager, pane_id, &held).await;
                }
            }
            read = stdin.read(&mut buf) => {
                let n = read.context("Failed to read stdin")?;
                if n == 0 {
                    return Ok(Outcome::Detached);
                }
                let input = &buf[..n];
                let (input, detach) = match input.iter().position(|&b| b == DETACH_KEY) {
                    Some(pos) => (&input[..pos], true),
                    None => (input, false),
                };
                if let Some(ready) = input_gate.accept(input) {
                    forward(manager, pane_id, &ready).await;
                }
                if detach {
                    info!("[attach] Detach requested");
                    return Ok(Outcome::Detached);
                }
            }
            _ = resize.recv() => {
                if let Ok((cols, rows)) = terminal::size() {
                    if let Err(e) = manager.resize(pane_id, cols, rows).await {
                        warn!("[attach] Resize failed: {}", e);
                    }
                }
            }
        }
    }
}

async fn forward(manager: &SessionManager<WsChannel>, pane_id: &PaneId, input: &[u8]) {
    if let Err(e) = manager.write(pane_id, input).await {
        warn!("[attach] Input dropped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_held_until_attached() {
        let mut gate = InputGate::default();
        assert_eq!(gate.accept(b"ls"), None);
        assert_eq!(gate.accept(b" -la\r"), None);
        assert_eq!(gate.set_attached(false), None);

        assert_eq!(gate.set_attached(true), Some(b"ls -la\r".to_vec()));
        assert_eq!(gate.accept(b"pwd\r"), Some(b"pwd\r".to_vec()));
        assert_eq!(gate.set_attached(true), None);
    }

    #[test]
    fn test_held_input_bounded() {
        let mut gate = InputGate::default();
        let big = vec![b'x'; MAX_EARLY_INPUT];
        assert_eq!(gate.accept(&big), None);
        assert_eq!(gate.accept(b"y"), None);
        assert_eq!(gate.set_attached(true).map(|held| held.len()), Some(MAX_EARLY_INPUT));
    }
}
