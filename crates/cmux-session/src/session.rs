//! Per-pane session state.

use std::fmt;

use serde::Serialize;

use crate::channel::PaneId;

/// Why a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitReason {
    /// The user asked for the kill
    Killed,
    /// Any other exit, including status 0
    Crashed(i32),
}

/// Lifecycle of one pane's session.
///
/// ```text
/// Idle -> Attaching -> Attached -> Exited | Disconnected
///            |                          |
///            +-> AttachFailed           +-- restart --> Attaching
/// ```
///
/// Terminal states are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Attaching,
    Attached,
    Exited(ExitReason),
    /// The connection dropped; the backend may still be running
    Disconnected(String),
    AttachFailed(String),
}

impl SessionState {
    /// States left only by an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Exited(_) | SessionState::Disconnected(_) | SessionState::AttachFailed(_)
        )
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match self {
            SessionState::Exited(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Attaching => write!(f, "attaching"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Exited(ExitReason::Killed) => write!(f, "killed"),
            SessionState::Exited(ExitReason::Crashed(code)) => {
                write!(f, "exited with code {}", code)
            }
            SessionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            SessionState::AttachFailed(reason) => write!(f, "attach failed ({})", reason),
        }
    }
}

/// Kept for the life of a pane whose backend predates this UI instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColdRestoreState {
    pub is_restored: bool,
    pub last_known_cwd: Option<String>,
    #[serde(skip)]
    pub scrollback_snapshot: Option<Vec<u8>>,
}

/// Point-in-time view of a session for the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub pane_id: PaneId,
    pub backend_handle: Option<String>,
    pub state: SessionState,
    pub alternate_screen_active: bool,
    pub bracketed_paste_active: bool,
    pub cwd: Option<String>,
    pub title: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub cold_restore: Option<ColdRestoreState>,
    pub mounted: bool,
    pub focused: bool,
    pub queued: bool,
    pub recorded_bytes: usize,
}
