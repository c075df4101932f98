use thiserror::Error;

use crate::channel::PaneId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("session {0} not found")]
    SessionNotFound(PaneId),
    #[error("session {pane} cannot {operation} while {state}")]
    InvalidState {
        pane: PaneId,
        operation: &'static str,
        state: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session host rejected request: {0}")]
    Rejected(String),
    #[error("connection to session host closed")]
    ChannelClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
