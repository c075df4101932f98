//! cmux-session: keeps pane sessions attached, rendered and recoverable
//!
//! This crate provides:
//! - `ConnectionChannel`: RPC + per-pane event stream to the session host,
//!   implemented over WebSocket (`WsChannel`) and in-process (`MemoryChannel`)
//! - `AttachScheduler`: bounded, focus-first attach queue
//! - `RestoreCoordinator`: holds live output until the surface has painted
//!   and the attach content is applied
//! - `SessionManager`: one lifecycle state machine per pane
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cmux_session::{EngineConfig, MountOptions, RenderSurface, SessionManager, WsChannel};
//!
//! struct Stdout;
//!
//! impl RenderSurface for Stdout {
//!     fn write(&self, bytes: &[u8]) {
//!         use std::io::Write;
//!         let _ = std::io::stdout().write_all(bytes);
//!     }
//! }
//!
//! # async fn run() -> cmux_session::SessionResult<()> {
//! let config = EngineConfig::from_env();
//! let channel = Arc::new(WsChannel::connect("ws://127.0.0.1:3000/mux", &config).await?);
//! let manager = SessionManager::new(channel, config);
//!
//! let pane = "pane-1".into();
//! manager.mount(MountOptions::new("pane-1", "tab-1", "ws-1").focused(true), Arc::new(Stdout));
//! manager.first_paint(&pane)?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod error;
mod manager;
mod memory;
mod record;
mod restore;
mod scheduler;
mod session;
mod surface;
mod wire;
mod ws;

pub use channel::{
    AttachKind, AttachRequest, AttachResult, ConnectionChannel, PaneId, StreamEvent,
    SubscriberRegistry, Subscription,
};
pub use config::EngineConfig;
pub use error::{SessionError, SessionResult};
pub use manager::{wrap_paste, MountOptions, SessionManager};
pub use memory::{ChannelCall, MemoryChannel, KILLED_EXIT_CODE};
pub use record::ScrollbackRecord;
pub use restore::{Delivery, RestoreCoordinator};
pub use scheduler::{
    AttachPermit, AttachScheduler, CancelHandle, PRIORITY_BACKGROUND, PRIORITY_FOCUSED,
};
pub use session::{ColdRestoreState, ExitReason, SessionSnapshot, SessionState};
pub use surface::RenderSurface;
pub use wire::{ClientMessage, ServerMessage, UNKNOWN_EXIT_CODE};
pub use ws::WsChannel;
