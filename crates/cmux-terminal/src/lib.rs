//! cmux-terminal: escape sequence handling for pane output streams
//!
//! This crate provides:
//! - `EscapeScanner`: byte-at-a-time scanner that survives chunk boundaries
//! - `ModeTracker`: alternate-screen / bracketed-paste flags, title and cwd (OSC 7)
//! - `QueryResponseFilter`: drops DA/CPR/mode-report/color replies before display
//! - `OutputPipeline`: all three composed into one per-session pass
//!
//! # Usage
//!
//! ```rust
//! use cmux_terminal::OutputPipeline;
//!
//! let mut pipeline = OutputPipeline::new();
//! let chunk = pipeline.process(b"prompt\x1b[?1;2c$ ");
//! assert_eq!(chunk.output, b"prompt$ ");
//!
//! // Sequences may be split across reads
//! let chunk = pipeline.process(b"\x1b[?104");
//! assert!(chunk.output.is_empty());
//! pipeline.process(b"9h");
//! assert!(pipeline.modes().is_alternate_screen());
//! ```

mod filter;
mod modes;
mod pipeline;
mod scanner;

pub use filter::QueryResponseFilter;
pub use modes::{parse_osc7_path, ModeTracker, ALTERNATE_SCREEN_MODE, BRACKETED_PASTE_MODE};
pub use pipeline::{filter_query_responses, OutputPipeline, ProcessedChunk};
pub use scanner::{
    CsiSequence, EscapeScanner, OscSequence, ScanEvent, ED3, MAX_CSI_LEN, MAX_OSC_LEN,
};
