//! Scanner, mode tracker and filter composed into one per-session pass.

use crate::filter::QueryResponseFilter;
use crate::modes::ModeTracker;
use crate::scanner::{EscapeScanner, ScanEvent, ED3};

/// Result of running one output chunk through the pipeline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessedChunk {
    /// Bytes to hand to the display, query replies removed
    pub output: Vec<u8>,
    /// Offset into `output` just past the last ED3, when the chunk held one.
    /// Recorded scrollback should keep only `output[offset..]`.
    pub scrollback_cleared_at: Option<usize>,
    pub title: Option<String>,
    pub cwd: Option<String>,
    /// Number of query-reply sequences dropped
    pub suppressed: usize,
}

impl ProcessedChunk {
    pub fn cleared_scrollback(&self) -> bool {
        self.scrollback_cleared_at.is_some()
    }
}

/// Output pass for one session: O(chunk length), no look-ahead beyond the
/// scanner's bounded sequence buffer.
#[derive(Debug, Default)]
pub struct OutputPipeline {
    scanner: EscapeScanner,
    modes: ModeTracker,
    filter: QueryResponseFilter,
}

impl OutputPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, data: &[u8]) -> ProcessedChunk {
        let events = self.scanner.feed(data);
        self.apply(events)
    }

    /// Release any held partial sequence. Call when the stream ends.
    pub fn finish(&mut self) -> ProcessedChunk {
        let events = self.scanner.flush();
        self.apply(events)
    }

    pub fn modes(&self) -> &ModeTracker {
        &self.modes
    }

    /// Start over for a new stream (e.g. after a restart).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn apply(&mut self, events: Vec<ScanEvent>) -> ProcessedChunk {
        let mut chunk = ProcessedChunk::default();
        for event in events {
            self.modes.observe(&event);
            if self.filter.should_suppress(&event) {
                chunk.suppressed += 1;
                continue;
            }
            match event {
                ScanEvent::ClearScrollback => {
                    chunk.output.extend_from_slice(ED3);
                    chunk.scrollback_cleared_at = Some(chunk.output.len());
                }
                ScanEvent::PlainRun(bytes) => chunk.output.extend(bytes),
                other => chunk.output.extend_from_slice(other.as_bytes()),
            }
        }
        chunk.title = self.modes.take_title_update();
        chunk.cwd = self.modes.take_cwd_update();
        chunk
    }
}

/// Stateless filter for a complete buffer (snapshots, replayed scrollback).
/// For streaming use, prefer `OutputPipeline`, which handles split sequences.
pub fn filter_query_responses(data: &[u8]) -> Vec<u8> {
    let mut pipeline = OutputPipeline::new();
    let mut output = pipeline.process(data).output;
    output.extend(pipeline.finish().output);
    output
}
