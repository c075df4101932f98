//! Engine tuning parameters.
//!
//! Defaults are conservative; hosts can override them from a settings file
//! (serde) or from the environment:
//! - `CMUX_MAX_CONCURRENT_ATTACHES`
//! - `CMUX_FIRST_PAINT_TIMEOUT_MS`
//! - `CMUX_DETACH_GRACE_MS`
//! - `CMUX_SCROLLBACK_LIMIT`
//! - `CMUX_REQUEST_TIMEOUT_MS`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_MAX_CONCURRENT_ATTACHES: usize = 4;
const DEFAULT_FIRST_PAINT_TIMEOUT_MS: u64 = 250;
const DEFAULT_DETACH_GRACE_MS: u64 = 500;
const DEFAULT_SCROLLBACK_LIMIT: usize = 200_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attach operations allowed in flight at once (K)
    pub max_concurrent_attaches: usize,
    /// How long restore waits for the first paint before applying anyway
    pub first_paint_timeout_ms: u64,
    /// How long an unmounted pane keeps its session before detaching
    pub detach_grace_ms: u64,
    /// Bytes of filtered output kept per session for remounts
    pub scrollback_limit_bytes: usize,
    /// Request/response timeout on the session host connection
    pub request_timeout_ms: u64,
    /// Per-subscription event channel capacity
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_attaches: DEFAULT_MAX_CONCURRENT_ATTACHES,
            first_paint_timeout_ms: DEFAULT_FIRST_PAINT_TIMEOUT_MS,
            detach_grace_ms: DEFAULT_DETACH_GRACE_MS,
            scrollback_limit_bytes: DEFAULT_SCROLLBACK_LIMIT,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `CMUX_*` environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var(&lookup, "CMUX_MAX_CONCURRENT_ATTACHES") {
            self.max_concurrent_attaches = v;
        }
        if let Some(v) = parse_var(&lookup, "CMUX_FIRST_PAINT_TIMEOUT_MS") {
            self.first_paint_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CMUX_DETACH_GRACE_MS") {
            self.detach_grace_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "CMUX_SCROLLBACK_LIMIT") {
            self.scrollback_limit_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "CMUX_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
        self
    }

    /// Concurrency bound, never below one.
    pub fn attach_concurrency(&self) -> usize {
        self.max_concurrent_attaches.max(1)
    }

    pub fn first_paint_timeout(&self) -> Duration {
        Duration::from_millis(self.first_paint_timeout_ms)
    }

    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("[config] Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
