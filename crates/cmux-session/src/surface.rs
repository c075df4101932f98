use crate::session::SessionState;

/// The display a pane's output is drawn on.
///
/// Callbacks are invoked from a per-mount delivery task, one at a time and in
/// stream order, never while the engine holds a lock. Implementations may call
/// back into the `SessionManager`.
pub trait RenderSurface: Send + Sync {
    /// Already-filtered output bytes.
    fn write(&self, bytes: &[u8]);

    fn on_title_change(&self, _title: &str) {}

    fn on_cwd_change(&self, _cwd: &str) {}

    fn on_state_change(&self, _state: &SessionState) {}

    /// Non-fatal error reported by the backend or the attach.
    fn on_error(&self, _message: &str) {}
}
