//! Restore gating: decides when the initial attach content and buffered live
//! events may reach the surface.
//!
//! Live events that arrive before the surface has painted (or before the
//! attach result is known) are held in a pending queue. Once both the first
//! paint (or the fallback timer) and the attach result are in, the initial
//! content is released followed by the queue, in arrival order. The queue is
//! then retired and later events pass straight through.
//!
//! The coordinator is pure bookkeeping: every input returns the deliveries it
//! unlocked and the caller forwards them.

use std::collections::VecDeque;

use crate::channel::StreamEvent;

/// Something the surface should receive, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<E = StreamEvent> {
    /// Snapshot or scrollback that seeds the display
    Initial(Vec<u8>),
    Event(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttachStatus {
    Pending,
    Resolved(Option<Vec<u8>>),
}

/// Generic over the queued event type so callers can gate their own
/// already-processed events; defaults to raw stream events.
#[derive(Debug)]
pub struct RestoreCoordinator<E = StreamEvent> {
    painted: bool,
    attach: AttachStatus,
    applied: bool,
    pending: VecDeque<E>,
}

impl<E> Default for RestoreCoordinator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RestoreCoordinator<E> {
    pub fn new() -> Self {
        Self {
            painted: false,
            attach: AttachStatus::Pending,
            applied: false,
            pending: VecDeque::new(),
        }
    }

    /// Coordinator whose attach result is already known, e.g. a remount that
    /// reuses the live session and seeds from recorded output.
    pub fn seeded(initial: Option<Vec<u8>>) -> Self {
        Self {
            attach: AttachStatus::Resolved(initial),
            ..Self::new()
        }
    }

    /// Same attach status and pending queue, for a new surface that has not
    /// painted yet. Meaningless once applied; seed from recorded output instead.
    pub fn handover(self) -> Self {
        Self {
            painted: false,
            ..self
        }
    }

    /// Fresh coordinator for a new attach on the same surface. Keeps the
    /// paint flag so a restart does not wait for a paint that already happened.
    pub fn restarted(&self) -> Self {
        Self {
            painted: self.painted,
            ..Self::new()
        }
    }

    pub fn push_event(&mut self, event: E) -> Vec<Delivery<E>> {
        if self.applied {
            return vec![Delivery::Event(event)];
        }
        self.pending.push_back(event);
        Vec::new()
    }

    /// Record the attach outcome. `None` means there is nothing to seed
    /// (fresh session, or the attach failed). Only the first call counts.
    pub fn maybe_apply_initial_state(&mut self, initial: Option<Vec<u8>>) -> Vec<Delivery<E>> {
        if self.attach == AttachStatus::Pending {
            self.attach = AttachStatus::Resolved(initial);
        }
        self.try_apply()
    }

    pub fn on_first_paint(&mut self) -> Vec<Delivery<E>> {
        self.painted = true;
        self.try_apply()
    }

    /// The paint signal never came; stop waiting for it.
    pub fn on_fallback_timeout(&mut self) -> Vec<Delivery<E>> {
        self.on_first_paint()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn is_painted(&self) -> bool {
        self.painted
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn try_apply(&mut self) -> Vec<Delivery<E>> {
        if self.applied || !self.painted {
            return Vec::new();
        }
        let initial = match &mut self.attach {
            AttachStatus::Pending => return Vec::new(),
            AttachStatus::Resolved(initial) => initial.take(),
        };
        self.applied = true;

        let mut deliveries = Vec::with_capacity(self.pending.len() + 1);
        if let Some(bytes) = initial.filter(|b| !b.is_empty()) {
            deliveries.push(Delivery::Initial(bytes));
        }
        deliveries.extend(std::mem::take(&mut self.pending).into_iter().map(Delivery::Event));
        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn data(s: &str) -> StreamEvent {
        StreamEvent::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_cold_restore_then_buffered_data() {
        let mut restore: RestoreCoordinator = RestoreCoordinator::new();
        assert!(restore.push_event(data("live1")).is_empty());
        assert!(restore
            .maybe_apply_initial_state(Some(b"abc".to_vec()))
            .is_empty());
        assert!(restore.push_event(data("live2")).is_empty());
        assert_eq!(restore.pending_len(), 2);

        let delivered = restore.on_first_paint();
        assert_eq!(
            delivered,
            vec![
                Delivery::Initial(b"abc".to_vec()),
                Delivery::Event(data("live1")),
                Delivery::Event(data("live2")),
            ]
        );
        assert!(restore.is_applied());
        assert_eq!(restore.push_event(data("x")), vec![Delivery::Event(data("x"))]);
    }

    #[test]
    fn test_paint_before_attach_waits_for_result() {
        let mut restore: RestoreCoordinator = RestoreCoordinator::new();
        assert!(restore.on_first_paint().is_empty());
        restore.push_event(StreamEvent::Exit(1));
        let delivered = restore.maybe_apply_initial_state(None);
        assert_eq!(delivered, vec![Delivery::Event(StreamEvent::Exit(1))]);
    }

    #[test]
    fn test_fallback_timeout_releases() {
        let mut restore: RestoreCoordinator = RestoreCoordinator::new();
        restore.maybe_apply_initial_state(Some(b"snap".to_vec()));
        let delivered = restore.on_fallback_timeout();
        assert_eq!(delivered, vec![Delivery::Initial(b"snap".to_vec())]);
        assert!(restore.on_first_paint().is_empty(), "late paint is a no-op");
    }

    #[test]
    fn test_initial_state_applied_once() {
        let mut restore: RestoreCoordinator = RestoreCoordinator::seeded(Some(b"rec".to_vec()));
        assert_eq!(restore.on_first_paint(), vec![Delivery::Initial(b"rec".to_vec())]);
        assert!(restore
            .maybe_apply_initial_state(Some(b"again".to_vec()))
            .is_empty());
    }

    #[test]
    fn test_empty_initial_content_skipped() {
        let mut restore: RestoreCoordinator = RestoreCoordinator::seeded(Some(Vec::new()));
        assert!(restore.on_first_paint().is_empty());
        assert!(restore.is_applied());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Event(u8),
        Paint,
        Timeout,
        Attach,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => any::<u8>().prop_map(Step::Event),
            1 => Just(Step::Paint),
            1 => Just(Step::Timeout),
            1 => Just(Step::Attach),
        ]
    }

    proptest! {
        #[test]
        fn prop_events_delivered_once_in_order(steps in prop::collection::vec(step(), 0..64)) {
            let mut restore: RestoreCoordinator = RestoreCoordinator::new();
            let mut pushed = Vec::new();
            let mut delivered = Vec::new();
            let mut initial_count = 0;

            let mut collect = |out: Vec<Delivery>, delivered: &mut Vec<StreamEvent>| {
                for d in out {
                    match d {
                        Delivery::Initial(bytes) => {
                            assert_eq!(bytes, b"seed");
                            initial_count += 1;
                        }
                        Delivery::Event(e) => delivered.push(e),
                    }
                }
            };

            for step in steps {
                let out = match step {
                    Step::Event(b) => {
                        let event = StreamEvent::Data(vec![b]);
                        pushed.push(event.clone());
                        restore.push_event(event)
                    }
                    Step::Paint => restore.on_first_paint(),
                    Step::Timeout => restore.on_fallback_timeout(),
                    Step::Attach => restore.maybe_apply_initial_state(Some(b"seed".to_vec())),
                };
                collect(out, &mut delivered);
            }
            let out = restore.maybe_apply_initial_state(Some(b"seed".to_vec()));
            collect(out, &mut delivered);
            let out = restore.on_first_paint();
            collect(out, &mut delivered);

            prop_assert_eq!(delivered, pushed);
            prop_assert_eq!(initial_count, 1);
            prop_assert_eq!(restore.pending_len(), 0);
        }
    }
}
