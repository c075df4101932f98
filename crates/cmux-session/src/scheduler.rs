//! Attach scheduler.
//!
//! Serializes session creation so that many panes mounting at once (window
//! restore, layout switch) do not stampede the session host. At most `limit`
//! attaches are in flight; queued entries run focused-first (priority 0), then
//! background (priority 1), FIFO within a priority.
//!
//! Dispatch happens on the next turn of the runtime rather than inside
//! `enqueue`, so panes enqueued together are ordered by priority as a batch.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::PaneId;

/// Priority of the currently focused pane.
pub const PRIORITY_FOCUSED: u8 = 0;

/// Priority of background panes.
pub const PRIORITY_BACKGROUND: u8 = 1;

type RunFn = Box<dyn FnOnce(AttachPermit) + Send>;

struct Entry {
    id: u64,
    pane_id: PaneId,
    priority: u8,
    run: RunFn,
}

struct SchedulerInner {
    limit: usize,
    in_flight: usize,
    next_id: u64,
    queue: VecDeque<Entry>,
    dispatch_scheduled: bool,
}

impl SchedulerInner {
    /// Index of the next entry to run: lowest priority value, earliest enqueued.
    fn next_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.id))
            .map(|(i, _)| i)
    }
}

/// Bounded-concurrency priority queue for attach operations.
#[derive(Clone)]
pub struct AttachScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl fmt::Debug for AttachScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AttachScheduler")
            .field("limit", &inner.limit)
            .field("in_flight", &inner.in_flight)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

impl AttachScheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                limit: limit.max(1),
                in_flight: 0,
                next_id: 0,
                queue: VecDeque::new(),
                dispatch_scheduled: false,
            })),
        }
    }

    /// Queue an attach. `run` receives a permit that holds the concurrency
    /// slot until it is dropped or `done()` is called.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(
        &self,
        pane_id: PaneId,
        priority: u8,
        run: impl FnOnce(AttachPermit) + Send + 'static,
    ) -> CancelHandle {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            debug!(
                "[scheduler] Queued {} (priority {}, {} waiting, {} in flight)",
                pane_id,
                priority,
                inner.queue.len(),
                inner.in_flight
            );
            inner.queue.push_back(Entry {
                id,
                pane_id,
                priority,
                run: Box::new(run),
            });
            id
        };
        self.schedule_dispatch();
        CancelHandle {
            id,
            scheduler: Arc::downgrade(&self.inner),
        }
    }

    /// Change the priority of a still-queued pane (e.g. it gained focus).
    /// Returns false if the pane is not waiting.
    pub fn reprioritize(&self, pane_id: &PaneId, priority: u8) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        for entry in inner.queue.iter_mut().filter(|e| &e.pane_id == pane_id) {
            entry.priority = priority;
            found = true;
        }
        found
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    fn schedule_dispatch(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.dispatch_scheduled {
                return;
            }
            inner.dispatch_scheduled = true;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.inner.lock().dispatch_scheduled = false;
            scheduler.dispatch();
        });
    }

    /// Start queued entries while slots are free.
    fn dispatch(&self) {
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                if inner.in_flight >= inner.limit {
                    return;
                }
                let Some(index) = inner.next_index() else {
                    return;
                };
                let Some(entry) = inner.queue.remove(index) else {
                    return;
                };
                inner.in_flight += 1;
                entry
            };
            debug!(
                "[scheduler] Starting attach for {} (priority {})",
                entry.pane_id, entry.priority
            );
            let permit = AttachPermit {
                scheduler: self.clone(),
                released: AtomicBool::new(false),
            };
            (entry.run)(permit);
        }
    }

    fn release(&self) {
        {
            let mut inner = self.inner.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        self.schedule_dispatch();
    }
}

/// Holds one concurrency slot. Released on `done()` or drop.
pub struct AttachPermit {
    scheduler: AttachScheduler,
    released: AtomicBool,
}

impl fmt::Debug for AttachPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachPermit")
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl AttachPermit {
    pub fn done(self) {
        drop(self);
    }
}

impl Drop for AttachPermit {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.scheduler.release();
        }
    }
}

/// Cancels a queued entry. A cancelled entry never runs; cancelling one that
/// already started is a no-op.
#[derive(Debug)]
pub struct CancelHandle {
    id: u64,
    scheduler: Weak<Mutex<SchedulerInner>>,
}

impl CancelHandle {
    /// Returns true if the entry was still queued and is now removed.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.scheduler.upgrade() else {
            return false;
        };
        let mut inner = inner.lock();
        match inner.queue.iter().position(|e| e.id == self.id) {
            Some(index) => {
                if let Some(entry) = inner.queue.remove(index) {
                    debug!("[scheduler] Cancelled queued attach for {}", entry.pane_id);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_focused_panes_run_first() {
        let scheduler = AttachScheduler::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let permits = Arc::new(Mutex::new(Vec::new()));

        let priorities = [1, 0, 1, 0, 1, 0, 0];
        for (i, priority) in priorities.into_iter().enumerate() {
            let order = order.clone();
            let permits = permits.clone();
            scheduler.enqueue(PaneId::new(format!("p{}", i)), priority, move |permit| {
                order.lock().push((i, priority));
                permits.lock().push(permit);
            });
        }

        // Release permits one at a time until everything has run
        for _ in 0..priorities.len() {
            tokio::task::yield_now().await;
            let permit = permits.lock().pop();
            drop(permit);
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;

        let order = order.lock().clone();
        assert_eq!(order.len(), priorities.len());
        let first_background = order.iter().position(|(_, p)| *p == 1).unwrap();
        assert!(
            order[..first_background].iter().all(|(_, p)| *p == 0),
            "all focused entries run before background: {:?}",
            order
        );
        assert_eq!(first_background, 4);
        // FIFO within a priority
        let focused: Vec<_> = order.iter().filter(|(_, p)| *p == 0).map(|(i, _)| *i).collect();
        assert_eq!(focused, vec![1, 3, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let scheduler = AttachScheduler::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            scheduler.enqueue(PaneId::new(format!("p{}", i)), (i % 2) as u8, move |permit| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    permit.done();
                });
            });
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_entry_never_runs() {
        let scheduler = AttachScheduler::new(1);
        let ran = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let ran = ran.clone();
                scheduler.enqueue(PaneId::new(format!("p{}", i)), 1, move |_permit| {
                    ran.lock().push(i);
                })
            })
            .collect();

        assert!(handles[1].cancel());
        assert!(!handles[1].cancel(), "second cancel is a no-op");

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*ran.lock(), vec![0, 2]);
        assert!(!handles[0].cancel(), "started entry cannot be cancelled");
    }

    #[tokio::test]
    async fn test_reprioritize_moves_pane_ahead() {
        let scheduler = AttachScheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Mutex::new(None));

        // Occupy the only slot
        {
            let held = held.clone();
            scheduler.enqueue(PaneId::new("busy"), 0, move |permit| {
                *held.lock() = Some(permit);
            });
        }
        tokio::task::yield_now().await;

        for name in ["a", "b", "c"] {
            let order = order.clone();
            scheduler.enqueue(PaneId::new(name), 1, move |_permit| {
                order.lock().push(name);
            });
        }
        assert!(scheduler.reprioritize(&PaneId::new("c"), PRIORITY_FOCUSED));
        assert!(!scheduler.reprioritize(&PaneId::new("missing"), PRIORITY_FOCUSED));

        held.lock().take();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*order.lock(), vec!["c", "a", "b"]);
    }
}
