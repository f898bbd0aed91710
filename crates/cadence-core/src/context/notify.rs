use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::path::{ContextPath, PathPattern};
use super::store::ContextEntry;

/// Handle returned by `ContextStore::subscribe`, used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

/// A change delivered to subscribers. `entry` is `None` when the path was removed.
#[derive(Debug, Clone)]
pub struct ContextEvent {
    pub path: ContextPath,
    pub entry: Option<ContextEntry>,
}

pub type Handler = Arc<dyn Fn(&ContextEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: PathPattern,
    handler: Handler,
}

/// Counts queued vs. handled notifications so callers can wait for the
/// worker to catch up.
#[derive(Default)]
struct Progress {
    handled: Mutex<u64>,
    cond: Condvar,
}

impl Progress {
    fn advance(&self, n: u64) {
        let mut handled = self.handled.lock().unwrap_or_else(|e| e.into_inner());
        *handled += n;
        self.cond.notify_all();
    }
}

/// Bounded notification queue plus a dedicated dispatch thread.
///
/// Writers only enqueue; handlers run on the worker thread, in registration
/// order for each event. When the queue is full the oldest notifications
/// are dropped and the loss is logged.
pub(crate) struct Notifier {
    tx: broadcast::Sender<ContextEvent>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: AtomicU64,
    queued: AtomicU64,
    progress: Arc<Progress>,
}

impl Notifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, mut rx) = broadcast::channel::<ContextEvent>(capacity.max(1));
        let subscriptions: Arc<RwLock<Vec<Subscription>>> = Arc::default();
        let progress: Arc<Progress> = Arc::default();

        let worker_subs = Arc::clone(&subscriptions);
        let worker_progress = Arc::clone(&progress);
        let spawned = std::thread::Builder::new()
            .name("context-notify".into())
            .spawn(move || loop {
                match rx.blocking_recv() {
                    Ok(event) => {
                        dispatch(&worker_subs, &event);
                        worker_progress.advance(1);
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        warn!(dropped, "Notification queue full, dropped oldest notifications");
                        worker_progress.advance(dropped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Notification worker shutting down");
                        break;
                    }
                }
            });
        // Without a worker the receiver is gone and every publish is counted as handled.
        if let Err(e) = spawned {
            error!("Failed to spawn context notification worker, notifications disabled: {e}");
        }

        Self {
            tx,
            subscriptions,
            next_id: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            progress,
        }
    }

    pub(crate) fn subscribe(&self, pattern: PathPattern, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        debug!(?id, %pattern, "Context subscription added");
        subs.push(Subscription {
            id,
            pattern,
            handler,
        });
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() < before
    }

    /// Queue an event. Never blocks the writer.
    pub(crate) fn publish(&self, event: ContextEvent) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            // Worker gone: account for the event so flush() does not wait on it.
            self.progress.advance(1);
        }
    }

    /// Wait until every event queued so far was dispatched or dropped.
    /// Returns false if `timeout` elapsed first.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let target = self.queued.load(Ordering::SeqCst);
        let handled = self
            .progress
            .handled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let (_handled, result) = self
            .progress
            .cond
            .wait_timeout_while(handled, timeout, |h| *h < target)
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }
}

fn dispatch(subscriptions: &RwLock<Vec<Subscription>>, event: &ContextEvent) {
    // Collect first so handlers may (un)subscribe without deadlocking.
    let targets: Vec<(SubscriptionId, Handler)> = subscriptions
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|s| s.pattern.matches(&event.path))
        .map(|s| (s.id, Arc::clone(&s.handler)))
        .collect();

    for (id, handler) in targets {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!(?id, path = %event.path, "Context subscriber panicked");
        }
    }
}
