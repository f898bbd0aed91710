use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::notify::{ContextEvent, Handler, Notifier, SubscriptionId};
use super::path::{ContextPath, PathPattern};
use crate::error::ContextError;

/// Default capacity of the notification queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const SNAPSHOT_FORMAT: u32 = 1;

/// The current value at a path, with its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub path: ContextPath,
    pub value: Value,
    /// Strictly increases on every write to this path.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub writer: String,
}

/// Serialized form of the whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format: u32,
    /// Store-wide write sequence; every entry version is <= this.
    pub sequence: u64,
    pub entries: Vec<ContextEntry>,
}

impl Snapshot {
    /// Parse and sanity-check snapshot bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ContextError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        let corrupt = |detail: String| ContextError::StateCorruption {
            source_name: "snapshot".into(),
            detail,
        };
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(corrupt(format!("unsupported format {}", snapshot.format)));
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &snapshot.entries {
            if entry.version > snapshot.sequence {
                return Err(corrupt(format!(
                    "entry '{}' has version {} beyond sequence {}",
                    entry.path, entry.version, snapshot.sequence
                )));
            }
            if !seen.insert(&entry.path) {
                return Err(corrupt(format!("duplicate entry '{}'", entry.path)));
            }
        }
        Ok(snapshot)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ContextError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Default)]
struct Tree {
    entries: BTreeMap<ContextPath, ContextEntry>,
    sequence: u64,
}

impl Tree {
    fn descendants<'a>(
        &'a self,
        path: &'a ContextPath,
    ) -> impl Iterator<Item = (&'a ContextPath, &'a ContextEntry)> + 'a {
        self.entries
            .range(path.clone()..)
            .take_while(move |(p, _)| p.starts_with(path))
    }

    fn resolve(&self, path: &ContextPath) -> Option<Value> {
        if let Some(entry) = self.entries.get(path) {
            return Some(entry.value.clone());
        }

        // Nearest ancestor holding a structured value.
        for ancestor in path.ancestors() {
            if let Some(entry) = self.entries.get(&ancestor) {
                let rest = &path.segments()[ancestor.len()..];
                if let Some(found) = index_into(&entry.value, rest) {
                    return Some(found.clone());
                }
                break;
            }
        }

        // Compose an object from descendant entries.
        let mut composed = Value::Object(Map::new());
        let mut any = false;
        for (p, entry) in self.descendants(path) {
            any = true;
            insert_at(&mut composed, &p.segments()[path.len()..], entry.value.clone());
        }
        any.then_some(composed)
    }

    fn write(&mut self, path: ContextPath, value: Value, writer: &str) -> ContextEntry {
        self.sequence += 1;
        let entry = ContextEntry {
            path: path.clone(),
            value,
            version: self.sequence,
            updated_at: Utc::now(),
            writer: writer.to_string(),
        };
        self.entries.insert(path, entry.clone());
        entry
    }
}

fn index_into<'a>(value: &'a Value, rest: &[String]) -> Option<&'a Value> {
    rest.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn insert_at(target: &mut Value, rest: &[String], value: Value) {
    let Some((last, parents)) = rest.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        let Value::Object(map) = current else {
            // A shorter path already holds a scalar here; it wins.
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

/// Hierarchical, path-addressed state shared by every agent.
///
/// Reads take a shared lock and may run concurrently; `set`, `update` and
/// `remove` are serialized by the write lock. Subscribers are notified from
/// a separate worker after the lock is released, so notifications are hints:
/// read the store for the canonical value.
pub struct ContextStore {
    tree: RwLock<Tree>,
    notifier: Notifier,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            notifier: Notifier::new(capacity),
        }
    }

    /// Convenience for the common `Arc<ContextStore>` handle.
    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::with_queue_capacity(capacity))
    }

    fn read_tree(&self) -> Result<RwLockReadGuard<'_, Tree>, ContextError> {
        self.tree.read().map_err(|_| ContextError::Poisoned)
    }

    fn write_tree(&self) -> Result<RwLockWriteGuard<'_, Tree>, ContextError> {
        self.tree.write().map_err(|_| ContextError::Poisoned)
    }

    /// Value at `path`: the exact entry, else a field inside the nearest
    /// ancestor's value, else an object composed from descendant entries.
    pub fn get(&self, path: &str) -> Result<Value, ContextError> {
        let path = ContextPath::parse(path)?;
        self.read_tree()?
            .resolve(&path)
            .ok_or_else(|| ContextError::NotFound(path.to_string()))
    }

    /// Typed read. Missing paths yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ContextError> {
        match self.get(path) {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(ContextError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The exact entry stored at `path`, with version and writer.
    pub fn entry(&self, path: &str) -> Result<Option<ContextEntry>, ContextError> {
        let path = ContextPath::parse(path)?;
        Ok(self.read_tree()?.entries.get(&path).cloned())
    }

    /// Write `value` at `path` and return the new version.
    pub fn set<V: Serialize>(&self, path: &str, value: V, writer: &str) -> Result<u64, ContextError> {
        let path = ContextPath::parse(path)?;
        let value = serde_json::to_value(value)?;
        let entry = {
            let mut tree = self.write_tree()?;
            tree.write(path.clone(), value, writer)
        };
        let version = entry.version;
        self.notifier.publish(ContextEvent {
            path,
            entry: Some(entry),
        });
        Ok(version)
    }

    /// Atomic read-modify-write of the exact entry at `path`.
    ///
    /// `f` runs under the write lock with the current value; returning `None`
    /// leaves the entry untouched. Returns the new version if a write happened.
    pub fn update<F>(&self, path: &str, writer: &str, f: F) -> Result<Option<u64>, ContextError>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let path = ContextPath::parse(path)?;
        let entry = {
            let mut tree = self.write_tree()?;
            let current = tree.entries.get(&path).map(|e| &e.value);
            match f(current) {
                Some(next) => tree.write(path.clone(), next, writer),
                None => return Ok(None),
            }
        };
        let version = entry.version;
        self.notifier.publish(ContextEvent {
            path,
            entry: Some(entry),
        });
        Ok(Some(version))
    }

    /// Remove the entry at `path` and everything beneath it.
    ///
    /// Every removed entry gets its own tombstone event, so subscribers on a
    /// descendant pattern learn that their entry vanished. Returns how many
    /// entries were removed.
    pub fn remove(&self, path: &str, writer: &str) -> Result<usize, ContextError> {
        let path = ContextPath::parse(path)?;
        let doomed = {
            let mut tree = self.write_tree()?;
            let doomed: Vec<ContextPath> = tree.descendants(&path).map(|(p, _)| p.clone()).collect();
            for p in &doomed {
                tree.entries.remove(p);
            }
            if !doomed.is_empty() {
                tree.sequence += 1;
            }
            doomed
        };
        let removed = doomed.len();
        if removed > 0 {
            debug!(%path, removed, writer, "Context entries removed");
            for path in doomed {
                self.notifier.publish(ContextEvent { path, entry: None });
            }
        }
        Ok(removed)
    }

    /// Register `handler` for writes to paths matching `pattern` (or beneath it).
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId, ContextError>
    where
        F: Fn(&ContextEvent) + Send + Sync + 'static,
    {
        let pattern = PathPattern::parse(pattern)?;
        let handler: Handler = Arc::new(handler);
        Ok(self.notifier.subscribe(pattern, handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Block until queued notifications were dispatched (or dropped).
    pub fn flush_notifications(&self, timeout: Duration) -> bool {
        self.notifier.flush(timeout)
    }

    /// All current entries in path order.
    pub fn entries(&self) -> Result<Vec<ContextEntry>, ContextError> {
        Ok(self.read_tree()?.entries.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read_tree().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_snapshot(&self) -> Result<Snapshot, ContextError> {
        let tree = self.read_tree()?;
        Ok(Snapshot {
            format: SNAPSHOT_FORMAT,
            sequence: tree.sequence,
            entries: tree.entries.values().cloned().collect(),
        })
    }

    /// Serialize the full tree.
    pub fn snapshot(&self) -> Result<Vec<u8>, ContextError> {
        self.to_snapshot()?.encode()
    }

    /// Replace the full tree with a serialized snapshot.
    ///
    /// Subscribers are not notified; a restore is not a write.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), ContextError> {
        let snapshot = Snapshot::decode(bytes)?;
        self.restore_snapshot(snapshot)
    }

    pub fn restore_snapshot(&self, snapshot: Snapshot) -> Result<(), ContextError> {
        let count = snapshot.entries.len();
        let mut tree = self.write_tree()?;
        tree.sequence = snapshot.sequence;
        tree.entries = snapshot
            .entries
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect();
        info!(entries = count, sequence = tree.sequence, "Context restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    const FLUSH: Duration = Duration::from_secs(5);

    #[test]
    fn set_then_get() {
        let store = ContextStore::new();
        store.set("focus.current", json!({"level": "active"}), "test").unwrap();
        assert_eq!(store.get("focus.current").unwrap(), json!({"level": "active"}));
    }

    #[test]
    fn missing_path_is_not_found() {
        let store = ContextStore::new();
        let err = store.get("nothing.here").unwrap_err();
        assert!(matches!(err, ContextError::NotFound(p) if p == "nothing.here"));
        assert_eq!(store.get_as::<String>("nothing.here").unwrap(), None);
    }

    #[test]
    fn malformed_path_rejected_on_write() {
        let store = ContextStore::new();
        let err = store.set("focus..current", 1, "test").unwrap_err();
        assert!(matches!(err, ContextError::InvalidPath { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn versions_strictly_increase() {
        let store = ContextStore::new();
        let v1 = store.set("a", 1, "test").unwrap();
        let v2 = store.set("a", 2, "test").unwrap();
        let v3 = store.set("b", 3, "test").unwrap();
        let v4 = store.set("a", 4, "test").unwrap();
        assert!(v1 < v2 && v2 < v3 && v3 < v4);
        let entry = store.entry("a").unwrap().unwrap();
        assert_eq!(entry.version, v4);
        assert_eq!(entry.writer, "test");
    }

    #[test]
    fn reads_into_ancestor_value() {
        let store = ContextStore::new();
        store
            .set("env", json!({"now": "x", "events": [{"summary": "standup"}]}), "test")
            .unwrap();
        assert_eq!(store.get("env.now").unwrap(), json!("x"));
        assert_eq!(store.get("env.events.0.summary").unwrap(), json!("standup"));
        assert!(store.get("env.missing").is_err());
    }

    #[test]
    fn composes_from_descendants() {
        let store = ContextStore::new();
        store.set("focus.current.level", "active", "test").unwrap();
        store.set("focus.profile", json!({"mon-09": 0.5}), "test").unwrap();
        assert_eq!(
            store.get("focus").unwrap(),
            json!({"current": {"level": "active"}, "profile": {"mon-09": 0.5}})
        );
        // Sibling with a shared prefix is not a descendant.
        store.set("focused", true, "test").unwrap();
        assert_eq!(
            store.get("focus").unwrap(),
            json!({"current": {"level": "active"}, "profile": {"mon-09": 0.5}})
        );
    }

    #[test]
    fn update_is_guarded() {
        let store = ContextStore::new();
        store.set("slot", json!({"status": "pending"}), "test").unwrap();

        let first = store
            .update("slot", "test", |cur| {
                (cur?.get("status")? == "pending").then(|| json!({"status": "delivered"}))
            })
            .unwrap();
        assert!(first.is_some());

        let second = store
            .update("slot", "test", |cur| {
                (cur?.get("status")? == "pending").then(|| json!({"status": "delivered"}))
            })
            .unwrap();
        assert_eq!(second, None);
        assert_eq!(store.get("slot.status").unwrap(), json!("delivered"));
    }

    #[test]
    fn remove_drops_subtree() {
        let store = ContextStore::new();
        store.set("a.b", 1, "test").unwrap();
        store.set("a.c.d", 2, "test").unwrap();
        store.set("ab", 3, "test").unwrap();
        assert_eq!(store.remove("a", "test").unwrap(), 2);
        assert!(store.get("a").is_err());
        assert_eq!(store.get("ab").unwrap(), json!(3));
        assert_eq!(store.remove("a", "test").unwrap(), 0);
    }

    #[test]
    fn remove_sends_tombstone_per_entry() {
        let store = ContextStore::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            store
                .subscribe("a.c.d", move |event| {
                    log.lock().unwrap().push((event.path.to_string(), event.entry.is_none()));
                })
                .unwrap();
        }
        store.set("a.b", 1, "test").unwrap();
        store.set("a.c.d", 2, "test").unwrap();
        store.remove("a", "test").unwrap();
        assert!(store.flush_notifications(FLUSH));

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![("a.c.d".to_string(), false), ("a.c.d".to_string(), true)]
        );
    }

    #[test]
    fn concurrent_writes_are_serializable() {
        let store = Arc::new(ContextStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| {
                            let value = t * 1000 + i;
                            (store.set("shared.counter", value, "writer").unwrap(), value)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut writes: Vec<(u64, i32)> = Vec::new();
        for h in handles {
            let per_thread = h.join().unwrap();
            // Each writer observes its own versions strictly increasing.
            assert!(per_thread.windows(2).all(|w| w[0].0 < w[1].0));
            writes.extend(per_thread);
        }

        writes.sort_by_key(|(v, _)| *v);
        writes.dedup_by_key(|(v, _)| *v);
        assert_eq!(writes.len(), 800, "versions must be unique");

        let (top_version, top_value) = *writes.last().unwrap();
        let entry = store.entry("shared.counter").unwrap().unwrap();
        assert_eq!(entry.version, top_version);
        assert_eq!(entry.value, json!(top_value));
    }

    #[test]
    fn subscribers_notified_once_per_write_in_order() {
        let store = ContextStore::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, pattern) in [("parent", "focus"), ("exact", "focus.current"), ("wild", "*.current")] {
            let log = Arc::clone(&log);
            store
                .subscribe(pattern, move |event| {
                    log.lock().unwrap().push((name, event.path.to_string()));
                })
                .unwrap();
        }

        store.set("focus.current", 1, "test").unwrap();
        store.set("focus.profile", 2, "test").unwrap();
        store.set("environment.current", 3, "test").unwrap();
        assert!(store.flush_notifications(FLUSH));

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ("parent", "focus.current".to_string()),
                ("exact", "focus.current".to_string()),
                ("wild", "focus.current".to_string()),
                ("parent", "focus.profile".to_string()),
                ("wild", "environment.current".to_string()),
            ]
        );
    }

    #[test]
    fn concurrent_writers_each_notify_every_subscriber_once() {
        let store = Arc::new(ContextStore::with_queue_capacity(4096));
        let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for counter in &counters {
            let counter = Arc::clone(counter);
            store
                .subscribe("metrics", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        store.set(&format!("metrics.w{t}"), i, "writer").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(store.flush_notifications(FLUSH));
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1000);
        }
    }

    #[test]
    fn unsubscribed_handler_not_called() {
        let store = ContextStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = store
            .subscribe("a", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        store.set("a", 1, "test").unwrap();
        assert!(store.flush_notifications(FLUSH));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set("a", 2, "test").unwrap();
        assert!(store.flush_notifications(FLUSH));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let store = ContextStore::new();
        store.subscribe("a", |_| panic!("boom")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        store
            .subscribe("a", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        store.set("a", 1, "test").unwrap();
        store.set("a", 2, "test").unwrap();
        assert!(store.flush_notifications(FLUSH));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slow_subscriber_does_not_block_writer() {
        let store = ContextStore::with_queue_capacity(2);
        store
            .subscribe("a", |_| std::thread::sleep(Duration::from_millis(50)))
            .unwrap();

        let started = std::time::Instant::now();
        for i in 0..20 {
            store.set("a", i, "test").unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        // Overflowed notifications are dropped, the value is still canonical.
        assert!(store.flush_notifications(FLUSH));
        assert_eq!(store.get("a").unwrap(), json!(19));
    }

    #[test]
    fn subscriber_may_write_back_without_deadlock() {
        let store = Arc::new(ContextStore::new());
        let inner = Arc::clone(&store);
        store
            .subscribe("input", move |event| {
                if let Some(entry) = &event.entry {
                    inner.set("echo", entry.value.clone(), "echo").unwrap();
                }
            })
            .unwrap();

        store.set("input", "ping", "test").unwrap();
        assert!(store.flush_notifications(FLUSH));
        assert_eq!(store.get("echo").unwrap(), json!("ping"));
    }

    #[test]
    fn snapshot_restore_reproduces_tree() {
        let store = ContextStore::new();
        store.set("a.b", json!({"x": [1, 2.5, "s"]}), "one").unwrap();
        store.set("a.c", true, "two").unwrap();
        store.set("z", json!(null), "three").unwrap();
        store.set("a.c", false, "two").unwrap();

        let bytes = store.snapshot().unwrap();
        let restored = ContextStore::new();
        restored.restore(&bytes).unwrap();

        assert_eq!(restored.entries().unwrap(), store.entries().unwrap());
        assert_eq!(
            restored.to_snapshot().unwrap().sequence,
            store.to_snapshot().unwrap().sequence
        );

        // Versions keep increasing after a restore.
        let before = restored.entry("a.c").unwrap().unwrap().version;
        let after = restored.set("a.c", true, "two").unwrap();
        assert!(after > before);
    }

    #[test]
    fn restore_rejects_garbage() {
        let store = ContextStore::new();
        store.set("keep", 1, "test").unwrap();
        assert!(store.restore(b"{not json").is_err());

        let bad = json!({
            "format": 1,
            "sequence": 1,
            "entries": [{
                "path": "a", "value": 1, "version": 9,
                "updatedAt": "2026-01-01T00:00:00Z", "writer": "x"
            }]
        });
        let err = store.restore(&serde_json::to_vec(&bad).unwrap()).unwrap_err();
        assert!(matches!(err, ContextError::StateCorruption { .. }));
        // A failed restore leaves the store untouched.
        assert_eq!(store.get("keep").unwrap(), json!(1));
    }
}
