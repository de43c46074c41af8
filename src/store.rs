use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of one identity-card scan pushed from a mobile device.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub citizen_id: String,
    pub image_path: PathBuf,
    pub received_at: DateTime<Local>,
    /// Original decoded message, kept for audit and debugging.
    pub raw_payload: Value,
}

/// Notification delivered to observers after a record is stored.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub citizen_id: String,
    pub image_path: PathBuf,
    pub raw_payload: Value,
}

impl ScanEvent {
    fn from_record(record: &ScanRecord) -> Self {
        Self {
            citizen_id: record.citizen_id.clone(),
            image_path: record.image_path.clone(),
            raw_payload: record.raw_payload.clone(),
        }
    }
}

pub type ObserverFn = dyn Fn(&ScanEvent) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

/// Process-wide map of citizen id to the latest scan record.
///
/// `put` and `get` are called from every connection handler thread.
/// Observers are dispatched on the thread that called `put`, after the
/// record is visible, and outside of either lock so a slow or panicking
/// observer cannot corrupt the map or stall other writers.
pub struct ScanStore {
    records: Mutex<HashMap<String, ScanRecord>>,
    observers: Mutex<Vec<(ObserverId, Arc<ObserverFn>)>>,
    next_observer: AtomicU64,
}

impl Default for ScanStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    /// Inserts or overwrites by citizen id (latest wins, no merge), then
    /// notifies every registered observer.
    pub fn put(&self, record: ScanRecord) {
        let event = ScanEvent::from_record(&record);
        lock(&self.records).insert(record.citizen_id.clone(), record);

        // Snapshot so observers registered or removed mid-dispatch do not
        // invalidate the iteration.
        let observers: Vec<_> = lock(&self.observers).clone();
        for (id, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                tracing::error!(
                    "Scan observer {:?} panicked for citizen id {}",
                    id,
                    event.citizen_id
                );
            }
        }
    }

    pub fn get(&self, citizen_id: &str) -> Option<ScanRecord> {
        lock(&self.records).get(citizen_id).cloned()
    }

    pub fn register_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ScanEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, Arc::new(observer)));
        id
    }

    /// Removes an observer by id. Removing an unknown id is a no-op.
    pub fn unregister_observer(&self, id: ObserverId) {
        lock(&self.observers).retain(|(observer_id, _)| *observer_id != id);
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }
}

// Observer panics are caught before they can poison anything; if a lock is
// poisoned anyway, the map itself is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channel bridge for single-threaded consumers.
///
/// Observer callbacks run on connection handler threads; presentation
/// layers must not act on them directly. A watcher forwards events into an
/// mpsc channel so the consumer drains them from its own context, and
/// unregisters itself when dropped.
pub struct ScanWatcher {
    store: Arc<ScanStore>,
    id: ObserverId,
    receiver: mpsc::Receiver<ScanEvent>,
}

impl ScanWatcher {
    pub fn new(store: Arc<ScanStore>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let id = store.register_observer(move |event| {
            // The consumer may be gone; that is its business, not ours.
            let _ = sender.send(event.clone());
        });
        Self {
            store,
            id,
            receiver,
        }
    }

    pub fn recv(&self) -> Option<ScanEvent> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<ScanEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<ScanEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ScanWatcher {
    fn drop(&mut self) {
        self.store.unregister_observer(self.id);
    }
}
