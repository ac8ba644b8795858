//! Diagnostic trace ring buffer
//!
//! A bounded, append-only breadcrumb trail of call lifecycle events. Every
//! entry carries the global [`TraceContext`] (session id, call uuid, user id)
//! so a dump can be filtered down to one call after a crash, and every write
//! persists the whole ring to the [`KeyValueStore`] immediately.
//!
//! The buffer also provides the guards wrapped around every native-bridge
//! call: a failing or panicking operation becomes an `error` entry and an
//! empty result instead of unwinding through the call-handling stack.
//!
//! ```rust
//! use callsync_call_coordinator::storage::MemoryStore;
//! use callsync_call_coordinator::trace::{TraceBuffer, TraceLevel};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let trace = TraceBuffer::new(Arc::new(MemoryStore::new()), "trace", 200);
//! trace.update_context(|ctx| ctx.session_id = Some("room-1".into()));
//! trace.warn("bridge", "duplicate_display", json!({ "uuid": "abc" }));
//!
//! let entries = trace.entries_for_session("room-1");
//! assert_eq!(entries.len(), 1);
//! assert_eq!(entries[0].level, TraceLevel::Warn);
//!
//! let value: Option<u32> = trace.guard("bridge", "parse", || "x".parse::<u32>());
//! assert!(value.is_none());
//! assert_eq!(trace.count("bridge", "parse"), 1);
//! ```

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::storage::KeyValueStore;

/// Tag used for entries recorded by the crash hooks
pub const CRASH_TAG: &str = "CRASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Trace,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
    pub tag: String,
    pub event: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl TraceEntry {
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Correlation fields merged into every entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub session_id: Option<String>,
    pub call_uuid: Option<String>,
    pub user_id: Option<String>,
}

impl TraceContext {
    fn merge_into(&self, fields: &mut Map<String, Value>) {
        let pairs = [
            ("session_id", &self.session_id),
            ("call_uuid", &self.call_uuid),
            ("user_id", &self.user_id),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                fields.entry(key.to_string()).or_insert_with(|| Value::String(value.clone()));
            }
        }
    }
}

pub struct TraceBuffer {
    capacity: usize,
    storage_key: String,
    store: Arc<dyn KeyValueStore>,
    ring: Mutex<VecDeque<TraceEntry>>,
    context: RwLock<TraceContext>,
}

impl std::fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("capacity", &self.capacity)
            .field("storage_key", &self.storage_key)
            .field("len", &self.len())
            .finish()
    }
}

impl TraceBuffer {
    pub fn new(store: Arc<dyn KeyValueStore>, storage_key: impl Into<String>, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            storage_key: storage_key.into(),
            store,
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            context: RwLock::new(TraceContext::default()),
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &CoordinatorConfig) -> Self {
        Self::new(store, config.trace_storage_key.clone(), config.trace_capacity)
    }

    /// Rebuild the buffer from the trail persisted by a previous process.
    ///
    /// An unreadable trail is discarded with a warning rather than failing
    /// startup.
    pub fn restore(store: Arc<dyn KeyValueStore>, config: &CoordinatorConfig) -> Self {
        let buffer = Self::from_config(store, config);
        match buffer.persisted_entries() {
            Ok(mut entries) => {
                if entries.len() > buffer.capacity {
                    entries.drain(..entries.len() - buffer.capacity);
                }
                debug!("Restored {} trace entries", entries.len());
                *buffer.ring.lock() = entries.into();
            }
            Err(e) => warn!("Discarding unreadable trace trail: {}", e),
        }
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_context(&self, context: TraceContext) {
        *self.context.write() = context;
    }

    pub fn update_context(&self, f: impl FnOnce(&mut TraceContext)) {
        f(&mut self.context.write());
    }

    pub fn context(&self) -> TraceContext {
        self.context.read().clone()
    }

    pub fn trace(&self, tag: &str, event: &str, fields: Value) {
        self.record(TraceLevel::Trace, tag, event, fields);
    }

    pub fn warn(&self, tag: &str, event: &str, fields: Value) {
        self.record(TraceLevel::Warn, tag, event, fields);
    }

    pub fn error(&self, tag: &str, event: &str, fields: Value) {
        self.record(TraceLevel::Error, tag, event, fields);
    }

    /// Append an entry and persist the ring.
    ///
    /// `fields` should be a JSON object; any other value is stored under `value`.
    pub fn record(&self, level: TraceLevel, tag: &str, event: &str, fields: Value) {
        let entry = self.build_entry(level, tag, event, fields, true);
        mirror_to_tracing(&entry);
        let mut ring = self.ring.lock();
        self.push_and_persist(&mut ring, entry);
    }

    /// Like [`record`](Self::record) but gives up instead of waiting on the
    /// ring lock. Used from the panic hook, which may run while the lock is held.
    fn record_nonblocking(&self, level: TraceLevel, tag: &str, event: &str, fields: Value) -> bool {
        let entry = self.build_entry(level, tag, event, fields, false);
        mirror_to_tracing(&entry);
        match self.ring.try_lock() {
            Some(mut ring) => {
                self.push_and_persist(&mut ring, entry);
                true
            }
            None => false,
        }
    }

    fn build_entry(&self, level: TraceLevel, tag: &str, event: &str, fields: Value, blocking: bool) -> TraceEntry {
        let mut context = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if blocking {
            self.context.read().merge_into(&mut context);
        } else if let Some(global) = self.context.try_read() {
            global.merge_into(&mut context);
        }
        TraceEntry {
            timestamp: Utc::now(),
            level,
            tag: tag.to_string(),
            event: event.to_string(),
            context,
        }
    }

    fn push_and_persist(&self, ring: &mut VecDeque<TraceEntry>, entry: TraceEntry) {
        ring.push_back(entry);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        let persisted = serde_json::to_string(&*ring)
            .map_err(CoordinatorError::from)
            .and_then(|raw| self.store.set(&self.storage_key, &raw));
        if let Err(e) = persisted {
            warn!("Failed to persist trace ring: {}", e);
        }
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries as currently written to storage
    pub fn persisted_entries(&self) -> CoordinatorResult<Vec<TraceEntry>> {
        match self.store.get(&self.storage_key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn entries_for_session(&self, session_id: &str) -> Vec<TraceEntry> {
        self.ring
            .lock()
            .iter()
            .filter(|e| e.context_str("session_id") == Some(session_id))
            .cloned()
            .collect()
    }

    /// Number of entries with the given tag and event name
    pub fn count(&self, tag: &str, event: &str) -> usize {
        self.ring
            .lock()
            .iter()
            .filter(|e| e.tag == tag && e.event == event)
            .count()
    }

    pub fn dump_json(&self) -> CoordinatorResult<String> {
        Ok(serde_json::to_string_pretty(&*self.ring.lock())?)
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.clear();
        if let Err(e) = self.store.remove(&self.storage_key) {
            warn!("Failed to clear persisted trace ring: {}", e);
        }
    }

    /// Run `f`; an `Err` or a panic is recorded as an error entry and yields `None`.
    pub fn guard<T, E, F>(&self, tag: &str, event: &str, f: F) -> Option<T>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _scope = GuardScope::enter();
            f()
        }));
        match caught {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.error(tag, event, json!({ "message": e.to_string() }));
                None
            }
            Err(payload) => {
                self.error(tag, event, json!({ "message": panic_message(&*payload), "panicked": true }));
                None
            }
        }
    }

    /// Async form of [`guard`](Self::guard)
    pub async fn guard_async<T, E, Fut>(&self, tag: &str, event: &str, fut: Fut) -> Option<T>
    where
        E: Display,
        Fut: Future<Output = Result<T, E>>,
    {
        match catch_unwind_guarded(fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.error(tag, event, json!({ "message": e.to_string() }));
                None
            }
            Err(payload) => {
                self.error(tag, event, json!({ "message": panic_message(&*payload), "panicked": true }));
                None
            }
        }
    }

    /// Run a best-effort future in the background.
    ///
    /// Nobody awaits the result: an `Err` becomes a `warn` entry and a panic
    /// becomes a `CRASH` entry.
    pub fn spawn_detached<E, Fut>(self: &Arc<Self>, tag: &'static str, event: &'static str, fut: Fut) -> JoinHandle<()>
    where
        E: Display + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let trace = Arc::clone(self);
        tokio::spawn(async move {
            match catch_unwind_guarded(fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace.warn(tag, event, json!({ "message": e.to_string() })),
                Err(payload) => trace.error(
                    CRASH_TAG,
                    "unhandled_task_panic",
                    json!({ "message": panic_message(&*payload), "origin": format!("{}:{}", tag, event) }),
                ),
            }
        })
    }
}

fn mirror_to_tracing(entry: &TraceEntry) {
    let context = Value::Object(entry.context.clone());
    match entry.level {
        TraceLevel::Trace => debug!(tag = %entry.tag, event = %entry.event, %context, "trace"),
        TraceLevel::Warn => warn!(tag = %entry.tag, event = %entry.event, %context, "trace"),
        TraceLevel::Error => error!(tag = %entry.tag, event = %entry.event, %context, "trace"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as running guarded code until dropped
struct GuardScope;

impl GuardScope {
    fn enter() -> Self {
        GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
        GuardScope
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        GUARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn in_guarded_scope() -> bool {
    GUARD_DEPTH.with(|depth| depth.get() > 0)
}

/// Poll `fut` to completion, catching a panic from any poll.
///
/// Each poll runs inside a guard scope, so the crash hook leaves panics
/// caught here to the caller.
pub(crate) async fn catch_unwind_guarded<Fut>(fut: Fut) -> Result<Fut::Output, Box<dyn Any + Send>>
where
    Fut: Future,
{
    let mut fut = std::pin::pin!(fut);
    let guarded = futures::future::poll_fn(move |cx| {
        let _scope = GuardScope::enter();
        fut.as_mut().poll(cx)
    });
    AssertUnwindSafe(guarded).catch_unwind().await
}

static CRASH_TARGET: RwLock<Option<Arc<TraceBuffer>>> = RwLock::new(None);
static CRASH_HOOK: Once = Once::new();

/// Record a `CRASH` entry for every panic that no guard will catch, then
/// hand over to the hook that was installed before.
///
/// The panic hook is process-global: the wrapper is installed on the first
/// call only, later calls just retarget it to `trace`. Returns `true` when
/// the wrapper was installed by this call.
pub fn install_crash_hook(trace: Arc<TraceBuffer>) -> bool {
    *CRASH_TARGET.write() = Some(trace);
    let mut installed = false;
    CRASH_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if in_guarded_scope() {
                previous(info);
                return;
            }
            if let Some(guard) = CRASH_TARGET.try_read() {
                if let Some(trace) = guard.as_ref() {
                    let location = info
                        .location()
                        .map(|l| format!("{}:{}", l.file(), l.line()))
                        .unwrap_or_default();
                    trace.record_nonblocking(
                        TraceLevel::Error,
                        CRASH_TAG,
                        "uncaught_panic",
                        json!({ "message": panic_message(info.payload()), "location": location }),
                    );
                }
            }
            previous(info);
        }));
        installed = true;
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serial_test::serial;

    fn buffer(capacity: usize) -> TraceBuffer {
        TraceBuffer::new(Arc::new(MemoryStore::new()), "trace", capacity)
    }

    #[test]
    fn test_ring_keeps_most_recent_in_order() {
        let trace = buffer(200);
        for i in 0..500 {
            trace.trace("test", "tick", json!({ "seq": i }));
        }
        let persisted = trace.persisted_entries().unwrap();
        assert_eq!(persisted.len(), 200);
        let seqs: Vec<u64> = persisted
            .iter()
            .map(|e| e.context.get("seq").and_then(Value::as_u64).unwrap())
            .collect();
        assert_eq!(seqs, (300..500).collect::<Vec<u64>>());
        assert_eq!(trace.entries(), persisted);
    }

    #[test]
    fn test_global_context_merged_but_not_overriding() {
        let trace = buffer(10);
        trace.set_context(TraceContext {
            session_id: Some("room-9".into()),
            call_uuid: None,
            user_id: Some("u-1".into()),
        });
        trace.trace("coordinator", "signal", json!({ "user_id": "explicit" }));
        let entry = &trace.entries()[0];
        assert_eq!(entry.context_str("session_id"), Some("room-9"));
        assert_eq!(entry.context_str("user_id"), Some("explicit"));
        assert!(entry.context.get("call_uuid").is_none());
    }

    #[test]
    fn test_restore_reads_previous_trail() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig::default();
        {
            let trace = TraceBuffer::from_config(store.clone(), &config);
            trace.error("bridge", "display_failed", json!({}));
        }
        let restored = TraceBuffer::restore(store, &config);
        assert_eq!(restored.count("bridge", "display_failed"), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_guard_async_swallows_panics() {
        let trace = buffer(10);
        let out: Option<()> = trace
            .guard_async("bridge", "set_muted", async {
                if true {
                    panic!("native exploded");
                }
                Ok::<(), String>(())
            })
            .await;
        assert!(out.is_none());
        let entry = &trace.entries()[0];
        assert_eq!(entry.level, TraceLevel::Error);
        assert_eq!(entry.context_str("message"), Some("native exploded"));
    }

    #[tokio::test]
    #[serial]
    async fn test_spawn_detached_records_failures() {
        let trace = Arc::new(buffer(10));
        trace
            .spawn_detached("signals", "update_status", async { Err::<(), _>("backend down") })
            .await
            .unwrap();
        trace
            .spawn_detached("signals", "update_status", async {
                if true {
                    panic!("boom");
                }
                Ok::<(), String>(())
            })
            .await
            .unwrap();
        assert_eq!(trace.count("signals", "update_status"), 1);
        assert_eq!(trace.count(CRASH_TAG, "unhandled_task_panic"), 1);
    }

    #[test]
    #[serial]
    fn test_crash_hook_wraps_previous_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);

        panic::set_hook(Box::new(|_| {
            PREVIOUS_CALLS.fetch_add(1, Ordering::SeqCst);
        }));

        let trace = Arc::new(buffer(10));
        assert!(install_crash_hook(trace.clone()));
        let _ = panic::catch_unwind(|| panic!("kaboom"));

        assert!(trace.count(CRASH_TAG, "uncaught_panic") >= 1);
        assert!(PREVIOUS_CALLS.load(Ordering::SeqCst) >= 1);
        assert!(!install_crash_hook(trace));
    }

    #[tokio::test]
    #[serial]
    async fn test_crash_hook_ignores_guarded_panics() {
        let trace = Arc::new(buffer(10));
        install_crash_hook(trace.clone());

        let out: Option<()> = trace
            .guard_async("bridge", "end_call", async {
                tokio::task::yield_now().await;
                if true {
                    panic!("native exploded");
                }
                Ok::<(), String>(())
            })
            .await;
        let sync_out: Option<()> = trace.guard("bridge", "mapping_lookup", || -> Result<(), String> {
            panic!("store exploded")
        });

        assert!(out.is_none());
        assert!(sync_out.is_none());
        assert_eq!(trace.count(CRASH_TAG, "uncaught_panic"), 0);
        assert_eq!(trace.count("bridge", "end_call"), 1);
        assert_eq!(trace.count("bridge", "mapping_lookup"), 1);

        // Unguarded panics on the same thread are still recorded
        let _ = panic::catch_unwind(|| panic!("really uncaught"));
        assert_eq!(trace.count(CRASH_TAG, "uncaught_panic"), 1);
    }
}
