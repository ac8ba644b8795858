//! Native call-UI bridge
//!
//! [`CallUiBridge`] is the only component allowed to talk to the OS
//! telephony integration ([`NativeTelephony`]). It owns:
//!
//! - the setup sequence (permissions strictly before native setup)
//! - the displayed-call de-dup set shared by every incoming-call channel
//! - the durable call UUID ↔ session id mapping
//! - the one-shot native listener registration
//!
//! Every native call runs under [`TraceBuffer::guard_async`]: a native fault
//! becomes a trace entry and a `false`/`None` result, never a panic or an
//! error unwinding into the host.
//!
//! # Architecture
//!
//! ```text
//!  realtime signal ─┐                       ┌──────────────────────┐
//!                   ├─► CallDispatcher ───► │     CallUiBridge     │ ──► NativeTelephony (OS)
//!  push delivery ───┘                       │  displayed: DedupSet │
//!                                           │  mapping: KV store   │ ◄── RawNativeEvent
//!  SignalCoordinator ◄── NativeCallHandler ─┤  listener task       │
//!                                           └──────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallUuid, SessionId};
use crate::config::CoordinatorConfig;
use crate::dedup::DedupSet;
use crate::error::{CoordinatorError, CoordinatorResult, NativeError};
use crate::events::{NativeEvent, RawNativeEvent};
use crate::storage::KeyValueStore;
use crate::trace::TraceBuffer;

const TAG: &str = "bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Options handed to the native setup call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelephonyOptions {
    pub app_name: String,
    pub supports_video: bool,
    pub include_calls_in_recents: bool,
    pub max_calls_per_group: u32,
    pub ringtone_sound: Option<String>,
}

impl From<&CoordinatorConfig> for TelephonyOptions {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            supports_video: config.supports_video,
            include_calls_in_recents: config.include_calls_in_recents,
            max_calls_per_group: config.max_calls_per_group,
            ringtone_sound: config.ringtone_sound.clone(),
        }
    }
}

/// A call as presented to the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDisplayRequest {
    pub uuid: CallUuid,
    /// Caller handle (user id or number)
    pub handle: String,
    pub display_name: String,
    pub has_video: bool,
}

/// OS telephony integration (CallKit / ConnectionService style)
#[async_trait]
pub trait NativeTelephony: Send + Sync {
    async fn request_permissions(&self) -> Result<PermissionStatus, NativeError>;

    async fn setup(&self, options: &TelephonyOptions) -> Result<(), NativeError>;

    async fn start_call(&self, request: &CallDisplayRequest) -> Result<(), NativeError>;

    async fn display_incoming_call(&self, request: &CallDisplayRequest) -> Result<(), NativeError>;

    async fn end_call(&self, uuid: &CallUuid) -> Result<(), NativeError>;

    async fn end_all_calls(&self) -> Result<(), NativeError>;

    async fn report_connected(&self, uuid: &CallUuid) -> Result<(), NativeError>;

    async fn set_call_active(&self, uuid: &CallUuid) -> Result<(), NativeError>;

    async fn set_muted(&self, uuid: &CallUuid, muted: bool) -> Result<(), NativeError>;

    async fn update_display(&self, uuid: &CallUuid, display_name: &str, handle: &str) -> Result<(), NativeError>;

    /// Events the OS buffered while the app process was not running
    async fn initial_events(&self) -> Result<Vec<RawNativeEvent>, NativeError>;

    /// Live event stream
    fn subscribe_events(&self) -> broadcast::Receiver<RawNativeEvent>;
}

/// Receiver of validated native callbacks
#[async_trait]
pub trait NativeCallHandler: Send + Sync {
    async fn on_answer(&self, uuid: CallUuid);

    async fn on_end(&self, uuid: CallUuid);

    async fn on_did_display_incoming(&self, uuid: CallUuid, error: Option<String>);

    async fn on_toggle_mute(&self, uuid: CallUuid, muted: bool);

    async fn on_audio_session_activated(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
    Uninitialized,
    Ready,
    /// Native call UI unavailable; calls continue with in-app UI only
    Degraded { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOutcome {
    Displayed,
    /// Another channel already presented this call
    Duplicate,
    /// The native layer refused; the fault was traced
    Failed,
}

/// Disposer for the native listener registration.
///
/// Disposing (explicitly or on drop) stops event delivery and allows a
/// later registration, e.g. after logout and login.
#[derive(Debug)]
pub struct ListenerRegistration {
    task: Option<JoinHandle<()>>,
    registered: Arc<AtomicBool>,
}

impl ListenerRegistration {
    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.registered.store(false, Ordering::SeqCst);
            debug!("Native listeners disposed");
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct CallUiBridge {
    telephony: Arc<dyn NativeTelephony>,
    store: Arc<dyn KeyValueStore>,
    trace: Arc<TraceBuffer>,
    options: TelephonyOptions,
    request_permissions: bool,
    mapping_prefix: String,
    setup: Mutex<SetupState>,
    displayed: DedupSet,
    ended: DedupSet,
    listeners_registered: Arc<AtomicBool>,
}

impl std::fmt::Debug for CallUiBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallUiBridge")
            .field("options", &self.options)
            .field("displayed", &self.displayed.len())
            .field("listeners_registered", &self.listeners_registered.load(Ordering::SeqCst))
            .finish()
    }
}

impl CallUiBridge {
    pub fn new(
        telephony: Arc<dyn NativeTelephony>,
        store: Arc<dyn KeyValueStore>,
        trace: Arc<TraceBuffer>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            telephony,
            store,
            trace,
            options: TelephonyOptions::from(config),
            request_permissions: config.request_permissions,
            mapping_prefix: config.mapping_key_prefix.clone(),
            setup: Mutex::new(SetupState::Uninitialized),
            displayed: DedupSet::new("displayed", config.dedup_ttl()),
            ended: DedupSet::new("ended", config.dedup_ttl()),
            listeners_registered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trace(&self) -> &Arc<TraceBuffer> {
        &self.trace
    }

    /// Initialize the native call UI. Runs once; later calls return the
    /// first outcome. Concurrent callers wait for the first attempt.
    pub async fn setup(&self) -> SetupState {
        let mut state = self.setup.lock().await;
        if *state != SetupState::Uninitialized {
            return state.clone();
        }

        if self.request_permissions {
            let permissions = self
                .trace
                .guard_async(TAG, "request_permissions", self.telephony.request_permissions())
                .await;
            match permissions {
                Some(PermissionStatus::Granted) => {}
                Some(PermissionStatus::Denied) => {
                    *state = self.degrade("permissions denied");
                    return state.clone();
                }
                None => {
                    *state = self.degrade("permission request failed");
                    return state.clone();
                }
            }
        }

        *state = match self
            .trace
            .guard_async(TAG, "setup", self.telephony.setup(&self.options))
            .await
        {
            Some(()) => {
                info!("Native call UI ready for {}", self.options.app_name);
                self.trace.trace(TAG, "setup_ready", json!({}));
                SetupState::Ready
            }
            None => self.degrade("native setup failed"),
        };
        state.clone()
    }

    fn degrade(&self, reason: &str) -> SetupState {
        warn!("Native call UI degraded: {}", reason);
        self.trace.warn(TAG, "setup_degraded", json!({ "reason": reason }));
        SetupState::Degraded { reason: reason.to_string() }
    }

    pub async fn setup_state(&self) -> SetupState {
        self.setup.lock().await.clone()
    }

    pub async fn start_outgoing_call(&self, uuid: &CallUuid, handle: &str, display_name: &str, has_video: bool) -> bool {
        let request = CallDisplayRequest {
            uuid: uuid.clone(),
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            has_video,
        };
        self.trace.trace(TAG, "start_outgoing_call", json!({ "call_uuid": uuid.as_str() }));
        self.ended.release(uuid.as_str());
        self.trace
            .guard_async(TAG, "start_outgoing_call", self.telephony.start_call(&request))
            .await
            .is_some()
    }

    /// Present an incoming call, at most once per `uuid` across all channels
    pub async fn show_incoming_call(
        &self,
        uuid: &CallUuid,
        handle: &str,
        display_name: &str,
        has_video: bool,
    ) -> DisplayOutcome {
        if !self.displayed.try_claim(uuid.as_str()) {
            self.trace
                .trace(TAG, "duplicate_display_suppressed", json!({ "call_uuid": uuid.as_str() }));
            return DisplayOutcome::Duplicate;
        }
        let request = CallDisplayRequest {
            uuid: uuid.clone(),
            handle: handle.to_string(),
            display_name: display_name.to_string(),
            has_video,
        };
        let shown = self
            .trace
            .guard_async(TAG, "display_incoming_call", self.telephony.display_incoming_call(&request))
            .await;
        match shown {
            Some(()) => {
                self.trace.trace(TAG, "incoming_displayed", json!({ "call_uuid": uuid.as_str() }));
                DisplayOutcome::Displayed
            }
            None => DisplayOutcome::Failed,
        }
    }

    pub fn is_displayed(&self, uuid: &CallUuid) -> bool {
        self.displayed.contains(uuid.as_str())
    }

    /// End a call. A repeat for the same uuid, or a native "already ended"
    /// answer, is a logged no-op. Returns whether the OS ended a live call.
    ///
    /// The repeat guard lasts until the uuid is mapped or started again:
    /// uuids are derived from the session id, so a redial reuses them.
    pub async fn end_call(&self, uuid: &CallUuid) -> bool {
        if !self.ended.try_claim(uuid.as_str()) {
            debug!("end_call for {} already handled", uuid);
            self.trace.trace(TAG, "end_call_noop", json!({ "call_uuid": uuid.as_str() }));
            return false;
        }
        let telephony = &self.telephony;
        let trace = &self.trace;
        self.trace
            .guard_async(TAG, "end_call", async {
                match telephony.end_call(uuid).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_already_ended() => {
                        trace.trace(TAG, "end_call_already_ended", json!({ "call_uuid": uuid.as_str() }));
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
            .unwrap_or(false)
    }

    pub async fn end_all_calls(&self) {
        let telephony = &self.telephony;
        self.trace
            .guard_async(TAG, "end_all_calls", async {
                match telephony.end_all_calls().await {
                    Err(e) if e.is_already_ended() => Ok(()),
                    other => other,
                }
            })
            .await;
    }

    pub async fn report_outgoing_call_connected(&self, uuid: &CallUuid) -> bool {
        self.trace
            .guard_async(TAG, "report_connected", self.telephony.report_connected(uuid))
            .await
            .is_some()
    }

    pub async fn set_call_active(&self, uuid: &CallUuid) -> bool {
        self.trace
            .guard_async(TAG, "set_call_active", self.telephony.set_call_active(uuid))
            .await
            .is_some()
    }

    pub async fn set_muted(&self, uuid: &CallUuid, muted: bool) -> bool {
        self.trace
            .guard_async(TAG, "set_muted", self.telephony.set_muted(uuid, muted))
            .await
            .is_some()
    }

    pub async fn update_display(&self, uuid: &CallUuid, display_name: &str, handle: &str) -> bool {
        self.trace
            .guard_async(TAG, "update_display", self.telephony.update_display(uuid, display_name, handle))
            .await
            .is_some()
    }

    // ===== CALL UUID MAPPING =====

    fn uuid_key(&self, uuid: &CallUuid) -> String {
        format!("{}:uuid:{}", self.mapping_prefix, uuid)
    }

    fn session_key(&self, session_id: &SessionId) -> String {
        format!("{}:session:{}", self.mapping_prefix, session_id)
    }

    /// Persist both directions of the mapping. Replaces an older uuid
    /// previously mapped to the same session.
    ///
    /// A new mapping is a new call, so `end_call` works again for `uuid`.
    pub fn persist_call_mapping(&self, session_id: &SessionId, uuid: &CallUuid) -> CoordinatorResult<()> {
        self.ended.release(uuid.as_str());
        if let Some(previous) = self.uuid_for_session_id(session_id) {
            if &previous != uuid {
                self.store.remove(&self.uuid_key(&previous))?;
            }
        }
        self.store.set(&self.uuid_key(uuid), session_id.as_str())?;
        self.store.set(&self.session_key(session_id), uuid.as_str())?;
        self.trace.trace(
            TAG,
            "mapping_persisted",
            json!({ "session_id": session_id.as_str(), "call_uuid": uuid.as_str() }),
        );
        Ok(())
    }

    pub fn session_id_for_uuid(&self, uuid: &CallUuid) -> Option<SessionId> {
        self.lookup(&self.uuid_key(uuid)).map(SessionId::from)
    }

    pub fn uuid_for_session_id(&self, session_id: &SessionId) -> Option<CallUuid> {
        self.lookup(&self.session_key(session_id)).map(CallUuid::new)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.trace.guard(TAG, "mapping_lookup", || self.store.get(key)).flatten()
    }

    /// The uuid to use for `session_id`: the persisted one, else the stable derived one
    pub fn resolve_uuid(&self, session_id: &SessionId) -> CallUuid {
        self.uuid_for_session_id(session_id)
            .unwrap_or_else(|| CallUuid::for_session(session_id))
    }

    /// Remove both directions of the mapping for `uuid`.
    ///
    /// Returns `false` when nothing was mapped, so callers can tell the
    /// first removal from a repeat.
    pub fn clear_call_mapping(&self, uuid: &CallUuid) -> bool {
        let Some(session_id) = self.session_id_for_uuid(uuid) else {
            return false;
        };
        let removed: CoordinatorResult<()> = (|| {
            self.store.remove(&self.uuid_key(uuid))?;
            if self.uuid_for_session_id(&session_id).as_ref() == Some(uuid) {
                self.store.remove(&self.session_key(&session_id))?;
            }
            Ok(())
        })();
        match removed {
            Ok(()) => {
                self.trace.trace(
                    TAG,
                    "mapping_cleared",
                    json!({ "session_id": session_id.as_str(), "call_uuid": uuid.as_str() }),
                );
                true
            }
            Err(e) => {
                self.trace.error(TAG, "mapping_clear_failed", json!({ "message": e.to_string() }));
                false
            }
        }
    }

    // ===== NATIVE LISTENERS =====

    /// Register `handler` for native callbacks.
    ///
    /// Only one registration may be live; a second attempt logs a warning and
    /// returns `None`. Events the OS buffered while the process was dead are
    /// replayed through the same handler before live events. Must be called
    /// from within a tokio runtime.
    pub fn register_listeners(&self, handler: Arc<dyn NativeCallHandler>) -> Option<ListenerRegistration> {
        if self.listeners_registered.swap(true, Ordering::SeqCst) {
            warn!("Native listeners already registered; ignoring re-registration");
            self.trace.warn(TAG, "listeners_already_registered", json!({}));
            return None;
        }

        // Subscribe before draining so nothing slips between replay and live delivery.
        let mut live = self.telephony.subscribe_events();
        let telephony = Arc::clone(&self.telephony);
        let trace = Arc::clone(&self.trace);

        let task = tokio::spawn(async move {
            let initial = trace
                .guard_async(TAG, "initial_events", telephony.initial_events())
                .await
                .unwrap_or_default();
            if !initial.is_empty() {
                trace.trace(TAG, "replaying_initial_events", json!({ "count": initial.len() }));
            }
            for raw in initial {
                dispatch_native_event(&trace, handler.as_ref(), raw).await;
            }
            loop {
                match live.recv().await {
                    Ok(raw) => dispatch_native_event(&trace, handler.as_ref(), raw).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        trace.warn(TAG, "native_events_lagged", json!({ "missed": missed }));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Native event stream closed");
                        break;
                    }
                }
            }
        });

        self.trace.trace(TAG, "listeners_registered", json!({}));
        Some(ListenerRegistration {
            task: Some(task),
            registered: Arc::clone(&self.listeners_registered),
        })
    }

    pub fn listeners_registered(&self) -> bool {
        self.listeners_registered.load(Ordering::SeqCst)
    }
}

async fn dispatch_native_event(trace: &TraceBuffer, handler: &dyn NativeCallHandler, raw: RawNativeEvent) {
    let event = match NativeEvent::parse(&raw) {
        Ok(event) => event,
        Err(e) => {
            trace.warn(TAG, "malformed_native_event", json!({ "name": raw.name, "reason": e.to_string() }));
            return;
        }
    };
    trace.trace(
        TAG,
        "native_event",
        json!({ "name": event.name(), "call_uuid": event.uuid().map(CallUuid::as_str) }),
    );
    let name = event.name();
    trace
        .guard_async(TAG, name, async move {
            match event {
                NativeEvent::Answer { uuid } => handler.on_answer(uuid).await,
                NativeEvent::End { uuid } => handler.on_end(uuid).await,
                NativeEvent::DidDisplayIncoming { uuid, error } => handler.on_did_display_incoming(uuid, error).await,
                NativeEvent::ToggleMute { uuid, muted } => handler.on_toggle_mute(uuid, muted).await,
                NativeEvent::AudioSessionActivated => handler.on_audio_session_activated().await,
            }
            Ok::<(), CoordinatorError>(())
        })
        .await;
}
