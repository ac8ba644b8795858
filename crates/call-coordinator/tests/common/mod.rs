//! Common test helpers for call-coordinator integration tests
//!
//! Hand-written stand-ins for every collaborator the coordinator talks to:
//! the OS telephony layer, the realtime signal channel, push delivery, the
//! app router and the media hooks. Each one records what it was asked to do
//! so tests can assert on the exact native traffic.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use callsync_call_coordinator::{
    CallDispatcher, CallDisplayRequest, CallNavigator, CallRoute, CallSignal, CallType, CallUiBridge, CallUuid,
    CoordinatorConfig, CoordinatorError, CoordinatorResult, KeyValueStore, MediaHooks, MemoryStore, NativeError,
    NativeTelephony, NotificationListener, PermissionStatus, PushDelivery, PushEvent, RawNativeEvent, SessionId,
    SignalChannel, SignalCoordinator, SignalStatus, TelephonyOptions, TraceBuffer,
};

// ===== NATIVE TELEPHONY =====

pub struct MockTelephony {
    /// Every native call in order, by operation name
    pub calls: Mutex<Vec<String>>,
    pub displayed: Mutex<Vec<CallDisplayRequest>>,
    pub started: Mutex<Vec<CallDisplayRequest>>,
    pub ended: Mutex<Vec<CallUuid>>,
    pub active: Mutex<Vec<CallUuid>>,
    pub connected: Mutex<Vec<CallUuid>>,
    pub muted: Mutex<Vec<(CallUuid, bool)>>,
    pub permission: Mutex<PermissionStatus>,
    pub fail_setup: AtomicBool,
    pub fail_display: AtomicBool,
    pub report_already_ended: AtomicBool,
    pub initial: Mutex<Vec<RawNativeEvent>>,
    events: broadcast::Sender<RawNativeEvent>,
}

impl MockTelephony {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            displayed: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            muted: Mutex::new(Vec::new()),
            permission: Mutex::new(PermissionStatus::Granted),
            fail_setup: AtomicBool::new(false),
            fail_display: AtomicBool::new(false),
            report_already_ended: AtomicBool::new(false),
            initial: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Deliver a live native event
    pub fn emit(&self, name: &str, body: Value) {
        let _ = self.events.send(RawNativeEvent::new(name, body));
    }

    pub fn answer(&self, uuid: &CallUuid) {
        self.emit("answer_call", json!({ "call_uuid": uuid.as_str() }));
    }

    pub fn hang_up(&self, uuid: &CallUuid) {
        self.emit("end_call", json!({ "call_uuid": uuid.as_str() }));
    }

    pub fn queue_initial(&self, name: &str, body: Value) {
        self.initial.lock().push(RawNativeEvent::new(name, body));
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn display_count(&self) -> usize {
        self.displayed.lock().len()
    }

    fn record(&self, operation: &str) {
        self.calls.lock().push(operation.to_string());
    }
}

#[async_trait]
impl NativeTelephony for MockTelephony {
    async fn request_permissions(&self) -> Result<PermissionStatus, NativeError> {
        self.record("request_permissions");
        Ok(*self.permission.lock())
    }

    async fn setup(&self, _options: &TelephonyOptions) -> Result<(), NativeError> {
        self.record("setup");
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(NativeError::platform("connection service unavailable"));
        }
        Ok(())
    }

    async fn start_call(&self, request: &CallDisplayRequest) -> Result<(), NativeError> {
        self.record("start_call");
        self.started.lock().push(request.clone());
        Ok(())
    }

    async fn display_incoming_call(&self, request: &CallDisplayRequest) -> Result<(), NativeError> {
        self.record("display_incoming_call");
        // Yield so concurrent callers really interleave
        tokio::task::yield_now().await;
        if self.fail_display.load(Ordering::SeqCst) {
            return Err(NativeError::platform("display refused"));
        }
        self.displayed.lock().push(request.clone());
        Ok(())
    }

    async fn end_call(&self, uuid: &CallUuid) -> Result<(), NativeError> {
        self.record("end_call");
        if self.report_already_ended.load(Ordering::SeqCst) {
            return Err(NativeError::AlreadyEnded);
        }
        self.ended.lock().push(uuid.clone());
        Ok(())
    }

    async fn end_all_calls(&self) -> Result<(), NativeError> {
        self.record("end_all_calls");
        Ok(())
    }

    async fn report_connected(&self, uuid: &CallUuid) -> Result<(), NativeError> {
        self.record("report_connected");
        self.connected.lock().push(uuid.clone());
        Ok(())
    }

    async fn set_call_active(&self, uuid: &CallUuid) -> Result<(), NativeError> {
        self.record("set_call_active");
        self.active.lock().push(uuid.clone());
        Ok(())
    }

    async fn set_muted(&self, uuid: &CallUuid, muted: bool) -> Result<(), NativeError> {
        self.record("set_muted");
        self.muted.lock().push((uuid.clone(), muted));
        Ok(())
    }

    async fn update_display(&self, _uuid: &CallUuid, _display_name: &str, _handle: &str) -> Result<(), NativeError> {
        self.record("update_display");
        Ok(())
    }

    async fn initial_events(&self) -> Result<Vec<RawNativeEvent>, NativeError> {
        self.record("initial_events");
        Ok(std::mem::take(&mut *self.initial.lock()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RawNativeEvent> {
        self.events.subscribe()
    }
}

// ===== REALTIME SIGNALS =====

pub struct MockSignals {
    sender: Mutex<Option<mpsc::Sender<CallSignal>>>,
    pub subscriptions: AtomicUsize,
    pub fail_subscribe: AtomicBool,
    pub updates: Mutex<Vec<(String, SignalStatus)>>,
    pub ended_rooms: Mutex<Vec<SessionId>>,
    pub stored: Mutex<HashMap<SessionId, CallSignal>>,
}

impl MockSignals {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
            ended_rooms: Mutex::new(Vec::new()),
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Push a signal down the live subscription
    pub async fn deliver(&self, signal: CallSignal) {
        self.stored.lock().insert(signal.room_id.clone(), signal.clone());
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(signal).await;
        }
    }

    pub fn statuses_for(&self, signal_id: &str) -> Vec<SignalStatus> {
        self.updates
            .lock()
            .iter()
            .filter(|(id, _)| id == signal_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl SignalChannel for MockSignals {
    async fn subscribe_to_incoming_calls(&self, _user_id: &str) -> CoordinatorResult<mpsc::Receiver<CallSignal>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(CoordinatorError::signal("realtime channel unreachable"));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock() = Some(tx);
        Ok(rx)
    }

    async fn update_signal_status(&self, signal_id: &str, status: SignalStatus) -> CoordinatorResult<()> {
        self.updates.lock().push((signal_id.to_string(), status));
        if let Some(stored) = self.stored.lock().values_mut().find(|s| s.id == signal_id) {
            stored.status = status;
        }
        Ok(())
    }

    async fn end_call_signals(&self, room_id: &SessionId) -> CoordinatorResult<()> {
        self.ended_rooms.lock().push(room_id.clone());
        Ok(())
    }

    async fn latest_signal(&self, room_id: &SessionId) -> CoordinatorResult<Option<CallSignal>> {
        Ok(self.stored.lock().get(room_id).cloned())
    }
}

// ===== NAVIGATION / MEDIA / PUSH =====

pub struct MockNavigator {
    pub routes: Mutex<Vec<CallRoute>>,
    pub fail: AtomicBool,
    pub attempts: AtomicUsize,
}

impl MockNavigator {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.routes.lock().len()
    }
}

#[async_trait]
impl CallNavigator for MockNavigator {
    async fn open_call_screen(&self, route: &CallRoute) -> CoordinatorResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoordinatorError::navigation("navigation container not mounted"));
        }
        self.routes.lock().push(route.clone());
        Ok(())
    }
}

pub struct MockMedia {
    pub muted: Mutex<Vec<bool>>,
    pub activations: AtomicUsize,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            muted: Mutex::new(Vec::new()),
            activations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaHooks for MockMedia {
    async fn audio_session_activated(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_muted(&self, muted: bool) {
        self.muted.lock().push(muted);
    }
}

pub struct MockPush {
    pub launch: Mutex<Option<Value>>,
    events: broadcast::Sender<PushEvent>,
}

impl MockPush {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            launch: Mutex::new(None),
            events,
        }
    }

    pub fn receive(&self, payload: Value) {
        let _ = self.events.send(PushEvent::Received(payload));
    }

    pub fn tap(&self, payload: Value) {
        let _ = self.events.send(PushEvent::Responded(payload));
    }
}

#[async_trait]
impl PushDelivery for MockPush {
    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    async fn last_notification_response(&self) -> CoordinatorResult<Option<Value>> {
        Ok(self.launch.lock().clone())
    }
}

// ===== HARNESS =====

/// Fully wired coordinator over mock collaborators
pub struct Harness {
    pub config: CoordinatorConfig,
    pub store: Arc<MemoryStore>,
    pub trace: Arc<TraceBuffer>,
    pub telephony: Arc<MockTelephony>,
    pub signals: Arc<MockSignals>,
    pub navigator: Arc<MockNavigator>,
    pub media: Arc<MockMedia>,
    pub push: Arc<MockPush>,
    pub bridge: Arc<CallUiBridge>,
    pub dispatcher: Arc<CallDispatcher>,
    pub coordinator: Arc<SignalCoordinator>,
    pub listener: Arc<NotificationListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_telephony(CoordinatorConfig::new("CallSync"), MockTelephony::new())
    }

    pub fn with_telephony(config: CoordinatorConfig, telephony: MockTelephony) -> Self {
        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KeyValueStore> = store.clone();
        let trace = Arc::new(TraceBuffer::from_config(Arc::clone(&kv), &config));
        let telephony = Arc::new(telephony);
        let bridge = Arc::new(CallUiBridge::new(telephony.clone(), kv, Arc::clone(&trace), &config));
        let navigator = Arc::new(MockNavigator::new());
        let dispatcher = Arc::new(CallDispatcher::new(Arc::clone(&bridge), navigator.clone(), &config));
        let signals = Arc::new(MockSignals::new());
        let media = Arc::new(MockMedia::new());
        let push = Arc::new(MockPush::new());
        let coordinator = Arc::new(SignalCoordinator::new(
            Arc::clone(&dispatcher),
            signals.clone(),
            media.clone(),
        ));
        let listener = Arc::new(NotificationListener::new(Arc::clone(&dispatcher), push.clone(), &config));
        Self {
            config,
            store,
            trace,
            telephony,
            signals,
            navigator,
            media,
            push,
            bridge,
            dispatcher,
            coordinator,
            listener,
        }
    }
}

// ===== FIXTURES =====

pub fn ringing_signal(id: &str, room: &str) -> CallSignal {
    CallSignal {
        id: id.to_string(),
        room_id: SessionId::from(room),
        caller_id: "alice".to_string(),
        caller_display_name: "Alice".to_string(),
        call_type: CallType::Video,
        status: SignalStatus::Ringing,
    }
}

pub fn call_payload(room: &str) -> Value {
    json!({
        "type": "call",
        "call_type": "video",
        "room_id": room,
        "caller_id": "alice",
        "caller_display_name": "Alice",
    })
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
