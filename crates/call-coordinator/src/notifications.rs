//! Push notification listener
//!
//! Push is the second incoming-call channel. It covers three situations:
//!
//! - **foreground delivery**: the app is running; present the native UI
//!   (de-duplicated against the realtime channel by the bridge)
//! - **background tap**: the user tapped the notification; persist the
//!   mapping and open the call screen directly
//! - **cold start**: the process was launched by a tap; read the OS's last
//!   notification response once on [`NotificationListener::start`]
//!
//! Only payloads with `type == "call"` are handled; everything else is
//! ignored without a trace.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::DisplayOutcome;
use crate::call::{CallType, SessionId};
use crate::config::CoordinatorConfig;
use crate::dedup::DedupSet;
use crate::dispatch::{CallDispatcher, IncomingCall};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{CallSource, CoordinatorEvent};
use crate::trace::TraceBuffer;

const TAG: &str = "push";

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Delivered while the app was in the foreground
    Received(Value),
    /// The user tapped the notification
    Responded(Value),
}

/// OS push delivery
#[async_trait]
pub trait PushDelivery: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;

    /// Payload of the notification that launched the app, if any
    async fn last_notification_response(&self) -> CoordinatorResult<Option<Value>>;
}

/// Data of a call notification
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub call_type: CallType,
    pub room_id: String,
    pub caller_id: String,
    #[serde(default)]
    pub caller_display_name: Option<String>,
}

impl CallNotification {
    /// `Ok(None)` for a non-call notification, `Err` for a call payload
    /// that cannot be used.
    pub fn parse(payload: &Value) -> CoordinatorResult<Option<Self>> {
        if payload.get("type").and_then(Value::as_str) != Some("call") {
            return Ok(None);
        }
        let notification: CallNotification = serde_json::from_value(payload.clone())
            .map_err(|e| CoordinatorError::malformed(format!("call notification: {}", e)))?;
        if notification.room_id.trim().is_empty() {
            return Err(CoordinatorError::malformed("call notification without room_id"));
        }
        Ok(Some(notification))
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.room_id.trim())
    }

    pub fn incoming(&self, source: CallSource) -> IncomingCall {
        IncomingCall {
            session_id: self.session_id(),
            caller_id: self.caller_id.clone(),
            caller_display_name: self
                .caller_display_name
                .clone()
                .unwrap_or_else(|| self.caller_id.clone()),
            call_type: self.call_type,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStartOutcome {
    /// The app was not launched by a call notification
    NoCall,
    Navigated,
    AlreadyNavigated,
    /// Navigation failed and the native incoming UI was presented instead
    FellBack(DisplayOutcome),
}

pub struct NotificationListener {
    dispatcher: Arc<CallDispatcher>,
    push: Arc<dyn PushDelivery>,
    trace: Arc<TraceBuffer>,
    seen_rooms: DedupSet,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    pub fn new(dispatcher: Arc<CallDispatcher>, push: Arc<dyn PushDelivery>, config: &CoordinatorConfig) -> Self {
        Self {
            trace: Arc::clone(dispatcher.trace()),
            dispatcher,
            push,
            seen_rooms: DedupSet::new("seen_rooms", config.dedup_ttl()),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Handle the cold-start notification, then follow live deliveries.
    ///
    /// Returns `None` when the listener was already started.
    pub async fn start(self: &Arc<Self>) -> Option<ColdStartOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Notification listener already started");
            return None;
        }
        let mut deliveries = self.push.subscribe();
        let cold_start = self.handle_cold_start().await;

        let listener = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match deliveries.recv().await {
                    Ok(PushEvent::Received(payload)) => {
                        listener.handle_foreground(&payload).await;
                    }
                    Ok(PushEvent::Responded(payload)) => {
                        if let Err(e) = listener.handle_tap(&payload).await {
                            warn!("Notification tap not handled: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        listener.trace.warn(TAG, "deliveries_lagged", json!({ "missed": missed }));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Push delivery stream closed");
        });
        *self.task.lock() = Some(task);
        Some(cold_start)
    }

    /// Stop following deliveries; `start` may be called again afterwards
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn parse(&self, payload: &Value) -> Option<CallNotification> {
        match CallNotification::parse(payload) {
            Ok(notification) => notification,
            Err(e) => {
                self.trace
                    .warn(TAG, "malformed_notification", json!({ "reason": e.to_string() }));
                None
            }
        }
    }

    /// Foreground delivery: present the native incoming UI once per room
    pub async fn handle_foreground(&self, payload: &Value) -> Option<DisplayOutcome> {
        let notification = self.parse(payload)?;
        let session_id = notification.session_id();
        if !self.seen_rooms.try_claim(session_id.as_str()) {
            self.trace.trace(
                TAG,
                "duplicate_push_suppressed",
                json!({ "session_id": session_id.as_str() }),
            );
            if let Some(uuid) = self.dispatcher.bridge().uuid_for_session_id(&session_id) {
                self.dispatcher.publish(CoordinatorEvent::DuplicateSuppressed {
                    session_id,
                    uuid,
                    source: CallSource::PushForeground,
                });
            }
            return Some(DisplayOutcome::Duplicate);
        }
        let presented = self
            .dispatcher
            .present_incoming(&notification.incoming(CallSource::PushForeground))
            .await;
        Some(presented.display)
    }

    /// Background tap: persist the mapping and open the call screen.
    ///
    /// `Ok(false)` for non-call payloads and for a screen already opened.
    pub async fn handle_tap(&self, payload: &Value) -> CoordinatorResult<bool> {
        let Some(notification) = self.parse(payload) else {
            return Ok(false);
        };
        let incoming = notification.incoming(CallSource::PushTap);
        let uuid = self.dispatcher.bridge().resolve_uuid(&incoming.session_id);
        self.dispatcher.persist_mapping(&incoming.session_id, &uuid);
        self.dispatcher.open_call_screen(incoming.route(CallSource::PushTap)).await
    }

    /// Read the launch notification; navigate, or fall back to the native
    /// incoming UI (same uuid, at most once) when navigation fails.
    pub async fn handle_cold_start(&self) -> ColdStartOutcome {
        let launch = self
            .trace
            .guard_async(TAG, "last_notification_response", self.push.last_notification_response())
            .await
            .flatten();
        let Some(notification) = launch.as_ref().and_then(|payload| self.parse(payload)) else {
            return ColdStartOutcome::NoCall;
        };

        let incoming = notification.incoming(CallSource::ColdStart);
        let uuid = self.dispatcher.bridge().resolve_uuid(&incoming.session_id);
        self.dispatcher.persist_mapping(&incoming.session_id, &uuid);
        self.trace.trace(
            TAG,
            "cold_start_call",
            json!({ "session_id": incoming.session_id.as_str(), "call_uuid": uuid.as_str() }),
        );

        match self.dispatcher.open_call_screen(incoming.route(CallSource::ColdStart)).await {
            Ok(true) => ColdStartOutcome::Navigated,
            Ok(false) => ColdStartOutcome::AlreadyNavigated,
            Err(e) => {
                self.trace.warn(
                    TAG,
                    "cold_start_fallback",
                    json!({ "session_id": incoming.session_id.as_str(), "reason": e.to_string() }),
                );
                let display = self.dispatcher.present_incoming_with_uuid(&incoming, &uuid).await;
                ColdStartOutcome::FellBack(display)
            }
        }
    }
}
