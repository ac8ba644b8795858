//! Shared incoming-call path
//!
//! The realtime coordinator and the push listener react to the same logical
//! event from different channels. Both go through [`CallDispatcher`], so
//! presenting the native UI is de-duplicated by the bridge's displayed set
//! and opening the call screen is de-duplicated per session here.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bridge::{CallUiBridge, DisplayOutcome};
use crate::call::{CallRole, CallSignal, CallType, CallUuid, SessionId};
use crate::config::CoordinatorConfig;
use crate::dedup::DedupSet;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{CallSource, CoordinatorEvent};
use crate::trace::{catch_unwind_guarded, TraceBuffer};

const TAG: &str = "dispatch";

/// An incoming call as learned from any channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub session_id: SessionId,
    pub caller_id: String,
    pub caller_display_name: String,
    pub call_type: CallType,
    pub source: CallSource,
}

impl IncomingCall {
    pub fn from_signal(signal: &CallSignal) -> Self {
        Self {
            session_id: signal.room_id.clone(),
            caller_id: signal.caller_id.clone(),
            caller_display_name: signal.caller_display_name.clone(),
            call_type: signal.call_type,
            source: CallSource::Realtime,
        }
    }

    pub fn route(&self, source: CallSource) -> CallRoute {
        CallRoute {
            session_id: self.session_id.clone(),
            role: CallRole::Callee,
            call_type: self.call_type,
            peer_id: self.caller_id.clone(),
            peer_display_name: Some(self.caller_display_name.clone()),
            source,
        }
    }
}

/// Everything the call screen needs to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRoute {
    pub session_id: SessionId,
    pub role: CallRole,
    pub call_type: CallType,
    pub peer_id: String,
    pub peer_display_name: Option<String>,
    pub source: CallSource,
}

/// Host-app router. Opening the screen is what eventually joins media.
#[async_trait]
pub trait CallNavigator: Send + Sync {
    async fn open_call_screen(&self, route: &CallRoute) -> CoordinatorResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentOutcome {
    pub uuid: CallUuid,
    pub display: DisplayOutcome,
}

pub struct CallDispatcher {
    bridge: Arc<CallUiBridge>,
    navigator: Arc<dyn CallNavigator>,
    trace: Arc<TraceBuffer>,
    navigated: DedupSet,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl CallDispatcher {
    pub fn new(bridge: Arc<CallUiBridge>, navigator: Arc<dyn CallNavigator>, config: &CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            trace: Arc::clone(bridge.trace()),
            bridge,
            navigator,
            navigated: DedupSet::new("navigated", config.dedup_ttl()),
            events,
        }
    }

    pub fn bridge(&self) -> &Arc<CallUiBridge> {
        &self.bridge
    }

    pub fn trace(&self) -> &Arc<TraceBuffer> {
        &self.trace
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    /// Resolve the call's uuid, persist the mapping, then present the native
    /// incoming UI (once per uuid, whichever channel gets here first).
    pub async fn present_incoming(&self, call: &IncomingCall) -> PresentOutcome {
        let uuid = self.bridge.resolve_uuid(&call.session_id);
        self.persist_mapping(&call.session_id, &uuid);
        let display = self.present_incoming_with_uuid(call, &uuid).await;
        PresentOutcome { uuid, display }
    }

    /// Present with an already-resolved uuid whose mapping is persisted
    pub async fn present_incoming_with_uuid(&self, call: &IncomingCall, uuid: &CallUuid) -> DisplayOutcome {
        let display = self
            .bridge
            .show_incoming_call(uuid, &call.caller_id, &call.caller_display_name, call.call_type.has_video())
            .await;
        let event = match display {
            DisplayOutcome::Displayed => CoordinatorEvent::IncomingPresented {
                session_id: call.session_id.clone(),
                uuid: uuid.clone(),
                source: call.source,
            },
            DisplayOutcome::Duplicate => CoordinatorEvent::DuplicateSuppressed {
                session_id: call.session_id.clone(),
                uuid: uuid.clone(),
                source: call.source,
            },
            DisplayOutcome::Failed => {
                warn!("Native incoming UI unavailable for {}", call.session_id);
                return display;
            }
        };
        self.publish(event);
        display
    }

    /// Persist the mapping; a storage failure is traced and the call goes on
    pub fn persist_mapping(&self, session_id: &SessionId, uuid: &CallUuid) -> bool {
        match self.bridge.persist_call_mapping(session_id, uuid) {
            Ok(()) => true,
            Err(e) => {
                self.trace.error(
                    TAG,
                    "mapping_persist_failed",
                    json!({ "session_id": session_id.as_str(), "message": e.to_string() }),
                );
                false
            }
        }
    }

    /// Open the call screen for a session, at most once per session.
    ///
    /// Returns `Ok(false)` for a suppressed duplicate. On failure the claim
    /// is released so a fallback or retry can act.
    pub async fn open_call_screen(&self, route: CallRoute) -> CoordinatorResult<bool> {
        let key = route.session_id.as_str().to_string();
        if !self.navigated.try_claim(&key) {
            debug!("Call screen for {} already opened", route.session_id);
            self.trace.trace(TAG, "duplicate_navigation_suppressed", json!({ "session_id": key }));
            return Ok(false);
        }

        let opened = catch_unwind_guarded(self.navigator.open_call_screen(&route))
            .await
            .unwrap_or_else(|_| Err(CoordinatorError::navigation("navigator panicked")));

        match opened {
            Ok(()) => {
                self.trace.trace(
                    TAG,
                    "call_screen_opened",
                    json!({ "session_id": key, "source": route.source }),
                );
                self.publish(CoordinatorEvent::CallScreenOpened {
                    session_id: route.session_id.clone(),
                    source: route.source,
                });
                Ok(true)
            }
            Err(e) => {
                self.navigated.release(&key);
                self.trace.error(
                    TAG,
                    "navigation_failed",
                    json!({ "session_id": key, "message": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub fn has_navigated(&self, session_id: &SessionId) -> bool {
        self.navigated.contains(session_id.as_str())
    }
}
