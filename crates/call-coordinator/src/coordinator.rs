//! Signal coordinator
//!
//! [`SignalCoordinator`] is the single entry point mounted once per
//! authenticated session. It wires three independent event sources
//! together:
//!
//! - realtime call signals from the backend ([`SignalChannel`])
//! - native call-UI callbacks (answer, end, mute, audio session) through
//!   the [`CallUiBridge`] listener registration
//! - the host app itself, for outgoing calls and local phase changes
//!
//! The coordinator never joins media. Answering navigates to the call
//! screen; the screen owns the media session.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use callsync_call_coordinator::coordinator::SignalCoordinator;
//! # async fn example(coordinator: Arc<SignalCoordinator>) -> callsync_call_coordinator::CoordinatorResult<()> {
//! coordinator.initialize("user-42").await?;
//! // Mounting again (e.g. a re-rendered root) does nothing.
//! coordinator.initialize("user-42").await?;
//!
//! let mut events = coordinator.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("call event: {:?}", event);
//! }
//!
//! coordinator.teardown().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{CallUiBridge, ListenerRegistration, NativeCallHandler, SetupState};
use crate::call::{CallPhase, CallRole, CallSession, CallSignal, CallType, CallUuid, SessionId, SignalStatus};
use crate::dispatch::{CallDispatcher, CallRoute, IncomingCall};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{CallSource, CoordinatorEvent, EndReason};
use crate::mode::UiMode;
use crate::trace::TraceBuffer;

const TAG: &str = "coordinator";

/// Backend realtime channel carrying call signals
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Stream of signals addressed to `user_id`, in delivery order
    async fn subscribe_to_incoming_calls(&self, user_id: &str) -> CoordinatorResult<mpsc::Receiver<CallSignal>>;

    async fn update_signal_status(&self, signal_id: &str, status: SignalStatus) -> CoordinatorResult<()>;

    /// Close every open signal for a room
    async fn end_call_signals(&self, room_id: &SessionId) -> CoordinatorResult<()>;

    async fn latest_signal(&self, room_id: &SessionId) -> CoordinatorResult<Option<CallSignal>>;
}

/// Media-layer hooks owned by the host app
#[async_trait]
pub trait MediaHooks: Send + Sync {
    async fn audio_session_activated(&self);

    async fn set_muted(&self, muted: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Initializing,
    Ready,
}

struct Lifecycle {
    registration: Option<ListenerRegistration>,
    subscription: Option<JoinHandle<()>>,
}

pub struct SignalCoordinator {
    inner: Arc<CoordinatorInner>,
    /// Written only while `lifecycle` is held
    state: RwLock<CoordinatorState>,
    lifecycle: Mutex<Lifecycle>,
}

/// State shared with the native handler and the subscription task
struct CoordinatorInner {
    dispatcher: Arc<CallDispatcher>,
    bridge: Arc<CallUiBridge>,
    signals: Arc<dyn SignalChannel>,
    media: Arc<dyn MediaHooks>,
    trace: Arc<TraceBuffer>,
    retained: DashMap<SessionId, CallSignal>,
    sessions: DashMap<SessionId, CallSession>,
    /// Sessions answered on this device, with their pending accept write
    answered: DashMap<SessionId, JoinHandle<()>>,
    muted: AtomicBool,
}

impl SignalCoordinator {
    pub fn new(dispatcher: Arc<CallDispatcher>, signals: Arc<dyn SignalChannel>, media: Arc<dyn MediaHooks>) -> Self {
        let bridge = Arc::clone(dispatcher.bridge());
        let trace = Arc::clone(dispatcher.trace());
        Self {
            inner: Arc::new(CoordinatorInner {
                dispatcher,
                bridge,
                signals,
                media,
                trace,
                retained: DashMap::new(),
                sessions: DashMap::new(),
                answered: DashMap::new(),
                muted: AtomicBool::new(false),
            }),
            state: RwLock::new(CoordinatorState::Uninitialized),
            lifecycle: Mutex::new(Lifecycle {
                registration: None,
                subscription: None,
            }),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    fn set_state(&self, _lifecycle: &Lifecycle, state: CoordinatorState) {
        *self.state.write() = state;
    }

    /// Bring the coordinator up for `user_id`.
    ///
    /// Steps run in order: bridge setup, native handler registration,
    /// realtime subscription. A second call while initializing or ready
    /// returns `Ok(())` without touching anything.
    pub async fn initialize(&self, user_id: &str) -> CoordinatorResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != CoordinatorState::Uninitialized {
            debug!("Coordinator already initialized; skipping");
            self.inner.trace.trace(TAG, "initialize_skipped", json!({ "user_id": user_id }));
            return Ok(());
        }
        self.set_state(&lifecycle, CoordinatorState::Initializing);

        let user = user_id.to_string();
        self.inner.trace.update_context(|context| context.user_id = Some(user));
        self.inner.trace.trace(TAG, "initialize", json!({}));

        if let SetupState::Degraded { reason } = self.inner.bridge.setup().await {
            warn!("Continuing without native call UI: {}", reason);
        }

        let handler: Arc<dyn NativeCallHandler> = Arc::new(NativeHandler {
            inner: Arc::clone(&self.inner),
        });
        lifecycle.registration = self.inner.bridge.register_listeners(handler);

        let mut incoming = match self.inner.signals.subscribe_to_incoming_calls(user_id).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.inner
                    .trace
                    .error(TAG, "subscribe_failed", json!({ "message": e.to_string() }));
                if let Some(registration) = lifecycle.registration.take() {
                    registration.dispose();
                }
                self.set_state(&lifecycle, CoordinatorState::Uninitialized);
                return Err(e);
            }
        };

        let inner = Arc::clone(&self.inner);
        lifecycle.subscription = Some(tokio::spawn(async move {
            while let Some(signal) = incoming.recv().await {
                inner.handle_signal(signal).await;
            }
            debug!("Realtime signal stream closed");
        }));

        self.set_state(&lifecycle, CoordinatorState::Ready);
        info!("Call coordinator ready for user {}", user_id);
        self.inner.trace.trace(TAG, "ready", json!({}));
        Ok(())
    }

    /// Dispose listeners and the subscription so a later login starts clean
    pub async fn teardown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(registration) = lifecycle.registration.take() {
            registration.dispose();
        }
        if let Some(subscription) = lifecycle.subscription.take() {
            subscription.abort();
        }
        self.inner.retained.clear();
        self.inner.sessions.clear();
        self.inner.answered.clear();
        self.set_state(&lifecycle, CoordinatorState::Uninitialized);
        self.inner.trace.trace(TAG, "teardown", json!({}));
        self.inner.trace.set_context(Default::default());
        info!("Call coordinator torn down");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.dispatcher.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<CallDispatcher> {
        &self.inner.dispatcher
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn retained_signal(&self, session_id: &SessionId) -> Option<CallSignal> {
        self.inner.retained.get(session_id).map(|s| s.value().clone())
    }

    pub fn session(&self, session_id: &SessionId) -> Option<CallSession> {
        self.inner.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// UI mode for a session, computed by the mode deriver
    pub fn current_mode(&self, session_id: &SessionId) -> Option<UiMode> {
        self.inner
            .sessions
            .get(session_id)
            .map(|session| session.ui_mode(&self.inner.trace))
    }

    /// Place a call as caller and report it to the OS
    pub async fn start_outgoing_call(
        &self,
        session_id: SessionId,
        handle: &str,
        display_name: &str,
        call_type: CallType,
    ) -> CoordinatorResult<CallUuid> {
        self.begin_session(session_id.clone(), CallRole::Caller, call_type)?;

        let uuid = self.inner.bridge.resolve_uuid(&session_id);
        self.inner.bridge.persist_call_mapping(&session_id, &uuid)?;
        self.inner.trace.update_context(|context| {
            context.session_id = Some(session_id.to_string());
            context.call_uuid = Some(uuid.to_string());
        });

        self.inner.bridge.setup().await;
        if !self
            .inner
            .bridge
            .start_outgoing_call(&uuid, handle, display_name, call_type.has_video())
            .await
        {
            warn!("OS did not accept outgoing call {}; continuing in-app", uuid);
        }
        Ok(uuid)
    }

    /// Register a local session. Re-registering an active session with the
    /// same role is accepted; a different role is refused.
    pub fn begin_session(&self, session_id: SessionId, role: CallRole, call_type: CallType) -> CoordinatorResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.inner.sessions.entry(session_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_terminal() {
                    existing.insert(CallSession::new(session_id, role, call_type));
                    Ok(())
                } else if existing.get().role != role {
                    Err(CoordinatorError::invariant(format!(
                        "session {} is already active as {:?}",
                        session_id,
                        existing.get().role
                    )))
                } else {
                    Ok(())
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(CallSession::new(session_id, role, call_type));
                Ok(())
            }
        }
    }

    /// Drive the local state machine and return the resulting UI mode.
    ///
    /// `connected` as caller is reported to the OS; a terminal phase
    /// releases the native call, the signals and the mapping.
    pub async fn advance_session(&self, session_id: &SessionId, phase: CallPhase) -> CoordinatorResult<UiMode> {
        let (role, mode) = {
            let mut session = self
                .inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinatorError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            if let Err(e) = session.transition(phase) {
                let level_event = match e {
                    CoordinatorError::InvariantViolation { .. } => "invariant_violation",
                    _ => "invalid_transition",
                };
                self.inner.trace.error(
                    TAG,
                    level_event,
                    json!({ "session_id": session_id.as_str(), "to": phase, "message": e.to_string() }),
                );
                return Err(e);
            }
            (session.role, session.ui_mode(&self.inner.trace))
        };

        if phase == CallPhase::Connected && role == CallRole::Caller {
            if let Some(uuid) = self.inner.bridge.uuid_for_session_id(session_id) {
                self.inner.bridge.report_outgoing_call_connected(&uuid).await;
            }
        }
        if phase == CallPhase::Error {
            self.inner
                .trace
                .error(TAG, "call_failed", json!({ "session_id": session_id.as_str() }));
        }
        if phase.is_terminal() {
            self.inner.release_call(session_id).await;
        }
        Ok(mode)
    }

    /// Hang up locally
    pub async fn end_session(&self, session_id: &SessionId) -> CoordinatorResult<()> {
        let forced = self
            .inner
            .sessions
            .get_mut(session_id)
            .map(|mut session| session.force_end());
        if forced.is_none() && self.inner.bridge.uuid_for_session_id(session_id).is_none() {
            return Err(CoordinatorError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        self.inner.release_call(session_id).await;
        Ok(())
    }

    pub fn set_remote_joined(&self, session_id: &SessionId, joined: bool) -> CoordinatorResult<()> {
        let mut session = self
            .inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoordinatorError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        session.set_remote_joined(joined);
        Ok(())
    }

    pub async fn escalate_to_video(&self, session_id: &SessionId) -> CoordinatorResult<()> {
        {
            let mut session = self
                .inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| CoordinatorError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            session.escalate_to_video()?;
        }
        self.inner
            .trace
            .trace(TAG, "escalated_to_video", json!({ "session_id": session_id.as_str() }));
        Ok(())
    }

    /// Mute from the app side; the OS call UI and media hook follow
    pub async fn set_muted(&self, session_id: &SessionId, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        if let Some(uuid) = self.inner.bridge.uuid_for_session_id(session_id) {
            self.inner.bridge.set_muted(&uuid, muted).await;
        }
        self.inner.media.set_muted(muted).await;
    }
}

impl CoordinatorInner {
    async fn handle_signal(self: &Arc<Self>, signal: CallSignal) {
        self.trace.trace(
            TAG,
            "signal_received",
            json!({
                "signal_id": signal.id,
                "session_id": signal.room_id.as_str(),
                "status": signal.status.as_str(),
            }),
        );
        match signal.status {
            SignalStatus::Ringing => {
                let call = IncomingCall::from_signal(&signal);
                self.retained.insert(signal.room_id.clone(), signal);
                self.dispatcher.present_incoming(&call).await;
            }
            SignalStatus::Declined | SignalStatus::Ended => {
                let closing = signal.status;
                let removed = self.retained.remove_if(&signal.room_id, |_, retained| {
                    retained.status == SignalStatus::Ringing
                        || (retained.status == SignalStatus::Accepted && closing == SignalStatus::Ended)
                });
                let Some((room_id, retained)) = removed else {
                    return;
                };
                if retained.status == SignalStatus::Ringing {
                    info!("Caller cancelled {} before answer", room_id);
                    self.end_remotely(room_id, EndReason::RemoteCancelled).await;
                } else {
                    info!("Remote side hung up {}", room_id);
                    self.answered.remove(&room_id);
                    self.end_remotely(room_id, EndReason::RemoteEnded).await;
                }
            }
            SignalStatus::Accepted => {
                if let Some(mut retained) = self.retained.get_mut(&signal.room_id) {
                    retained.advance(SignalStatus::Accepted);
                }
            }
        }
    }

    /// The other side closed the call: tear down the native call without
    /// writing the signal back.
    async fn end_remotely(&self, room_id: SessionId, reason: EndReason) {
        self.force_end(&room_id);
        let Some(uuid) = self.bridge.uuid_for_session_id(&room_id) else {
            return;
        };
        self.bridge.end_call(&uuid).await;
        self.bridge.clear_call_mapping(&uuid);
        self.dispatcher.publish(CoordinatorEvent::CallEnded {
            session_id: Some(room_id),
            uuid,
            reason,
        });
    }

    fn force_end(&self, session_id: &SessionId) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if session.force_end() {
                self.trace
                    .trace(TAG, "session_forced_end", json!({ "session_id": session_id.as_str() }));
            }
        }
    }

    /// Persist the end of a call to the signal store, off the caller's path.
    ///
    /// An answered call is closed as ended even when the store still shows
    /// it ringing; its accept write lands first.
    fn close_signal(self: &Arc<Self>, room_id: SessionId, retained: Option<CallSignal>) {
        let accepting = self.answered.remove(&room_id).map(|(_, pending)| pending);
        let answered = accepting.is_some();
        let signals = Arc::clone(&self.signals);
        self.trace.spawn_detached(TAG, "close_signal", async move {
            if let Some(pending) = accepting {
                if let Err(e) = pending.await {
                    debug!("Accept write for {} did not finish: {}", room_id, e);
                }
            }
            let signal = match retained {
                Some(signal) => Some(signal),
                None => signals.latest_signal(&room_id).await?,
            };
            let Some(mut signal) = signal else {
                return Ok(());
            };
            match signal.status {
                SignalStatus::Ringing | SignalStatus::Accepted if answered => {
                    signal.advance(SignalStatus::Ended);
                    signals.update_signal_status(&signal.id, SignalStatus::Ended).await?;
                    signals.end_call_signals(&room_id).await
                }
                SignalStatus::Ringing => {
                    signal.advance(SignalStatus::Declined);
                    signals.update_signal_status(&signal.id, SignalStatus::Declined).await
                }
                SignalStatus::Accepted => {
                    signal.advance(SignalStatus::Ended);
                    signals.update_signal_status(&signal.id, SignalStatus::Ended).await?;
                    signals.end_call_signals(&room_id).await
                }
                SignalStatus::Declined | SignalStatus::Ended => Ok::<(), CoordinatorError>(()),
            }
        });
    }

    /// Shared by local hang-up and terminal phases
    async fn release_call(self: &Arc<Self>, session_id: &SessionId) {
        let retained = self.retained.remove(session_id).map(|(_, signal)| signal);
        let role = self.sessions.get(session_id).map(|s| s.role);
        if role == Some(CallRole::Caller) {
            let signals = Arc::clone(&self.signals);
            let room_id = session_id.clone();
            self.trace.spawn_detached(TAG, "end_call_signals", async move {
                signals.end_call_signals(&room_id).await
            });
        } else {
            self.close_signal(session_id.clone(), retained);
        }

        if let Some(uuid) = self.bridge.uuid_for_session_id(session_id) {
            self.bridge.end_call(&uuid).await;
            self.bridge.clear_call_mapping(&uuid);
            self.dispatcher.publish(CoordinatorEvent::CallEnded {
                session_id: Some(session_id.clone()),
                uuid,
                reason: EndReason::HungUp,
            });
        }
    }
}

/// Native callbacks routed into the coordinator
struct NativeHandler {
    inner: Arc<CoordinatorInner>,
}

#[async_trait]
impl NativeCallHandler for NativeHandler {
    async fn on_answer(&self, uuid: CallUuid) {
        let inner = &self.inner;
        let Some(session_id) = inner.bridge.session_id_for_uuid(&uuid) else {
            inner
                .trace
                .error(TAG, "answer_unmapped", json!({ "call_uuid": uuid.as_str() }));
            return;
        };
        let (session, call) = (session_id.to_string(), uuid.to_string());
        inner.trace.update_context(|context| {
            context.session_id = Some(session);
            context.call_uuid = Some(call);
        });

        let accepted = inner.retained.get_mut(&session_id).map(|mut signal| {
            let advanced = signal.advance(SignalStatus::Accepted);
            (signal.value().clone(), advanced)
        });
        let signals = Arc::clone(&inner.signals);
        let room_id = session_id.clone();
        let pending = accepted.clone();
        let accepting = inner.trace.spawn_detached(TAG, "mark_accepted", async move {
            match pending {
                Some((signal, true)) => signals.update_signal_status(&signal.id, SignalStatus::Accepted).await,
                Some((_, false)) => Ok(()),
                None => match signals.latest_signal(&room_id).await? {
                    Some(signal) if signal.status == SignalStatus::Ringing => {
                        signals.update_signal_status(&signal.id, SignalStatus::Accepted).await
                    }
                    _ => Ok(()),
                },
            }
        });
        inner.answered.insert(session_id.clone(), accepting);

        inner.bridge.set_call_active(&uuid).await;

        let signal = accepted.map(|(signal, _)| signal);
        let call_type = signal.as_ref().map(|s| s.call_type).unwrap_or(CallType::Audio);
        inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| CallSession::new(session_id.clone(), CallRole::Callee, call_type));

        inner.dispatcher.publish(CoordinatorEvent::Answered {
            session_id: session_id.clone(),
            uuid: uuid.clone(),
        });

        let route = CallRoute {
            session_id,
            role: CallRole::Callee,
            call_type,
            peer_id: signal.as_ref().map(|s| s.caller_id.clone()).unwrap_or_default(),
            peer_display_name: signal.map(|s| s.caller_display_name),
            source: CallSource::Native,
        };
        if let Err(e) = inner.dispatcher.open_call_screen(route).await {
            warn!("Answered call {} but the call screen did not open: {}", uuid, e);
        }
    }

    async fn on_end(&self, uuid: CallUuid) {
        let inner = &self.inner;
        let session_id = inner.bridge.session_id_for_uuid(&uuid);
        let retained = session_id
            .as_ref()
            .and_then(|room_id| inner.retained.remove(room_id))
            .map(|(_, signal)| signal);
        let answered = session_id
            .as_ref()
            .map(|room_id| inner.answered.contains_key(room_id))
            .unwrap_or(false);
        let reason = if answered {
            EndReason::HungUp
        } else {
            EndReason::from_signal_status(retained.as_ref().map(|s| s.status))
        };

        if let Some(room_id) = &session_id {
            inner.close_signal(room_id.clone(), retained);
            inner.force_end(room_id);
        }
        inner.bridge.clear_call_mapping(&uuid);
        inner.trace.trace(
            TAG,
            "native_end",
            json!({ "call_uuid": uuid.as_str(), "reason": reason }),
        );
        inner.dispatcher.publish(CoordinatorEvent::CallEnded {
            session_id,
            uuid,
            reason,
        });
    }

    async fn on_did_display_incoming(&self, uuid: CallUuid, error: Option<String>) {
        let inner = &self.inner;
        let Some(error) = error else {
            inner
                .trace
                .trace(TAG, "display_confirmed", json!({ "call_uuid": uuid.as_str() }));
            return;
        };
        inner.trace.warn(
            TAG,
            "display_failed",
            json!({ "call_uuid": uuid.as_str(), "error": error }),
        );
        let session_id = inner.bridge.session_id_for_uuid(&uuid);
        if let Some(room_id) = &session_id {
            inner.retained.remove(room_id);
        }
        inner.bridge.clear_call_mapping(&uuid);
        inner.dispatcher.publish(CoordinatorEvent::CallEnded {
            session_id,
            uuid,
            reason: EndReason::DisplayFailed,
        });
    }

    async fn on_toggle_mute(&self, uuid: CallUuid, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        self.inner.media.set_muted(muted).await;
        self.inner.dispatcher.publish(CoordinatorEvent::MuteChanged { uuid, muted });
    }

    async fn on_audio_session_activated(&self) {
        self.inner.media.audio_session_activated().await;
        self.inner.dispatcher.publish(CoordinatorEvent::AudioSessionActivated);
    }
}
