//! Native telephony events and coordinator events
//!
//! The OS layer hands over loosely-typed payloads ([`RawNativeEvent`]).
//! They are validated once, at the bridge boundary, into [`NativeEvent`];
//! nothing downstream sees an unchecked payload.
//!
//! ```rust
//! use callsync_call_coordinator::events::{NativeEvent, RawNativeEvent};
//! use serde_json::json;
//!
//! let raw = RawNativeEvent::new("answer_call", json!({ "call_uuid": "A1" }));
//! let event = NativeEvent::parse(&raw).unwrap();
//! assert!(matches!(event, NativeEvent::Answer { .. }));
//!
//! let broken = RawNativeEvent::new("set_muted", json!({ "call_uuid": "A1" }));
//! assert!(NativeEvent::parse(&broken).is_err());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::{CallUuid, SessionId, SignalStatus};
use crate::error::{CoordinatorError, CoordinatorResult};

/// Event exactly as delivered by the native layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNativeEvent {
    pub name: String,
    #[serde(default)]
    pub body: Value,
}

impl RawNativeEvent {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self { name: name.into(), body }
    }
}

/// Validated native callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// User answered from the OS call UI
    Answer { uuid: CallUuid },
    /// Call ended from the OS call UI (decline or hang-up)
    End { uuid: CallUuid },
    /// OS finished presenting an incoming call; `error` is set when it refused
    DidDisplayIncoming { uuid: CallUuid, error: Option<String> },
    ToggleMute { uuid: CallUuid, muted: bool },
    AudioSessionActivated,
}

impl NativeEvent {
    pub fn parse(raw: &RawNativeEvent) -> CoordinatorResult<Self> {
        match raw.name.as_str() {
            "answer_call" => Ok(NativeEvent::Answer { uuid: required_uuid(raw)? }),
            "end_call" => Ok(NativeEvent::End { uuid: required_uuid(raw)? }),
            "did_display_incoming_call" => Ok(NativeEvent::DidDisplayIncoming {
                uuid: required_uuid(raw)?,
                error: raw
                    .body
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string),
            }),
            "set_muted" => {
                let muted = raw
                    .body
                    .get("muted")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| CoordinatorError::malformed("set_muted without boolean `muted`"))?;
                Ok(NativeEvent::ToggleMute { uuid: required_uuid(raw)?, muted })
            }
            "audio_session_activated" => Ok(NativeEvent::AudioSessionActivated),
            other => Err(CoordinatorError::malformed(format!("unknown native event `{}`", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NativeEvent::Answer { .. } => "answer_call",
            NativeEvent::End { .. } => "end_call",
            NativeEvent::DidDisplayIncoming { .. } => "did_display_incoming_call",
            NativeEvent::ToggleMute { .. } => "set_muted",
            NativeEvent::AudioSessionActivated => "audio_session_activated",
        }
    }

    pub fn uuid(&self) -> Option<&CallUuid> {
        match self {
            NativeEvent::Answer { uuid }
            | NativeEvent::End { uuid }
            | NativeEvent::DidDisplayIncoming { uuid, .. }
            | NativeEvent::ToggleMute { uuid, .. } => Some(uuid),
            NativeEvent::AudioSessionActivated => None,
        }
    }
}

fn required_uuid(raw: &RawNativeEvent) -> CoordinatorResult<CallUuid> {
    raw.body
        .get("call_uuid")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uuid| !uuid.is_empty())
        .map(CallUuid::from)
        .ok_or_else(|| CoordinatorError::malformed(format!("`{}` without `call_uuid`", raw.name)))
}

/// Which channel delivered an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSource {
    Realtime,
    PushForeground,
    PushTap,
    ColdStart,
    Native,
    Local,
}

/// How a call ended from the callee's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Ended while still ringing
    Declined,
    /// Ended after being answered
    HungUp,
    /// Remote side cancelled before an answer
    RemoteCancelled,
    /// Remote side hung up after the call was answered
    RemoteEnded,
    /// The OS refused to present the call
    DisplayFailed,
    Unknown,
}

impl EndReason {
    pub fn from_signal_status(status: Option<SignalStatus>) -> Self {
        match status {
            Some(SignalStatus::Ringing) => EndReason::Declined,
            Some(SignalStatus::Accepted) => EndReason::HungUp,
            Some(SignalStatus::Declined) | Some(SignalStatus::Ended) => EndReason::RemoteCancelled,
            None => EndReason::Unknown,
        }
    }
}

/// Events published by the coordinator for UI layers
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    IncomingPresented {
        session_id: SessionId,
        uuid: CallUuid,
        source: CallSource,
    },
    DuplicateSuppressed {
        session_id: SessionId,
        uuid: CallUuid,
        source: CallSource,
    },
    Answered {
        session_id: SessionId,
        uuid: CallUuid,
    },
    CallScreenOpened {
        session_id: SessionId,
        source: CallSource,
    },
    CallEnded {
        session_id: Option<SessionId>,
        uuid: CallUuid,
        reason: EndReason,
    },
    MuteChanged {
        uuid: CallUuid,
        muted: bool,
    },
    AudioSessionActivated,
}
