//! Call-session data model
//!
//! Roles, phases, realtime call signals, identifiers and the local
//! call-state machine ([`CallSession`]) the coordinator drives.
//!
//! ```rust
//! use callsync_call_coordinator::call::{CallPhase, CallRole, CallSession, CallType, SessionId};
//!
//! let mut session = CallSession::new(SessionId::from("room-1"), CallRole::Caller, CallType::Audio);
//! session.transition(CallPhase::JoiningSession).unwrap();
//! session.transition(CallPhase::OutgoingRinging).unwrap();
//! session.transition(CallPhase::Connected).unwrap();
//! assert!(session.transition(CallPhase::OutgoingRinging).is_err());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Namespace for name-based call UUIDs derived from session ids
const CALL_UUID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d4e_9a7b_4c13_8e55_0b3f_a1d2_c9e7);

/// App-level session identifier (the room id)
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Device-local call identifier required by the native telephony API
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallUuid(pub String);

impl CallUuid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for a call with no session yet
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Stable identifier for a session id.
    ///
    /// Every channel that learns about the same session computes the same
    /// value, so racing presenters collide on one de-dup key.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self(Uuid::new_v5(&CALL_UUID_NAMESPACE, session_id.as_str().as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallUuid {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Who initiated the call. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// Phase of a call session. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    CreatingSession,
    JoiningSession,
    ConnectingPeer,
    StartingMedia,
    OutgoingRinging,
    Connected,
    CallEnded,
    Error,
    PermsDenied,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::CallEnded | CallPhase::Error | CallPhase::PermsDenied)
    }

    /// Pre-ringing setup phases, which may retry among themselves
    pub fn is_dialing(&self) -> bool {
        matches!(
            self,
            CallPhase::CreatingSession
                | CallPhase::JoiningSession
                | CallPhase::ConnectingPeer
                | CallPhase::StartingMedia
        )
    }

    pub fn is_pre_connect(&self) -> bool {
        self.is_dialing() || matches!(self, CallPhase::OutgoingRinging)
    }

    /// Whether `self -> next` is a legal move for any role
    pub fn can_transition_to(&self, next: CallPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        match self {
            p if p.is_dialing() => {
                next.is_dialing() || matches!(next, CallPhase::OutgoingRinging | CallPhase::Connected)
            }
            CallPhase::OutgoingRinging => next == CallPhase::Connected || next.is_dialing(),
            _ => false,
        }
    }
}

/// Status of a realtime call signal
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
}

impl SignalStatus {
    pub fn can_transition_to(&self, next: SignalStatus) -> bool {
        match (self, next) {
            (SignalStatus::Ringing, SignalStatus::Accepted)
            | (SignalStatus::Ringing, SignalStatus::Declined)
            | (SignalStatus::Ringing, SignalStatus::Ended)
            | (SignalStatus::Accepted, SignalStatus::Ended) => true,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SignalStatus::Declined | SignalStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Ringing => "ringing",
            SignalStatus::Accepted => "accepted",
            SignalStatus::Declined => "declined",
            SignalStatus::Ended => "ended",
        }
    }
}

/// A realtime-delivered record announcing one ringing attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub id: String,
    pub room_id: SessionId,
    pub caller_id: String,
    pub caller_display_name: String,
    pub call_type: CallType,
    pub status: SignalStatus,
}

impl CallSignal {
    /// Move the signal to `next`, refusing moves the status machine forbids
    pub fn advance(&mut self, next: SignalStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Local call-state machine for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub phase: CallPhase,
    pub call_type: CallType,
    pub remote_joined: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(session_id: SessionId, role: CallRole, call_type: CallType) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            role,
            phase: CallPhase::CreatingSession,
            call_type,
            remote_joined: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Apply a phase transition.
    ///
    /// Re-entering the current phase is accepted as a no-op. Ringing as a
    /// callee is an invariant violation rather than a plain bad transition.
    pub fn transition(&mut self, next: CallPhase) -> CoordinatorResult<()> {
        if next == self.phase {
            return Ok(());
        }
        if next == CallPhase::OutgoingRinging && self.role == CallRole::Callee {
            return Err(CoordinatorError::invariant(format!(
                "session {} is callee and cannot enter outgoing_ringing",
                self.session_id
            )));
        }
        if !self.phase.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition { from: self.phase, to: next });
        }
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Force the session into `call_ended` unless it is already terminal.
    ///
    /// Returns whether the phase changed.
    pub fn force_end(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = CallPhase::CallEnded;
        self.updated_at = Utc::now();
        true
    }

    /// Upgrade an audio call to video. Not a phase transition.
    pub fn escalate_to_video(&mut self) -> CoordinatorResult<()> {
        if self.is_terminal() {
            return Err(CoordinatorError::InvalidTransition { from: self.phase, to: self.phase });
        }
        self.call_type = CallType::Video;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_remote_joined(&mut self, joined: bool) {
        self.remote_joined = joined;
        self.updated_at = Utc::now();
    }
}
