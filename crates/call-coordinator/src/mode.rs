//! UI mode derivation
//!
//! [`derive_mode`] is the single place call UI state is computed. Rendering
//! and control logic read through it (directly or via
//! [`CallSession::ui_mode`](crate::call::CallSession::ui_mode)) so two call
//! sites can never disagree about the current mode.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::call::{CallPhase, CallRole, CallSession, CallType};
use crate::trace::TraceBuffer;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiMode {
    CallerDialing,
    CallerRinging,
    ReceiverConnecting,
    InCallVideo,
    InCallAudio,
    Ended,
    Error,
    PermsDenied,
}

/// Resolved mode plus the invariant violation observed on the way, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeResolution {
    pub mode: UiMode,
    pub violation: Option<CallPhase>,
}

/// Resolve the mode without side effects.
///
/// First match wins: terminal phases, then `connected` (by call type only),
/// then the role-specific pre-connect phases.
pub fn resolve_mode(role: CallRole, phase: CallPhase, call_type: CallType, _remote_joined: bool) -> ModeResolution {
    let mode = match phase {
        CallPhase::PermsDenied => UiMode::PermsDenied,
        CallPhase::Error => UiMode::Error,
        CallPhase::CallEnded => UiMode::Ended,
        CallPhase::Connected => match call_type {
            CallType::Video => UiMode::InCallVideo,
            CallType::Audio => UiMode::InCallAudio,
        },
        CallPhase::OutgoingRinging if role == CallRole::Caller => UiMode::CallerRinging,
        _ if role == CallRole::Caller => UiMode::CallerDialing,
        CallPhase::OutgoingRinging => {
            return ModeResolution {
                mode: UiMode::ReceiverConnecting,
                violation: Some(phase),
            }
        }
        _ => UiMode::ReceiverConnecting,
    };
    ModeResolution { mode, violation: None }
}

/// Map model state to exactly one UI mode.
///
/// A callee observed in `outgoing_ringing` is logged and resolved to
/// `ReceiverConnecting`; it never panics.
pub fn derive_mode(role: CallRole, phase: CallPhase, call_type: CallType, remote_joined: bool) -> UiMode {
    let resolution = resolve_mode(role, phase, call_type, remote_joined);
    if let Some(phase) = resolution.violation {
        error!("Invariant violation: callee observed in {:?}, rendering as receiver", phase);
    }
    resolution.mode
}

/// [`derive_mode`], additionally recording a violation in the trace buffer
pub fn derive_mode_traced(
    trace: &TraceBuffer,
    role: CallRole,
    phase: CallPhase,
    call_type: CallType,
    remote_joined: bool,
) -> UiMode {
    let resolution = resolve_mode(role, phase, call_type, remote_joined);
    if let Some(phase) = resolution.violation {
        trace.error(
            "mode",
            "invariant_violation",
            json!({ "role": role, "phase": phase, "call_type": call_type }),
        );
    }
    resolution.mode
}

impl CallSession {
    pub fn ui_mode(&self, trace: &TraceBuffer) -> UiMode {
        derive_mode_traced(trace, self.role, self.phase, self.call_type, self.remote_joined)
    }
}
