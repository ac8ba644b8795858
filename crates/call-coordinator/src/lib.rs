//! Call coordinator: call-session coordination for mobile clients
//!
//! A device learns about the same call from up to three independent
//! sources: the OS call UI (CallKit / ConnectionService style), a realtime
//! signaling channel, and background push notifications. This crate
//! reconciles them into one consistent, de-duplicated session lifecycle.
//!
//! ## Layers
//! ```text
//! SignalCoordinator / NotificationListener
//!           │
//!     CallDispatcher  (shared present / navigate path)
//!           │
//!      CallUiBridge   (the only caller of NativeTelephony)
//!           │
//!   KeyValueStore + TraceBuffer
//! ```
//!
//! The coordinator focuses on:
//! - At-most-once native presentation of every incoming call
//! - The durable call UUID ↔ session id mapping
//! - Deterministic UI mode derivation from the local call-state machine
//! - A persisted diagnostic trail that survives process death
//!
//! Media, signaling transport and push registration are provided by the
//! host app through the traits in [`bridge`], [`coordinator`],
//! [`dispatch`], [`notifications`] and [`storage`].

pub mod bridge;
pub mod call;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod mode;
pub mod notifications;
pub mod storage;
pub mod trace;

// Public API exports
pub use bridge::{
    CallDisplayRequest, CallUiBridge, DisplayOutcome, ListenerRegistration, NativeCallHandler,
    NativeTelephony, PermissionStatus, SetupState, TelephonyOptions,
};
pub use call::{CallPhase, CallRole, CallSession, CallSignal, CallType, CallUuid, SessionId, SignalStatus};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorState, MediaHooks, SignalChannel, SignalCoordinator};
pub use dedup::DedupSet;
pub use dispatch::{CallDispatcher, CallNavigator, CallRoute, IncomingCall, PresentOutcome};
pub use error::{CoordinatorError, CoordinatorResult, NativeError};
pub use events::{CallSource, CoordinatorEvent, EndReason, NativeEvent, RawNativeEvent};
pub use logging::{setup_logging, LoggingConfig};
pub use mode::{derive_mode, UiMode};
pub use notifications::{CallNotification, ColdStartOutcome, NotificationListener, PushDelivery, PushEvent};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
pub use trace::{install_crash_hook, TraceBuffer, TraceContext, TraceEntry, TraceLevel};

/// Call coordinator version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
