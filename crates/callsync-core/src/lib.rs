//! # RVOIP Call Sync Core
//!
//! Keeps an in-process model of calls, conferences and their media security
//! in step with the asynchronous signals of a native telephony daemon.
//!
//! ```text
//! daemon ──► Synchronizer::handle ──► Registry (calls + conferences)
//!                   │                 SecureSessionTracker
//!                   ├──► HistorySink       (terminal calls)
//!                   └──► NotificationSink  (every applied event)
//! ```
//!
//! - Calls follow a small state machine: `Ringing → Current ↔ Hold`, and
//!   `Busy`/`Failure`/`HungUp` are terminal. The start time is stamped on the
//!   first entry into `Current` only.
//! - Every live call belongs to exactly one conference. A lone call lives in a
//!   single-call conference named after it; merges and splits reconcile
//!   membership against the daemon's participant list.
//! - Events the model cannot apply (unknown ids, late events for ended calls,
//!   malformed signals) are logged and dropped, never raised.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_callsync_core::*;
//!
//! struct Daemon;
//!
//! impl DaemonBridge for Daemon {
//!     fn participants(&self, _conference_id: &ConferenceId) -> SyncResult<Vec<CallId>> {
//!         Ok(vec![])
//!     }
//!     fn hang_up(&self, _call_id: &CallId) -> SyncResult<()> {
//!         Ok(())
//!     }
//!     fn set_sas_verified(&self, _call_id: &CallId) -> SyncResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> SyncResult<()> {
//! let config = SyncConfig::from_env()?;
//! let notifications = Arc::new(BroadcastNotificationSink::from_config(&config));
//! let mut ui = notifications.subscribe();
//!
//! let sync = Synchronizer::new(
//!     config,
//!     Arc::new(Daemon),
//!     Arc::new(NullHistorySink),
//!     notifications,
//! );
//!
//! sync.handle_signal("incomingCall", &["acc1", "c1", "sip:bob@example.com"]);
//! sync.handle_signal("callStateChanged", &["c1", "CURRENT", "0"]);
//!
//! while let Ok(event) = ui.recv().await {
//!     println!("{}", event.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod clock;
pub mod conference;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod registry;
pub mod secure;
pub mod synchronizer;

// Re-export main types
pub use call::{Call, CallDirection, CallId, CallOutcome, CallState, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conference::{AggregateState, Conference, ConferenceId, ConferenceState, TextMessage};
pub use config::SyncConfig;
pub use daemon::{DaemonBridge, DaemonEvent};
pub use dispatch::SinkDispatcher;
pub use error::{SyncError, SyncResult};
pub use events::{
    AppEvent, AppEventStream, BroadcastNotificationSink, EventTarget, HistoryRecord, HistorySink,
    NotificationSink, NullHistorySink, SecureChange,
};
pub use logging::{parse_log_level, setup_logging, LoggingConfig, LOG_TARGET};
pub use registry::{
    CallRegistry, ConferenceRegistry, MembershipDiff, Reconciliation, Registry,
};
pub use secure::{SecureMechanism, SecureSession, SecureSessionTracker};
pub use synchronizer::{Handled, StateSnapshot, SyncStats, Synchronizer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
