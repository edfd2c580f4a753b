//! Error types for the call synchronizer
//!
//! Every error here is recoverable from the synchronizer's point of view: the
//! daemon is an external event source, so a bad event is logged and dropped
//! rather than surfaced to the application.

use thiserror::Error;

use crate::call::{CallId, CallState};
use crate::conference::ConferenceId;

/// Result type for synchronizer operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while applying daemon events
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Event references a call that is not in the registry
    #[error("Call not found: {call_id}")]
    UnknownCall { call_id: CallId },

    /// Event references a conference that is not in the registry
    #[error("Conference not found: {conference_id}")]
    UnknownConference { conference_id: ConferenceId },

    /// Event would move a call out of a terminal state
    #[error("Call {call_id} already ended in state {state}")]
    TerminalCall { call_id: CallId, state: CallState },

    /// Synchronous participant query against the daemon failed
    #[error("Daemon query failed for {conference_id}: {reason}")]
    DaemonQuery {
        conference_id: ConferenceId,
        reason: String,
    },

    /// Event could not be decoded (unknown signal, missing id, bad state string)
    #[error("Malformed daemon event: {message}")]
    MalformedEvent { message: String },

    /// A command sent to the daemon was rejected
    #[error("Daemon command failed for call {call_id}: {reason}")]
    DaemonCommand { call_id: CallId, reason: String },

    /// SAS confirmation requested while no SAS is awaiting confirmation
    #[error("No SAS awaiting confirmation on call {call_id}")]
    SasNotPending { call_id: CallId },

    /// Operation would put a call in two conferences at once
    #[error("Call {call_id} already belongs to conference {owner}")]
    MembershipConflict {
        call_id: CallId,
        owner: ConferenceId,
    },

    /// A history or notification sink rejected a delivery
    #[error("Sink delivery failed: {message}")]
    SinkDelivery { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl SyncError {
    /// Create an unknown-call error
    pub fn unknown_call(call_id: &CallId) -> Self {
        Self::UnknownCall {
            call_id: call_id.clone(),
        }
    }

    /// Create an unknown-conference error
    pub fn unknown_conference(conference_id: &ConferenceId) -> Self {
        Self::UnknownConference {
            conference_id: conference_id.clone(),
        }
    }

    /// Create a daemon query error
    pub fn daemon_query(conference_id: &ConferenceId, reason: impl Into<String>) -> Self {
        Self::DaemonQuery {
            conference_id: conference_id.clone(),
            reason: reason.into(),
        }
    }

    /// Create a daemon command error
    pub fn daemon_command(call_id: &CallId, reason: impl Into<String>) -> Self {
        Self::DaemonCommand {
            call_id: call_id.clone(),
            reason: reason.into(),
        }
    }

    /// Create a malformed event error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    /// Create a sink delivery error
    pub fn sink(message: impl Into<String>) -> Self {
        Self::SinkDelivery {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the dispatcher recovers from this error by dropping the event
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }

    /// Short label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownCall { .. } | Self::UnknownConference { .. } => "unknown-id",
            Self::TerminalCall { .. } => "invalid-transition",
            Self::DaemonQuery { .. } => "daemon-query-failure",
            Self::DaemonCommand { .. } => "daemon-command-failure",
            Self::SasNotPending { .. } => "sas-not-pending",
            Self::MalformedEvent { .. } => "malformed-event",
            Self::MembershipConflict { .. } => "membership-conflict",
            Self::SinkDelivery { .. } => "sink-delivery",
            Self::Config { .. } => "config",
        }
    }
}
