//! Call model and the per-call state machine
//!
//! A [`Call`] is created by an incoming-call or outgoing-call daemon event and
//! then driven through [`CallState`] transitions by `callStateChanged`
//! signals. The rules enforced by [`Call::apply_state`]:
//!
//! - entering [`CallState::Current`] stamps the start time, only the first time
//! - `Hold`/`Unhold` toggle without touching timestamps (`Unhold` folds into `Current`)
//! - `Busy`, `Failure` and `HungUp` are terminal: the end time is stamped once and
//!   every later transition is rejected with [`SyncError::TerminalCall`]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Daemon-assigned call identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap a daemon call identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (the daemon never assigns empty ids)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Direction of a call relative to the local account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    /// Call received from a remote peer
    Incoming,
    /// Call placed by the local user
    Outgoing,
}

/// Lifecycle state of a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Outgoing call placed but not yet confirmed by the daemon
    None,
    /// Call is alerting
    Ringing,
    /// Call is connected
    Current,
    /// Call is on hold
    Hold,
    /// Leaving hold; folded into `Current` when applied
    Unhold,
    /// Remote side was busy (terminal)
    Busy,
    /// Call failed (terminal)
    Failure,
    /// Call was hung up (terminal)
    HungUp,
}

impl CallState {
    /// Decode a daemon state string such as `"CURRENT"` or `"HUNGUP"`
    pub fn from_daemon(state: &str) -> Option<Self> {
        match state.trim().to_ascii_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "RINGING" => Some(Self::Ringing),
            "CURRENT" => Some(Self::Current),
            "HOLD" => Some(Self::Hold),
            "UNHOLD" => Some(Self::Unhold),
            "BUSY" => Some(Self::Busy),
            "FAILURE" => Some(Self::Failure),
            "HUNGUP" => Some(Self::HungUp),
            _ => None,
        }
    }

    /// The daemon's spelling of this state
    pub fn as_daemon_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Ringing => "RINGING",
            Self::Current => "CURRENT",
            Self::Hold => "HOLD",
            Self::Unhold => "UNHOLD",
            Self::Busy => "BUSY",
            Self::Failure => "FAILURE",
            Self::HungUp => "HUNGUP",
        }
    }

    /// Collapse transient states into the state they settle in
    pub fn fold(self) -> Self {
        match self {
            Self::Unhold => Self::Current,
            other => other,
        }
    }

    /// Whether no further transition is accepted from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Busy | Self::Failure | Self::HungUp)
    }

    /// Whether the call has not been answered yet
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::None | Self::Ringing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_daemon_str())
    }
}

/// How a finished call is filed in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// The call reached `Current` at least once
    Answered,
    /// Incoming call that was never answered
    Missed,
    /// Outgoing call that was never answered
    Unanswered,
}

impl CallOutcome {
    /// Whether the call was ever connected
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered)
    }
}

/// A call known to the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Daemon-assigned identifier
    pub id: CallId,
    /// Account the call belongs to
    pub account_id: String,
    /// Incoming or outgoing
    pub direction: CallDirection,
    /// Remote peer URI
    pub peer: String,
    /// Current lifecycle state (never `Unhold`)
    pub state: CallState,
    /// When the call entered the registry
    pub created_at: DateTime<Utc>,
    /// First entry into `Current`
    pub started_at: Option<DateTime<Utc>>,
    /// Entry into a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Last detail code reported alongside a state change
    pub detail_code: Option<i32>,
    /// Recording file reported by the daemon
    pub record_path: Option<String>,
}

impl Call {
    /// A ringing incoming call
    pub fn incoming(
        account_id: impl Into<String>,
        id: CallId,
        peer: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(account_id, id, peer, CallDirection::Incoming, CallState::Ringing, now)
    }

    /// An outgoing call the daemon has not confirmed yet
    pub fn outgoing(
        account_id: impl Into<String>,
        id: CallId,
        peer: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(account_id, id, peer, CallDirection::Outgoing, CallState::None, now)
    }

    fn new(
        account_id: impl Into<String>,
        id: CallId,
        peer: impl Into<String>,
        direction: CallDirection,
        state: CallState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            account_id: account_id.into(),
            direction,
            peer: peer.into(),
            state,
            created_at: now,
            started_at: None,
            ended_at: None,
            detail_code: None,
            record_path: None,
        }
    }

    /// Whether the call was ever connected
    pub fn was_answered(&self) -> bool {
        self.started_at.is_some()
    }

    /// Whether the call is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// History classification of the call as it stands now
    pub fn outcome(&self) -> CallOutcome {
        match (self.was_answered(), self.direction) {
            (true, _) => CallOutcome::Answered,
            (false, CallDirection::Incoming) => CallOutcome::Missed,
            (false, CallDirection::Outgoing) => CallOutcome::Unanswered,
        }
    }

    /// Connected duration, once both ends are stamped
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Apply a daemon state to this call
    ///
    /// Returns `Ok(None)` when the state does not change anything and
    /// `Err(SyncError::TerminalCall)` when the call already ended.
    pub fn apply_state(
        &mut self,
        state: CallState,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<Transition>> {
        if self.state.is_terminal() {
            return Err(SyncError::TerminalCall {
                call_id: self.id.clone(),
                state: self.state,
            });
        }

        let next = state.fold();
        if next == self.state {
            return Ok(None);
        }

        let previous = self.state;
        let mut started = false;
        if next == CallState::Current && self.started_at.is_none() {
            self.started_at = Some(now);
            started = true;
        }

        let ended = next.is_terminal();
        if ended && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }

        self.state = next;
        Ok(Some(Transition {
            call_id: self.id.clone(),
            previous,
            current: next,
            started,
            ended,
        }))
    }
}

/// Result of a state change applied to a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Call that moved
    pub call_id: CallId,
    /// State before the change
    pub previous: CallState,
    /// State after the change
    pub current: CallState,
    /// The start time was stamped by this transition
    pub started: bool,
    /// The call entered a terminal state
    pub ended: bool,
}
