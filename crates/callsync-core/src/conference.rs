//! Conference model
//!
//! A conference groups one or more calls. A lone call lives in a single-call
//! conference whose identifier is the call identifier; the daemon assigns its
//! own identifiers to real multi-party conferences. Membership is an ordered
//! set: no duplicates, insertion order kept for display.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::call::{CallId, CallState};

/// Conference identifier: a call id for single-call conferences, otherwise daemon-assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConferenceId(String);

impl ConferenceId {
    /// Wrap a conference identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Whether this id names the single-call conference of `call_id`
    pub fn is_call(&self, call_id: &CallId) -> bool {
        self.0 == call_id.as_str()
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConferenceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConferenceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&CallId> for ConferenceId {
    fn from(call_id: &CallId) -> Self {
        Self::new(call_id.as_str())
    }
}

/// Conference state as reported by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConferenceState {
    /// Active, local user attached
    ActiveAttached,
    /// Active, local user detached
    ActiveDetached,
    /// Active, attached and recording
    ActiveAttachedRec,
    /// Active, detached and recording
    ActiveDetachedRec,
    /// On hold
    Hold,
    /// On hold and recording
    HoldRec,
}

impl ConferenceState {
    /// Decode a daemon state string such as `"ACTIVE_ATTACHED"`
    pub fn from_daemon(state: &str) -> Option<Self> {
        match state.trim().to_ascii_uppercase().as_str() {
            "ACTIVE_ATTACHED" => Some(Self::ActiveAttached),
            "ACTIVE_DETACHED" => Some(Self::ActiveDetached),
            "ACTIVE_ATTACHED_REC" => Some(Self::ActiveAttachedRec),
            "ACTIVE_DETACHED_REC" => Some(Self::ActiveDetachedRec),
            "HOLD" => Some(Self::Hold),
            "HOLD_REC" => Some(Self::HoldRec),
            _ => None,
        }
    }

    /// The daemon's spelling of this state
    pub fn as_daemon_str(&self) -> &'static str {
        match self {
            Self::ActiveAttached => "ACTIVE_ATTACHED",
            Self::ActiveDetached => "ACTIVE_DETACHED",
            Self::ActiveAttachedRec => "ACTIVE_ATTACHED_REC",
            Self::ActiveDetachedRec => "ACTIVE_DETACHED_REC",
            Self::Hold => "HOLD",
            Self::HoldRec => "HOLD_REC",
        }
    }

    /// Whether the daemon is recording the conference
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            Self::ActiveAttachedRec | Self::ActiveDetachedRec | Self::HoldRec
        )
    }

    /// Whether the conference is on hold
    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Hold | Self::HoldRec)
    }
}

impl fmt::Display for ConferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_daemon_str())
    }
}

/// Lifecycle state of a conference, derived from its members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateState {
    /// No member is connected yet
    Ringing,
    /// At least one member is connected
    Current,
    /// Every member is on hold
    Hold,
}

impl AggregateState {
    /// Fold member states into a conference state
    ///
    /// Any connected member makes the conference current; it is on hold only
    /// when every member is. An empty iterator yields `Ringing`.
    pub fn from_members<I>(states: I) -> Self
    where
        I: IntoIterator<Item = CallState>,
    {
        let mut any = false;
        let mut all_hold = true;
        for state in states {
            any = true;
            match state.fold() {
                CallState::Current => return Self::Current,
                CallState::Hold => {}
                _ => all_hold = false,
            }
        }
        if any && all_hold {
            Self::Hold
        } else {
            Self::Ringing
        }
    }
}

/// Text message received during a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    /// Call the message arrived on
    pub call_id: CallId,
    /// Sender URI
    pub from: String,
    /// Message body
    pub body: String,
    /// Receipt time
    pub received_at: DateTime<Utc>,
}

/// A group of calls presented and controlled as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conference {
    /// Conference identifier
    pub id: ConferenceId,
    members: IndexSet<CallId>,
    /// Last state reported by the daemon (multi-party conferences only)
    pub state: Option<ConferenceState>,
    /// State derived from members
    pub aggregate: AggregateState,
    /// Messages received on member calls
    pub messages: Vec<TextMessage>,
    /// Recording file reported by the daemon
    pub record_path: Option<String>,
    /// When the conference entered the registry
    pub created_at: DateTime<Utc>,
}

impl Conference {
    /// An empty conference; callers add members before publishing it
    pub fn new(id: ConferenceId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            members: IndexSet::new(),
            state: None,
            aggregate: AggregateState::Ringing,
            messages: Vec::new(),
            record_path: None,
            created_at: now,
        }
    }

    /// The single-call conference shell of `call_id`
    pub fn single(call_id: &CallId, now: DateTime<Utc>) -> Self {
        let mut conference = Self::new(ConferenceId::from(call_id), now);
        conference.members.insert(call_id.clone());
        conference
    }

    /// Whether this is the shell of its only member
    pub fn is_single_call(&self) -> bool {
        self.members.len() == 1
            && self
                .members
                .first()
                .map(|call_id| self.id.is_call(call_id))
                .unwrap_or(false)
    }

    /// Member call ids in display order
    pub fn members(&self) -> impl Iterator<Item = &CallId> {
        self.members.iter()
    }

    /// Member call ids as an owned list
    pub fn member_ids(&self) -> Vec<CallId> {
        self.members.iter().cloned().collect()
    }

    /// Whether `call_id` is a member
    pub fn contains(&self, call_id: &CallId) -> bool {
        self.members.contains(call_id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the conference has no members left
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether more than one call is in the conference
    pub fn has_multiple_participants(&self) -> bool {
        self.members.len() > 1
    }

    /// Whether the daemon reports the conference as recording
    pub fn is_recording(&self) -> bool {
        self.state.map(|s| s.is_recording()).unwrap_or(false)
    }

    pub(crate) fn insert_member(&mut self, call_id: CallId) -> bool {
        self.members.insert(call_id)
    }

    pub(crate) fn remove_member(&mut self, call_id: &CallId) -> bool {
        self.members.shift_remove(call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conference_states() {
        assert_eq!(
            ConferenceState::from_daemon("ACTIVE_ATTACHED_REC"),
            Some(ConferenceState::ActiveAttachedRec)
        );
        assert!(ConferenceState::HoldRec.is_recording());
        assert!(ConferenceState::HoldRec.is_hold());
        assert!(!ConferenceState::ActiveDetached.is_recording());
        assert_eq!(ConferenceState::from_daemon("NULL"), None);
    }

    #[test]
    fn test_aggregate_state() {
        use CallState::{Current, Hold, Ringing, Unhold};
        assert_eq!(AggregateState::from_members([Ringing, Current]), AggregateState::Current);
        assert_eq!(AggregateState::from_members([Hold, Hold]), AggregateState::Hold);
        assert_eq!(AggregateState::from_members([Hold, Ringing]), AggregateState::Ringing);
        assert_eq!(AggregateState::from_members([Unhold]), AggregateState::Current);
        assert_eq!(AggregateState::from_members(Vec::new()), AggregateState::Ringing);
    }

    #[test]
    fn test_single_call_shell() {
        let call_id = CallId::from("c1");
        let mut conference = Conference::single(&call_id, Utc::now());
        assert!(conference.is_single_call());
        assert_eq!(conference.id, ConferenceId::from("c1"));

        assert!(conference.insert_member(CallId::from("c2")));
        assert!(!conference.insert_member(CallId::from("c2")));
        assert!(!conference.is_single_call());
        assert!(conference.has_multiple_participants());

        assert!(conference.remove_member(&call_id));
        assert_eq!(conference.member_ids(), vec![CallId::from("c2")]);
        assert!(!conference.is_single_call());
    }
}
