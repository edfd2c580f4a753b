//! Derived application events and the sinks that consume them
//!
//! Every processed daemon event produces at most one [`AppEvent`], published
//! to the [`NotificationSink`]. Every terminal call transition additionally
//! produces one [`HistoryRecord`] for the [`HistorySink`]. Both sinks are
//! driven from a background task (see [`crate::dispatch`]) so a slow consumer
//! never stalls event processing.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use rvoip_callsync_core::{AppEvent, NotificationSink, SyncResult};
//!
//! struct PrintingSink;
//!
//! #[async_trait]
//! impl NotificationSink for PrintingSink {
//!     async fn publish(&self, event: AppEvent) -> SyncResult<()> {
//!         println!("{} -> {:?}", event.kind(), event.target());
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{Call, CallId, CallOutcome, CallState};
use crate::conference::{Conference, ConferenceId, ConferenceState, TextMessage};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::secure::SecureSession;

/// What an application event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTarget {
    /// A single call
    Call(CallId),
    /// A conference (single-call shells included)
    Conference(ConferenceId),
}

/// Which secure-session signal changed the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureChange {
    SdesOn,
    SdesOff,
    ZrtpOn,
    ZrtpOff,
    ShowSas,
    ZrtpNotSupported,
    ZrtpNegotiationFailed,
    SasConfirmed,
}

/// Event derived from a daemon event after the registries were updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppEvent {
    /// A new incoming call is ringing
    IncomingCall {
        /// The new call
        call: Call,
        /// Its single-call conference
        conference_id: ConferenceId,
    },

    /// The local user placed a call
    OutgoingCall {
        /// The new call
        call: Call,
        /// Its single-call conference
        conference_id: ConferenceId,
    },

    /// A call changed state
    CallStateChanged {
        /// Call after the change (terminal calls are already out of the registry)
        call: Call,
        /// State before the change
        previous: CallState,
        /// State after the change
        current: CallState,
        /// Daemon detail code
        detail_code: i32,
        /// Conference the call belonged to
        conference_id: Option<ConferenceId>,
    },

    /// A multi-party conference was created by merging calls
    ConferenceCreated {
        /// The new conference
        conference: Conference,
        /// Conferences deleted because all their calls moved in
        dissolved: Vec<ConferenceId>,
    },

    /// The daemon reported a conference state and membership update
    ConferenceChanged {
        /// Conference id
        conference_id: ConferenceId,
        /// Conference after the update, `None` if it emptied
        conference: Option<Conference>,
        /// Parsed daemon state, if recognized
        state: Option<ConferenceState>,
        /// Calls that joined
        added: Vec<CallId>,
        /// Calls split off into their own conference
        detached: Vec<CallId>,
    },

    /// A conference was broken up
    ConferenceRemoved {
        /// Conference id
        conference_id: ConferenceId,
        /// Calls that became single-call conferences
        released: Vec<CallId>,
    },

    /// A text message arrived on a call
    IncomingMessage {
        /// Conference that owns the call
        conference_id: ConferenceId,
        /// The message
        message: TextMessage,
    },

    /// A call's secure session changed
    SecureSessionChanged {
        /// Call id
        call_id: CallId,
        /// What changed
        change: SecureChange,
        /// Session after the change
        session: SecureSession,
    },

    /// The daemon started writing a recording
    RecordingPathChanged {
        /// Call or conference being recorded
        target: EventTarget,
        /// Recording file path
        path: String,
    },

    /// Result of a call transfer
    TransferStateChanged {
        /// Daemon-reported result
        result: String,
    },

    /// RTCP statistics for a call
    RtcpReport {
        /// Call id
        call_id: CallId,
        /// Raw counters from the daemon
        stats: BTreeMap<String, i64>,
    },
}

impl AppEvent {
    /// Short event name used in logs and filters
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming-call",
            Self::OutgoingCall { .. } => "outgoing-call",
            Self::CallStateChanged { .. } => "call-state-changed",
            Self::ConferenceCreated { .. } => "conference-created",
            Self::ConferenceChanged { .. } => "conference-changed",
            Self::ConferenceRemoved { .. } => "conference-removed",
            Self::IncomingMessage { .. } => "incoming-message",
            Self::SecureSessionChanged { .. } => "secure-session-changed",
            Self::RecordingPathChanged { .. } => "recording-path-changed",
            Self::TransferStateChanged { .. } => "transfer-state-changed",
            Self::RtcpReport { .. } => "rtcp-report",
        }
    }

    /// The call or conference the event is about
    pub fn target(&self) -> Option<EventTarget> {
        match self {
            Self::IncomingCall { call, .. }
            | Self::OutgoingCall { call, .. }
            | Self::CallStateChanged { call, .. } => Some(EventTarget::Call(call.id.clone())),
            Self::ConferenceCreated { conference, .. } => {
                Some(EventTarget::Conference(conference.id.clone()))
            }
            Self::ConferenceChanged { conference_id, .. }
            | Self::ConferenceRemoved { conference_id, .. }
            | Self::IncomingMessage { conference_id, .. } => {
                Some(EventTarget::Conference(conference_id.clone()))
            }
            Self::SecureSessionChanged { call_id, .. } | Self::RtcpReport { call_id, .. } => {
                Some(EventTarget::Call(call_id.clone()))
            }
            Self::RecordingPathChanged { target, .. } => Some(target.clone()),
            Self::TransferStateChanged { .. } => None,
        }
    }

    /// Whether the event is about `call_id`
    pub fn concerns_call(&self, call_id: &CallId) -> bool {
        self.target() == Some(EventTarget::Call(call_id.clone()))
    }
}

/// History entry written once per terminated call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Call as it was when it ended
    pub call: Call,
    /// Conference the call belonged to
    pub conference_id: Option<ConferenceId>,
    /// Other calls still in that conference
    pub remaining_participants: Vec<CallId>,
    /// Terminal state
    pub terminal_state: CallState,
    /// Answered / missed / unanswered
    pub outcome: CallOutcome,
    /// First entry into `Current`
    pub started_at: Option<DateTime<Utc>>,
    /// Entry into the terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    /// Build the record for a call that just ended
    pub fn from_call(
        call: Call,
        conference_id: Option<ConferenceId>,
        remaining_participants: Vec<CallId>,
    ) -> Self {
        Self {
            terminal_state: call.state,
            outcome: call.outcome(),
            started_at: call.started_at,
            ended_at: call.ended_at,
            call,
            conference_id,
            remaining_participants,
        }
    }

    /// Whether the call was never answered
    pub fn is_missed(&self) -> bool {
        !self.outcome.is_answered()
    }
}

/// Consumer of terminal-call history records
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Persist one history record
    async fn record(&self, record: HistoryRecord) -> SyncResult<()>;
}

/// Consumer of application events (UI, presenters, notifications)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one application event
    async fn publish(&self, event: AppEvent) -> SyncResult<()>;
}

/// History sink that drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistorySink;

#[async_trait]
impl HistorySink for NullHistorySink {
    async fn record(&self, _record: HistoryRecord) -> SyncResult<()> {
        Ok(())
    }
}

/// Stream of application events from a [`BroadcastNotificationSink`]
pub type AppEventStream = BroadcastStream<AppEvent>;

/// Notification sink fanning events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotificationSink {
    sender: broadcast::Sender<AppEvent>,
    capacity: usize,
}

impl BroadcastNotificationSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Create a sink sized by [`SyncConfig::event_channel_capacity`]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.event_channel_capacity)
    }

    /// Events buffered per subscriber before slow ones start lagging
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe with a raw broadcast receiver
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream
    pub fn subscribe_stream(&self) -> AppEventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of active subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    async fn publish(&self, event: AppEvent) -> SyncResult<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn call(id: &str) -> Call {
        Call::incoming("acc", CallId::from(id), "sip:alice@example.com", Utc::now())
    }

    #[test]
    fn test_event_targets() {
        let event = AppEvent::IncomingCall {
            call: call("c1"),
            conference_id: ConferenceId::from("c1"),
        };
        assert_eq!(event.kind(), "incoming-call");
        assert!(event.concerns_call(&CallId::from("c1")));

        let event = AppEvent::ConferenceRemoved {
            conference_id: ConferenceId::from("conf1"),
            released: vec![],
        };
        assert_eq!(event.target(), Some(EventTarget::Conference(ConferenceId::from("conf1"))));

        let event = AppEvent::TransferStateChanged { result: "success".into() };
        assert_eq!(event.target(), None);
    }

    #[test]
    fn test_history_record_from_call() {
        let mut c = call("c1");
        c.apply_state(CallState::Failure, Utc::now()).unwrap();
        let record = HistoryRecord::from_call(c, Some(ConferenceId::from("c1")), vec![]);
        assert_eq!(record.terminal_state, CallState::Failure);
        assert_eq!(record.outcome, CallOutcome::Missed);
        assert!(record.is_missed());
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastNotificationSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe_stream();
        assert_eq!(sink.receiver_count(), 2);

        let event = AppEvent::TransferStateChanged { result: "failed".into() };
        sink.publish(event.clone()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.next().await.unwrap().unwrap(), event);
    }

    #[test]
    fn test_broadcast_sink_sized_from_config() {
        let config = SyncConfig::new().with_event_channel_capacity(16);
        assert_eq!(BroadcastNotificationSink::from_config(&config).capacity(), 16);
        assert_eq!(
            BroadcastNotificationSink::default().capacity(),
            SyncConfig::default().event_channel_capacity
        );
        assert_eq!(BroadcastNotificationSink::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastNotificationSink::default();
        let event = AppEvent::TransferStateChanged { result: "ok".into() };
        assert!(sink.publish(event).await.is_ok());
    }
}
