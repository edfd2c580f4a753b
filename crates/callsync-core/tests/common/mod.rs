//! Shared test doubles for call synchronizer integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_callsync_core::*;

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rvoip_callsync_core=debug")
        .with_test_writer()
        .try_init();
}

/// History sink that keeps every record
#[derive(Default)]
pub struct RecordingHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl RecordingHistory {
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl HistorySink for RecordingHistory {
    async fn record(&self, record: HistoryRecord) -> SyncResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Notification sink that keeps every event
#[derive(Default)]
pub struct RecordingNotifications {
    events: Mutex<Vec<AppEvent>>,
}

impl RecordingNotifications {
    pub fn events(&self) -> Vec<AppEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifications {
    async fn publish(&self, event: AppEvent) -> SyncResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Daemon double with scriptable participant lists and recorded commands
#[derive(Default)]
pub struct ScriptedDaemon {
    participants: Mutex<HashMap<ConferenceId, Vec<CallId>>>,
    failing: Mutex<bool>,
    hang_ups: Mutex<Vec<CallId>>,
    sas_verified: Mutex<Vec<CallId>>,
    rejecting_sas: Mutex<bool>,
    queries: Mutex<usize>,
}

impl ScriptedDaemon {
    /// Set the participant list the daemon reports for a conference
    pub fn set_participants(&self, conference: &str, members: &[&str]) {
        self.participants.lock().insert(
            ConferenceId::from(conference),
            members.iter().map(|m| CallId::from(*m)).collect(),
        );
    }

    /// Make every participant query fail
    pub fn fail_queries(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Make the daemon refuse SAS confirmations
    pub fn reject_sas(&self, rejecting: bool) {
        *self.rejecting_sas.lock() = rejecting;
    }

    pub fn hang_ups(&self) -> Vec<CallId> {
        self.hang_ups.lock().clone()
    }

    pub fn sas_verified(&self) -> Vec<CallId> {
        self.sas_verified.lock().clone()
    }

    pub fn query_count(&self) -> usize {
        *self.queries.lock()
    }
}

impl DaemonBridge for ScriptedDaemon {
    fn participants(&self, conference_id: &ConferenceId) -> SyncResult<Vec<CallId>> {
        *self.queries.lock() += 1;
        if *self.failing.lock() {
            return Err(SyncError::daemon_query(conference_id, "daemon unreachable"));
        }
        Ok(self
            .participants
            .lock()
            .get(conference_id)
            .cloned()
            .unwrap_or_default())
    }

    fn hang_up(&self, call_id: &CallId) -> SyncResult<()> {
        self.hang_ups.lock().push(call_id.clone());
        Ok(())
    }

    fn set_sas_verified(&self, call_id: &CallId) -> SyncResult<()> {
        if *self.rejecting_sas.lock() {
            return Err(SyncError::daemon_command(call_id, "SAS confirmation refused"));
        }
        self.sas_verified.lock().push(call_id.clone());
        Ok(())
    }
}

/// A synchronizer wired to recording doubles and a manual clock
pub struct Harness {
    pub sync: Arc<Synchronizer>,
    pub daemon: Arc<ScriptedDaemon>,
    pub history: Arc<RecordingHistory>,
    pub notifications: Arc<RecordingNotifications>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        init_tracing();
        let daemon = Arc::new(ScriptedDaemon::default());
        let history = Arc::new(RecordingHistory::default());
        let notifications = Arc::new(RecordingNotifications::default());
        let clock = Arc::new(ManualClock::at_secs(0));
        let sync = Synchronizer::new(config, daemon.clone(), history.clone(), notifications.clone())
            .with_clock(clock.clone());
        Self {
            sync: Arc::new(sync),
            daemon,
            history,
            notifications,
            clock,
        }
    }

    pub fn signal(&self, name: &str, args: &[&str]) -> Handled {
        self.sync.handle_signal(name, args)
    }

    pub fn incoming(&self, call_id: &str) -> Handled {
        self.signal("incomingCall", &["acc1", call_id, "sip:peer@example.com"])
    }

    pub fn outgoing(&self, call_id: &str) -> Handled {
        self.signal("newCallCreated", &["acc1", call_id, "sip:peer@example.com"])
    }

    pub fn state(&self, call_id: &str, state: &str) -> Handled {
        self.signal("callStateChanged", &[call_id, state, "0"])
    }

    pub fn at(&self, secs: i64) -> &Self {
        self.clock.set_secs(secs);
        self
    }

    /// Merge `members` into `conference` through a conferenceCreated signal
    pub fn merge(&self, conference: &str, members: &[&str]) -> Handled {
        self.daemon.set_participants(conference, members);
        self.signal("conferenceCreated", &[conference])
    }

    pub fn members(&self, conference: &str) -> Vec<String> {
        self.sync
            .conference(&ConferenceId::from(conference))
            .map(|c| c.members().map(|m| m.to_string()).collect())
            .unwrap_or_default()
    }

    pub async fn flush(&self) {
        self.sync.flush().await;
    }
}
