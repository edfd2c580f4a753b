//! Event dispatcher / state synchronizer
//!
//! [`Synchronizer::handle`] is the single entry point for daemon events. Each
//! event is applied in three phases:
//!
//! 1. **Query**: for conference events the daemon's authoritative member list
//!    is fetched *before* any lock is taken.
//! 2. **Apply**: under the global write lock the registries and the secure
//!    session tracker are updated, and the resulting history record and
//!    application event are queued on the [`SinkDispatcher`]. Queueing inside
//!    the lock keeps sink delivery order identical to application order.
//! 3. **Command**: once the lock is released, daemon commands (`hangUp`) are
//!    issued, so a daemon that calls back synchronously cannot deadlock us.
//!
//! Nothing here is fatal: an event that cannot be applied is logged with its
//! error kind and dropped, and reported back as [`Handled::Dropped`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{Call, CallId, CallState};
use crate::clock::{Clock, SystemClock};
use crate::conference::{Conference, ConferenceId, ConferenceState, TextMessage};
use crate::config::SyncConfig;
use crate::daemon::{DaemonBridge, DaemonEvent};
use crate::dispatch::SinkDispatcher;
use crate::events::{
    AppEvent, EventTarget, HistoryRecord, HistorySink, NotificationSink, SecureChange,
};
use crate::registry::Registry;
use crate::secure::{SecureSession, SecureSessionTracker};
use crate::error::{SyncError, SyncResult};

/// What happened to a daemon event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// State changed and an application event was emitted
    Applied,
    /// The event was valid but changed nothing
    Unchanged,
    /// The event was logged and dropped
    Dropped(SyncError),
}

impl Handled {
    /// Whether the event changed state
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// The error that caused the event to be dropped
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Dropped(e) => Some(e),
            _ => None,
        }
    }
}

/// Counters of processed daemon events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub processed: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub dropped: u64,
    pub history_records: u64,
    pub hang_ups: u64,
}

/// Owned copy of the synchronizer state taken under one read lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Live calls ordered by creation time
    pub calls: Vec<Call>,
    /// Conferences in creation order
    pub conferences: Vec<Conference>,
    /// Secure sessions by call
    pub secure_sessions: BTreeMap<CallId, SecureSession>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Look up a call in the snapshot
    pub fn call(&self, id: &CallId) -> Option<&Call> {
        self.calls.iter().find(|c| &c.id == id)
    }

    /// Look up a conference in the snapshot
    pub fn conference(&self, id: &ConferenceId) -> Option<&Conference> {
        self.conferences.iter().find(|c| &c.id == id)
    }

    /// Conferences with more than one member
    pub fn multi_party(&self) -> impl Iterator<Item = &Conference> {
        self.conferences.iter().filter(|c| c.has_multiple_participants())
    }
}

#[derive(Debug, Default)]
struct SyncState {
    registry: Registry,
    secure: SecureSessionTracker,
}

#[derive(Debug)]
enum DaemonCommand {
    HangUp(CallId),
}

#[derive(Debug, Default)]
struct Effects {
    event: Option<AppEvent>,
    history: Option<HistoryRecord>,
    commands: Vec<DaemonCommand>,
}

impl Effects {
    fn event(event: AppEvent) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// Keeps the call and conference model in step with the daemon
pub struct Synchronizer {
    config: SyncConfig,
    state: RwLock<SyncState>,
    daemon: Arc<dyn DaemonBridge>,
    sinks: SinkDispatcher,
    clock: Arc<dyn Clock>,
    stats: Mutex<SyncStats>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    /// Create a synchronizer; must be called inside a tokio runtime
    pub fn new(
        config: SyncConfig,
        daemon: Arc<dyn DaemonBridge>,
        history: Arc<dyn HistorySink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let state = SyncState {
            registry: Registry::new(config.terminated_call_memory),
            secure: SecureSessionTracker::new(),
        };
        Self {
            config,
            state: RwLock::new(state),
            daemon,
            sinks: SinkDispatcher::spawn(history, notifications),
            clock: Arc::new(SystemClock),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply one daemon event
    pub fn handle(&self, event: DaemonEvent) -> Handled {
        let name = event.name();
        debug!("Handling daemon event {}: {:?}", name, event);

        let participants = match &event {
            DaemonEvent::ConferenceCreated { conference_id }
            | DaemonEvent::ConferenceChanged { conference_id, .. } => {
                Some(self.daemon.participants(conference_id))
            }
            _ => None,
        };

        let applied = {
            let mut state = self.state.write();
            let now = self.clock.now();
            let result = self.apply(&mut state, event, participants, now);
            if let Ok(effects) = &result {
                if let Some(record) = &effects.history {
                    self.sinks.record(record.clone());
                }
                if let Some(app_event) = &effects.event {
                    self.sinks.publish(app_event.clone());
                }
            }
            result
        };

        let handled = match applied {
            Ok(effects) => {
                let wrote_history = effects.history.is_some();
                let handled = if effects.event.is_some() {
                    Handled::Applied
                } else {
                    Handled::Unchanged
                };
                let hang_ups = self.run_commands(effects.commands);

                let mut stats = self.stats.lock();
                stats.history_records += u64::from(wrote_history);
                stats.hang_ups += hang_ups;
                handled
            }
            Err(e) => {
                warn!("Dropping daemon event {} ({}): {}", name, e.kind(), e);
                Handled::Dropped(e)
            }
        };

        let mut stats = self.stats.lock();
        stats.processed += 1;
        match &handled {
            Handled::Applied => stats.applied += 1,
            Handled::Unchanged => stats.unchanged += 1,
            Handled::Dropped(_) => stats.dropped += 1,
        }
        handled
    }

    /// Decode and apply a raw daemon signal
    pub fn handle_signal<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Handled {
        match DaemonEvent::from_signal(name, args) {
            Ok(event) => self.handle(event),
            Err(e) => {
                warn!("Dropping daemon signal {} ({}): {}", name, e.kind(), e);
                let mut stats = self.stats.lock();
                stats.processed += 1;
                stats.dropped += 1;
                Handled::Dropped(e)
            }
        }
    }

    /// Mark a call's SAS as confirmed by the local user and tell the daemon
    ///
    /// Fails with [`SyncError::SasNotPending`] unless the daemon has shown a SAS
    /// that is not verified yet. The session is only marked verified once the
    /// daemon accepts the confirmation.
    pub fn confirm_sas(&self, call_id: &CallId) -> SyncResult<()> {
        {
            let state = self.state.read();
            ensure_live(&state.registry, call_id)?;
            let pending = state
                .secure
                .get(call_id)
                .is_some_and(|session| session.needs_sas_confirmation());
            if !pending {
                return Err(SyncError::SasNotPending {
                    call_id: call_id.clone(),
                });
            }
        }

        self.daemon.set_sas_verified(call_id)?;

        let mut state = self.state.write();
        ensure_live(&state.registry, call_id)?;
        let session = state
            .secure
            .confirm_sas(call_id)
            .cloned()
            .ok_or_else(|| SyncError::SasNotPending {
                call_id: call_id.clone(),
            })?;
        info!("SAS confirmed on call {}", call_id);
        self.sinks.publish(AppEvent::SecureSessionChanged {
            call_id: call_id.clone(),
            change: SecureChange::SasConfirmed,
            session,
        });
        Ok(())
    }

    /// Consume daemon events from a channel until every sender is gone
    pub async fn run(&self, mut receiver: mpsc::Receiver<DaemonEvent>) {
        info!("Call synchronizer event loop started");
        while let Some(event) = receiver.recv().await {
            self.handle(event);
        }
        info!("Call synchronizer event loop ended");
    }

    /// A bounded channel sized from the configuration, for use with [`run`](Self::run)
    pub fn channel(&self) -> (mpsc::Sender<DaemonEvent>, mpsc::Receiver<DaemonEvent>) {
        mpsc::channel(self.config.event_channel_capacity.max(1))
    }

    /// Spawn the event loop and return the sender that feeds it
    pub fn event_sender(self: &Arc<Self>) -> (mpsc::Sender<DaemonEvent>, JoinHandle<()>) {
        let (sender, receiver) = self.channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(receiver).await });
        (sender, handle)
    }

    /// Wait until every queued sink delivery has completed
    pub async fn flush(&self) {
        self.sinks.flush().await;
    }

    /// Deliver what is queued and stop the sink workers
    pub async fn shutdown(self) {
        self.sinks.shutdown().await;
    }

    /// Consistent copy of the whole state
    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read();
        let mut calls: Vec<Call> = state.registry.calls().iter().cloned().collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        StateSnapshot {
            calls,
            conferences: state.registry.conferences().iter().cloned().collect(),
            secure_sessions: state
                .secure
                .iter()
                .map(|(id, session)| (id.clone(), session.clone()))
                .collect(),
            taken_at: self.clock.now(),
        }
    }

    /// Copy of a live call
    pub fn call(&self, id: &CallId) -> Option<Call> {
        self.state.read().registry.call(id).cloned()
    }

    /// Copy of a conference
    pub fn conference(&self, id: &ConferenceId) -> Option<Conference> {
        self.state.read().registry.conference(id).cloned()
    }

    /// Copy of the conference that owns a call
    pub fn conference_of(&self, call_id: &CallId) -> Option<Conference> {
        self.state.read().registry.conference_of(call_id).cloned()
    }

    /// Copy of a call's secure session
    pub fn secure_session(&self, call_id: &CallId) -> Option<SecureSession> {
        self.state.read().secure.get(call_id).cloned()
    }

    /// Number of live calls
    pub fn call_count(&self) -> usize {
        self.state.read().registry.calls().len()
    }

    /// Number of conferences, single-call shells included
    pub fn conference_count(&self) -> usize {
        self.state.read().registry.conferences().len()
    }

    /// Event counters
    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    /// Verify the call/conference partition
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.read();
        state.registry.check_invariants()?;
        for (call_id, _) in state.secure.iter() {
            if state.registry.call(call_id).is_none() {
                return Err(format!("secure session outlived call {}", call_id));
            }
        }
        Ok(())
    }

    fn run_commands(&self, commands: Vec<DaemonCommand>) -> u64 {
        let mut hang_ups = 0;
        for command in commands {
            match command {
                DaemonCommand::HangUp(call_id) => {
                    debug!("Releasing daemon resources of failed call {}", call_id);
                    hang_ups += 1;
                    if let Err(e) = self.daemon.hang_up(&call_id) {
                        warn!("hangUp for call {} failed: {}", call_id, e);
                    }
                }
            }
        }
        hang_ups
    }

    fn apply(
        &self,
        state: &mut SyncState,
        event: DaemonEvent,
        participants: Option<SyncResult<Vec<CallId>>>,
        now: DateTime<Utc>,
    ) -> SyncResult<Effects> {
        match event {
            DaemonEvent::CallStateChanged {
                call_id,
                state: raw,
                detail_code,
            } => self.apply_call_state(state, call_id, &raw, detail_code, now),

            DaemonEvent::IncomingCall {
                account_id,
                call_id,
                peer,
            } => {
                let call = Call::incoming(account_id, call_id, peer, now);
                let conference_id = state.registry.insert_call(call.clone(), now)?;
                info!("Incoming call {} from {}", call.id, call.peer);
                Ok(Effects::event(AppEvent::IncomingCall {
                    call,
                    conference_id,
                }))
            }

            DaemonEvent::OutgoingCallPlaced {
                account_id,
                call_id,
                peer,
            } => {
                let call = Call::outgoing(account_id, call_id, peer, now);
                let conference_id = state.registry.insert_call(call.clone(), now)?;
                info!("Outgoing call {} to {}", call.id, call.peer);
                Ok(Effects::event(AppEvent::OutgoingCall {
                    call,
                    conference_id,
                }))
            }

            DaemonEvent::ConferenceCreated { conference_id } => {
                let members = participants
                    .unwrap_or_else(|| Err(SyncError::daemon_query(&conference_id, "no query")))?;
                if members.is_empty() {
                    info!("Conference {} created without participants; ignoring", conference_id);
                    return Ok(Effects::none());
                }

                let merge = state.registry.reconcile(&conference_id, &members, now)?;
                if !merge.skipped_unknown.is_empty() {
                    warn!(
                        "Conference {} lists unknown calls {:?}",
                        conference_id, merge.skipped_unknown
                    );
                }
                if !merge.changed() {
                    return Ok(Effects::none());
                }
                let conference = state
                    .registry
                    .conference(&conference_id)
                    .cloned()
                    .ok_or_else(|| SyncError::unknown_conference(&conference_id))?;
                info!(
                    "Conference {} created with {} participants",
                    conference_id,
                    conference.len()
                );
                Ok(Effects::event(AppEvent::ConferenceCreated {
                    conference,
                    dissolved: merge.dissolved,
                }))
            }

            DaemonEvent::ConferenceChanged {
                conference_id,
                state: raw,
            } => {
                let parsed = ConferenceState::from_daemon(&raw);
                let conference = state
                    .registry
                    .conference_mut(&conference_id)
                    .ok_or_else(|| SyncError::unknown_conference(&conference_id))?;
                match parsed {
                    Some(s) => conference.state = Some(s),
                    None => warn!("Unknown state '{}' for conference {}", raw, conference_id),
                }

                let reconciled = participants.map(|members| {
                    members.and_then(|members| state.registry.reconcile(&conference_id, &members, now))
                });
                let (added, detached) = match reconciled {
                    Some(Ok(split)) => {
                        if split.deleted {
                            info!("Conference {} emptied by daemon update", conference_id);
                        }
                        (split.diff.to_add, split.diff.to_remove)
                    }
                    Some(Err(e)) => {
                        warn!(
                            "Keeping membership of conference {} ({}): {}",
                            conference_id,
                            e.kind(),
                            e
                        );
                        (Vec::new(), Vec::new())
                    }
                    None => (Vec::new(), Vec::new()),
                };

                Ok(Effects::event(AppEvent::ConferenceChanged {
                    conference: state.registry.conference(&conference_id).cloned(),
                    conference_id,
                    state: parsed,
                    added,
                    detached,
                }))
            }

            DaemonEvent::ConferenceRemoved { conference_id } => {
                let released = state.registry.dissolve(&conference_id, now)?;
                if released.is_empty() {
                    debug!("Conference {} is a single call; nothing to dissolve", conference_id);
                    return Ok(Effects::none());
                }
                info!(
                    "Conference {} removed, {} calls released",
                    conference_id,
                    released.len()
                );
                Ok(Effects::event(AppEvent::ConferenceRemoved {
                    conference_id,
                    released,
                }))
            }

            DaemonEvent::IncomingMessage {
                call_id,
                peer,
                text,
            } => {
                ensure_live(&state.registry, &call_id)?;
                let conference_id = state
                    .registry
                    .conferences()
                    .owner_of(&call_id)
                    .cloned()
                    .ok_or_else(|| SyncError::unknown_call(&call_id))?;
                let message = TextMessage {
                    call_id,
                    from: peer,
                    body: text,
                    received_at: now,
                };
                if let Some(conference) = state.registry.conference_mut(&conference_id) {
                    conference.messages.push(message.clone());
                }
                Ok(Effects::event(AppEvent::IncomingMessage {
                    conference_id,
                    message,
                }))
            }

            DaemonEvent::SecureSdesOn { call_id } => {
                secure_update(state, call_id, SecureChange::SdesOn, |t, id| t.sdes_on(id).clone())
            }
            DaemonEvent::SecureSdesOff { call_id } => {
                secure_update(state, call_id, SecureChange::SdesOff, |t, id| t.sdes_off(id).clone())
            }
            DaemonEvent::SecureZrtpOn { call_id, cipher } => {
                secure_update(state, call_id, SecureChange::ZrtpOn, |t, id| {
                    t.zrtp_on(id, cipher).clone()
                })
            }
            DaemonEvent::SecureZrtpOff { call_id } => {
                secure_update(state, call_id, SecureChange::ZrtpOff, |t, id| t.zrtp_off(id).clone())
            }
            DaemonEvent::ShowSas {
                call_id,
                sas,
                verified,
            } => secure_update(state, call_id, SecureChange::ShowSas, |t, id| {
                t.show_sas(id, sas, verified).clone()
            }),
            DaemonEvent::ZrtpNotSupported { call_id } => {
                secure_update(state, call_id, SecureChange::ZrtpNotSupported, |t, id| {
                    t.zrtp_not_supported(id).clone()
                })
            }
            DaemonEvent::ZrtpNegotiationFailed {
                call_id,
                reason,
                severity,
            } => secure_update(state, call_id, SecureChange::ZrtpNegotiationFailed, |t, id| {
                t.zrtp_negotiation_failed(id, reason, severity).clone()
            }),

            DaemonEvent::RecordPlaybackFilepath { id, path } => {
                let call_id = CallId::from(id.as_str());
                let conference_id = ConferenceId::from(id);
                let target = if let Some(call) = state.registry.call_mut(&call_id) {
                    call.record_path = Some(path.clone());
                    EventTarget::Call(call_id)
                } else if let Some(conference) = state.registry.conference_mut(&conference_id) {
                    conference.record_path = Some(path.clone());
                    EventTarget::Conference(conference_id)
                } else {
                    ensure_live(&state.registry, &call_id)?;
                    return Err(SyncError::unknown_conference(&conference_id));
                };
                Ok(Effects::event(AppEvent::RecordingPathChanged { target, path }))
            }

            DaemonEvent::TransferStateChanged { result } => {
                info!("Transfer finished: {}", result);
                Ok(Effects::event(AppEvent::TransferStateChanged { result }))
            }

            DaemonEvent::RtcpReportReceived { call_id, stats } => {
                ensure_live(&state.registry, &call_id)?;
                Ok(Effects::event(AppEvent::RtcpReport { call_id, stats }))
            }
        }
    }

    fn apply_call_state(
        &self,
        state: &mut SyncState,
        call_id: CallId,
        raw: &str,
        detail_code: i32,
        now: DateTime<Utc>,
    ) -> SyncResult<Effects> {
        let next = CallState::from_daemon(raw)
            .ok_or_else(|| SyncError::malformed(format!("unknown call state '{}'", raw)))?;
        ensure_live(&state.registry, &call_id)?;
        let call = state
            .registry
            .call_mut(&call_id)
            .ok_or_else(|| SyncError::unknown_call(&call_id))?;

        let Some(transition) = call.apply_state(next, now)? else {
            debug!("Call {} already {}", call_id, next.fold());
            return Ok(Effects::none());
        };
        call.detail_code = Some(detail_code);
        if transition.started {
            debug!("Call {} answered at {}", call_id, now);
        }

        if !transition.ended {
            let snapshot = call.clone();
            let conference_id = state.registry.conferences().owner_of(&call_id).cloned();
            if let Some(id) = &conference_id {
                state.registry.recompute_aggregate(id);
            }
            return Ok(Effects::event(AppEvent::CallStateChanged {
                call: snapshot,
                previous: transition.previous,
                current: transition.current,
                detail_code,
                conference_id,
            }));
        }

        let removed = state
            .registry
            .remove_call(&call_id)
            .ok_or_else(|| SyncError::unknown_call(&call_id))?;
        state.secure.remove(&call_id);

        let remaining = match &removed.conference_id {
            Some(id) if !removed.conference_deleted => state
                .registry
                .conference(id)
                .map(|c| c.member_ids())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        if removed.conference_deleted {
            if let Some(id) = &removed.conference_id {
                debug!("Conference {} deleted with its last call {}", id, call_id);
            }
        }

        let mut commands = Vec::new();
        if transition.current == CallState::Failure && self.config.hang_up_on_failure {
            commands.push(DaemonCommand::HangUp(call_id.clone()));
        }

        let record = HistoryRecord::from_call(
            removed.call.clone(),
            removed.conference_id.clone(),
            remaining,
        );
        info!(
            "Call {} ended in {} ({:?})",
            call_id, transition.current, record.outcome
        );

        Ok(Effects {
            event: Some(AppEvent::CallStateChanged {
                call: removed.call,
                previous: transition.previous,
                current: transition.current,
                detail_code,
                conference_id: removed.conference_id,
            }),
            history: Some(record),
            commands,
        })
    }
}

/// Reject ids that are not live, telling late events for ended calls apart
fn ensure_live(registry: &Registry, call_id: &CallId) -> SyncResult<()> {
    if registry.call(call_id).is_some() {
        return Ok(());
    }
    match registry.calls().terminal_state(call_id) {
        Some(state) => Err(SyncError::TerminalCall {
            call_id: call_id.clone(),
            state,
        }),
        None => Err(SyncError::unknown_call(call_id)),
    }
}

fn secure_update<F>(
    state: &mut SyncState,
    call_id: CallId,
    change: SecureChange,
    update: F,
) -> SyncResult<Effects>
where
    F: FnOnce(&mut SecureSessionTracker, &CallId) -> SecureSession,
{
    ensure_live(&state.registry, &call_id)?;
    let session = update(&mut state.secure, &call_id);
    Ok(Effects::event(AppEvent::SecureSessionChanged {
        call_id,
        change,
        session,
    }))
}
