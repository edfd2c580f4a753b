//! Daemon-facing interfaces
//!
//! [`DaemonEvent`] is the tagged union of every signal the telephony daemon
//! emits; [`DaemonEvent::from_signal`] decodes the daemon's raw string form.
//! [`DaemonBridge`] is the small outbound surface the synchronizer needs: the
//! synchronous participant query used at merge/split time and two commands.

use std::collections::BTreeMap;

use crate::call::CallId;
use crate::conference::ConferenceId;
use crate::error::{SyncError, SyncResult};

/// An event emitted by the telephony daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// `callStateChanged(callId, state, detailCode)`
    CallStateChanged {
        call_id: CallId,
        state: String,
        detail_code: i32,
    },
    /// `incomingCall(accountId, callId, from)`
    IncomingCall {
        account_id: String,
        call_id: CallId,
        peer: String,
    },
    /// `newCallCreated(accountId, callId, to)`
    OutgoingCallPlaced {
        account_id: String,
        call_id: CallId,
        peer: String,
    },
    /// `conferenceCreated(confId)`
    ConferenceCreated { conference_id: ConferenceId },
    /// `conferenceChanged(confId, state)`
    ConferenceChanged {
        conference_id: ConferenceId,
        state: String,
    },
    /// `conferenceRemoved(confId)`
    ConferenceRemoved { conference_id: ConferenceId },
    /// `incomingMessage(callId, from, text)`
    IncomingMessage {
        call_id: CallId,
        peer: String,
        text: String,
    },
    /// `secureSdesOn(callId)`
    SecureSdesOn { call_id: CallId },
    /// `secureSdesOff(callId)`
    SecureSdesOff { call_id: CallId },
    /// `secureZrtpOn(callId, cipher)`
    SecureZrtpOn { call_id: CallId, cipher: String },
    /// `secureZrtpOff(callId)`
    SecureZrtpOff { call_id: CallId },
    /// `showSAS(callId, sas, verified)`
    ShowSas {
        call_id: CallId,
        sas: String,
        verified: bool,
    },
    /// `zrtpNotSuppOther(callId)`
    ZrtpNotSupported { call_id: CallId },
    /// `zrtpNegotiationFailed(callId, reason, severity)`
    ZrtpNegotiationFailed {
        call_id: CallId,
        reason: String,
        severity: String,
    },
    /// `recordPlaybackFilepath(id, filename)`; `id` is a call or conference id
    RecordPlaybackFilepath { id: String, path: String },
    /// `transferSucceeded()`, `transferFailed()` or `transferStateChanged(result)`
    TransferStateChanged { result: String },
    /// `onRtcpReportReceived(callId, key=value...)`
    RtcpReportReceived {
        call_id: CallId,
        stats: BTreeMap<String, i64>,
    },
}

impl DaemonEvent {
    /// Decode a raw daemon signal and its positional arguments
    ///
    /// Returns [`SyncError::MalformedEvent`] for unknown signal names, missing
    /// arguments and empty identifiers.
    pub fn from_signal<S: AsRef<str>>(name: &str, args: &[S]) -> SyncResult<Self> {
        let args = Args { signal: name, args };
        let event = match name {
            "callStateChanged" => Self::CallStateChanged {
                call_id: args.call_id(0)?,
                state: args.required(1)?.to_string(),
                detail_code: args.optional_int(2)?.unwrap_or(0),
            },
            "incomingCall" => Self::IncomingCall {
                account_id: args.required(0)?.to_string(),
                call_id: args.call_id(1)?,
                peer: args.required(2)?.to_string(),
            },
            "newCallCreated" | "outgoingCallPlaced" => Self::OutgoingCallPlaced {
                account_id: args.required(0)?.to_string(),
                call_id: args.call_id(1)?,
                peer: args.required(2)?.to_string(),
            },
            "conferenceCreated" => Self::ConferenceCreated {
                conference_id: args.conference_id(0)?,
            },
            "conferenceChanged" => Self::ConferenceChanged {
                conference_id: args.conference_id(0)?,
                state: args.required(1)?.to_string(),
            },
            "conferenceRemoved" => Self::ConferenceRemoved {
                conference_id: args.conference_id(0)?,
            },
            "incomingMessage" => Self::IncomingMessage {
                call_id: args.call_id(0)?,
                peer: args.required(1)?.to_string(),
                text: args.required(2)?.to_string(),
            },
            "secureSdesOn" => Self::SecureSdesOn { call_id: args.call_id(0)? },
            "secureSdesOff" => Self::SecureSdesOff { call_id: args.call_id(0)? },
            "secureZrtpOn" => Self::SecureZrtpOn {
                call_id: args.call_id(0)?,
                cipher: args.required(1)?.to_string(),
            },
            "secureZrtpOff" => Self::SecureZrtpOff { call_id: args.call_id(0)? },
            "showSAS" | "showSas" => Self::ShowSas {
                call_id: args.call_id(0)?,
                sas: args.required(1)?.to_string(),
                verified: args.flag(2)?,
            },
            "zrtpNotSuppOther" | "zrtpNotSupported" => Self::ZrtpNotSupported {
                call_id: args.call_id(0)?,
            },
            "zrtpNegotiationFailed" => Self::ZrtpNegotiationFailed {
                call_id: args.call_id(0)?,
                reason: args.required(1)?.to_string(),
                severity: args.get(2).unwrap_or_default().to_string(),
            },
            "recordPlaybackFilepath" => Self::RecordPlaybackFilepath {
                id: args.id(0)?.to_string(),
                path: args.required(1)?.to_string(),
            },
            "transferSucceeded" => Self::TransferStateChanged {
                result: "success".to_string(),
            },
            "transferFailed" => Self::TransferStateChanged {
                result: "failure".to_string(),
            },
            "transferStateChanged" => Self::TransferStateChanged {
                result: args.required(0)?.to_string(),
            },
            "onRtcpReportReceived" | "rtcpReportReceived" => Self::RtcpReportReceived {
                call_id: args.call_id(0)?,
                stats: args.stats(1)?,
            },
            other => {
                return Err(SyncError::malformed(format!("unknown daemon signal '{}'", other)));
            }
        };
        Ok(event)
    }

    /// Daemon signal name of this event
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallStateChanged { .. } => "callStateChanged",
            Self::IncomingCall { .. } => "incomingCall",
            Self::OutgoingCallPlaced { .. } => "newCallCreated",
            Self::ConferenceCreated { .. } => "conferenceCreated",
            Self::ConferenceChanged { .. } => "conferenceChanged",
            Self::ConferenceRemoved { .. } => "conferenceRemoved",
            Self::IncomingMessage { .. } => "incomingMessage",
            Self::SecureSdesOn { .. } => "secureSdesOn",
            Self::SecureSdesOff { .. } => "secureSdesOff",
            Self::SecureZrtpOn { .. } => "secureZrtpOn",
            Self::SecureZrtpOff { .. } => "secureZrtpOff",
            Self::ShowSas { .. } => "showSAS",
            Self::ZrtpNotSupported { .. } => "zrtpNotSuppOther",
            Self::ZrtpNegotiationFailed { .. } => "zrtpNegotiationFailed",
            Self::RecordPlaybackFilepath { .. } => "recordPlaybackFilepath",
            Self::TransferStateChanged { .. } => "transferStateChanged",
            Self::RtcpReportReceived { .. } => "onRtcpReportReceived",
        }
    }

    /// Call the event targets, if it targets a call
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::CallStateChanged { call_id, .. }
            | Self::IncomingCall { call_id, .. }
            | Self::OutgoingCallPlaced { call_id, .. }
            | Self::IncomingMessage { call_id, .. }
            | Self::SecureSdesOn { call_id }
            | Self::SecureSdesOff { call_id }
            | Self::SecureZrtpOn { call_id, .. }
            | Self::SecureZrtpOff { call_id }
            | Self::ShowSas { call_id, .. }
            | Self::ZrtpNotSupported { call_id }
            | Self::ZrtpNegotiationFailed { call_id, .. }
            | Self::RtcpReportReceived { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Conference the event targets, if it targets a conference
    pub fn conference_id(&self) -> Option<&ConferenceId> {
        match self {
            Self::ConferenceCreated { conference_id }
            | Self::ConferenceChanged { conference_id, .. }
            | Self::ConferenceRemoved { conference_id } => Some(conference_id),
            _ => None,
        }
    }
}

struct Args<'a, S> {
    signal: &'a str,
    args: &'a [S],
}

impl<S: AsRef<str>> Args<'_, S> {
    fn get(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|a| a.as_ref())
    }

    fn required(&self, index: usize) -> SyncResult<&str> {
        self.get(index).ok_or_else(|| {
            SyncError::malformed(format!("{}: missing argument {}", self.signal, index))
        })
    }

    fn id(&self, index: usize) -> SyncResult<&str> {
        let id = self.required(index)?.trim();
        if id.is_empty() {
            return Err(SyncError::malformed(format!("{}: empty id", self.signal)));
        }
        Ok(id)
    }

    fn call_id(&self, index: usize) -> SyncResult<CallId> {
        self.id(index).map(CallId::from)
    }

    fn conference_id(&self, index: usize) -> SyncResult<ConferenceId> {
        self.id(index).map(ConferenceId::from)
    }

    fn optional_int(&self, index: usize) -> SyncResult<Option<i32>> {
        match self.get(index).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                SyncError::malformed(format!("{}: '{}' is not an integer", self.signal, raw))
            }),
        }
    }

    fn flag(&self, index: usize) -> SyncResult<bool> {
        match self.required(index)?.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            raw => Err(SyncError::malformed(format!(
                "{}: '{}' is not a boolean",
                self.signal, raw
            ))),
        }
    }

    fn stats(&self, from: usize) -> SyncResult<BTreeMap<String, i64>> {
        let mut stats = BTreeMap::new();
        for raw in self.args.iter().skip(from).map(|a| a.as_ref()) {
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                SyncError::malformed(format!("{}: '{}' is not key=value", self.signal, raw))
            })?;
            let value = value.trim().parse().map_err(|_| {
                SyncError::malformed(format!("{}: '{}' is not an integer", self.signal, raw))
            })?;
            stats.insert(key.trim().to_string(), value);
        }
        Ok(stats)
    }
}

/// Outbound surface of the telephony daemon
///
/// Implementations wrap the daemon's native bindings. All calls are
/// synchronous and expected to return quickly.
pub trait DaemonBridge: Send + Sync {
    /// Authoritative member list of a conference
    fn participants(&self, conference_id: &ConferenceId) -> SyncResult<Vec<CallId>>;

    /// Release a call's native resources; must be idempotent
    fn hang_up(&self, call_id: &CallId) -> SyncResult<()>;

    /// Tell the daemon the user confirmed the SAS
    fn set_sas_verified(&self, call_id: &CallId) -> SyncResult<()>;
}
