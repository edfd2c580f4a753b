//! Secure session tracking (SDES / ZRTP)
//!
//! Sessions are created lazily on the first security event for a call and
//! destroyed together with the call. `verified` only ever changes through an
//! explicit daemon flag or a local SAS confirmation; it is never inferred
//! from the presence of a cipher.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::call::CallId;

/// Key negotiation mechanism in use for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecureMechanism {
    /// No media encryption
    #[default]
    None,
    /// SDES keys exchanged in SDP
    Sdes,
    /// ZRTP key agreement
    Zrtp,
}

/// ZRTP negotiation failure reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationFailure {
    /// Daemon-supplied reason
    pub reason: String,
    /// Daemon-supplied severity
    pub severity: String,
}

/// Security state of one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureSession {
    /// Mechanism in use
    pub mechanism: SecureMechanism,
    /// Whether key negotiation completed
    pub negotiated: bool,
    /// Negotiated cipher suite
    pub cipher: Option<String>,
    /// Short authentication string to show the user
    pub sas: Option<String>,
    /// SAS confirmed out of band
    pub verified: bool,
    /// `Some(false)` once the daemon reports the peer lacks ZRTP
    pub zrtp_supported: Option<bool>,
    /// Last ZRTP negotiation failure
    pub failure: Option<NegotiationFailure>,
}

impl SecureSession {
    /// Whether media is currently encrypted
    pub fn is_secure(&self) -> bool {
        self.negotiated && self.mechanism != SecureMechanism::None
    }

    /// Whether the user should be asked to compare the SAS
    pub fn needs_sas_confirmation(&self) -> bool {
        self.mechanism == SecureMechanism::Zrtp && self.sas.is_some() && !self.verified
    }
}

/// Per-call secure sessions
#[derive(Debug, Clone, Default)]
pub struct SecureSessionTracker {
    sessions: HashMap<CallId, SecureSession>,
}

impl SecureSessionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&mut self, call_id: &CallId) -> &mut SecureSession {
        self.sessions.entry(call_id.clone()).or_default()
    }

    /// SDES keys are in use
    pub fn sdes_on(&mut self, call_id: &CallId) -> &SecureSession {
        let session = self.session(call_id);
        session.mechanism = SecureMechanism::Sdes;
        session.negotiated = true;
        session
    }

    /// SDES keys are no longer in use
    pub fn sdes_off(&mut self, call_id: &CallId) -> &SecureSession {
        let session = self.session(call_id);
        if session.mechanism == SecureMechanism::Sdes {
            session.mechanism = SecureMechanism::None;
            session.negotiated = false;
        }
        session
    }

    /// ZRTP negotiated with `cipher`
    pub fn zrtp_on(&mut self, call_id: &CallId, cipher: impl Into<String>) -> &SecureSession {
        let session = self.session(call_id);
        session.mechanism = SecureMechanism::Zrtp;
        session.negotiated = true;
        session.cipher = Some(cipher.into());
        session.zrtp_supported = Some(true);
        session.failure = None;
        session
    }

    /// ZRTP went down; a new negotiation needs a new confirmation
    ///
    /// The peer is treated as lacking ZRTP until a later `zrtp_on`. An SDES
    /// session is left alone.
    pub fn zrtp_off(&mut self, call_id: &CallId) -> &SecureSession {
        let session = self.session(call_id);
        if session.mechanism == SecureMechanism::Zrtp {
            session.negotiated = false;
            session.verified = false;
        }
        session.zrtp_supported = Some(false);
        session
    }

    /// Daemon asks to display the SAS with its current verification flag
    pub fn show_sas(
        &mut self,
        call_id: &CallId,
        sas: impl Into<String>,
        verified: bool,
    ) -> &SecureSession {
        let session = self.session(call_id);
        session.mechanism = SecureMechanism::Zrtp;
        session.sas = Some(sas.into());
        session.verified = verified;
        session
    }

    /// The peer does not support ZRTP
    pub fn zrtp_not_supported(&mut self, call_id: &CallId) -> &SecureSession {
        let session = self.session(call_id);
        session.zrtp_supported = Some(false);
        session
    }

    /// ZRTP negotiation failed
    pub fn zrtp_negotiation_failed(
        &mut self,
        call_id: &CallId,
        reason: impl Into<String>,
        severity: impl Into<String>,
    ) -> &SecureSession {
        let session = self.session(call_id);
        session.negotiated = false;
        session.verified = false;
        session.zrtp_supported = Some(false);
        session.failure = Some(NegotiationFailure {
            reason: reason.into(),
            severity: severity.into(),
        });
        session
    }

    /// Local user confirmed the SAS
    ///
    /// Returns `None`, leaving the tracker untouched, unless a SAS is awaiting
    /// confirmation on the call.
    pub fn confirm_sas(&mut self, call_id: &CallId) -> Option<&SecureSession> {
        let session = self
            .sessions
            .get_mut(call_id)
            .filter(|session| session.needs_sas_confirmation())?;
        session.verified = true;
        Some(session)
    }

    /// Secure session of a call, if any security event was seen
    pub fn get(&self, call_id: &CallId) -> Option<&SecureSession> {
        self.sessions.get(call_id)
    }

    /// Destroy a call's session
    pub fn remove(&mut self, call_id: &CallId) -> Option<SecureSession> {
        self.sessions.remove(call_id)
    }

    /// Iterate over tracked sessions
    pub fn iter(&self) -> impl Iterator<Item = (&CallId, &SecureSession)> {
        self.sessions.iter()
    }

    /// Number of tracked sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is tracked
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
