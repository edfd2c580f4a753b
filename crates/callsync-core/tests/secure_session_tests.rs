//! Secure session tracking through the synchronizer

mod common;

use common::Harness;
use rvoip_callsync_core::*;

fn cid(id: &str) -> CallId {
    CallId::from(id)
}

#[tokio::test]
async fn test_zrtp_on_then_show_sas() {
    let h = Harness::new();
    h.incoming("c1");
    h.state("c1", "CURRENT");

    h.signal("secureZrtpOn", &["c1", "AES1"]);
    h.flush().await;
    match h.notifications.events().last() {
        Some(AppEvent::SecureSessionChanged { change, session, .. }) => {
            assert_eq!(*change, SecureChange::ZrtpOn);
            assert!(session.negotiated);
            assert!(!session.verified);
        }
        other => panic!("unexpected event {:?}", other),
    }

    h.signal("showSAS", &["c1", "ab12", "1"]);
    let session = h.sync.secure_session(&cid("c1")).unwrap();
    assert_eq!(session.mechanism, SecureMechanism::Zrtp);
    assert!(session.negotiated);
    assert_eq!(session.cipher.as_deref(), Some("AES1"));
    assert_eq!(session.sas.as_deref(), Some("ab12"));
    assert!(session.verified);
}

#[tokio::test]
async fn test_cipher_alone_never_verifies() {
    let h = Harness::new();
    h.incoming("c1");
    h.signal("secureZrtpOn", &["c1", "AES256"]);
    h.signal("showSAS", &["c1", "zz99", "0"]);

    let session = h.sync.secure_session(&cid("c1")).unwrap();
    assert!(session.negotiated);
    assert!(!session.verified);
    assert!(session.needs_sas_confirmation());
}

#[tokio::test]
async fn test_confirm_sas() {
    let h = Harness::new();
    h.incoming("c1");
    h.signal("secureZrtpOn", &["c1", "AES1"]);
    h.signal("showSAS", &["c1", "ab12", "0"]);

    h.sync.confirm_sas(&cid("c1")).unwrap();
    assert!(h.sync.secure_session(&cid("c1")).unwrap().verified);
    assert_eq!(h.daemon.sas_verified(), vec![cid("c1")]);

    let err = h.sync.confirm_sas(&cid("c9")).unwrap_err();
    assert_eq!(err, SyncError::unknown_call(&cid("c9")));
    assert_eq!(h.daemon.sas_verified().len(), 1);

    h.flush().await;
    match h.notifications.events().last() {
        Some(AppEvent::SecureSessionChanged { change, session, .. }) => {
            assert_eq!(*change, SecureChange::SasConfirmed);
            assert!(session.verified);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_confirm_sas_without_pending_sas_is_rejected() {
    let h = Harness::new();
    h.incoming("c1");

    let err = h.sync.confirm_sas(&cid("c1")).unwrap_err();
    assert_eq!(err, SyncError::SasNotPending { call_id: cid("c1") });
    assert!(h.sync.secure_session(&cid("c1")).is_none());

    h.signal("secureZrtpOn", &["c1", "AES1"]);
    assert_eq!(h.sync.confirm_sas(&cid("c1")).unwrap_err().kind(), "sas-not-pending");
    assert!(!h.sync.secure_session(&cid("c1")).unwrap().verified);

    h.signal("showSAS", &["c1", "ab12", "1"]);
    assert_eq!(h.sync.confirm_sas(&cid("c1")).unwrap_err().kind(), "sas-not-pending");
    assert!(h.daemon.sas_verified().is_empty());
}

#[tokio::test]
async fn test_confirm_sas_refused_by_daemon_stays_unverified() {
    let h = Harness::new();
    h.incoming("c1");
    h.signal("secureZrtpOn", &["c1", "AES1"]);
    h.signal("showSAS", &["c1", "ab12", "0"]);
    h.flush().await;
    h.notifications.clear();

    h.daemon.reject_sas(true);
    let err = h.sync.confirm_sas(&cid("c1")).unwrap_err();
    assert_eq!(err.kind(), "daemon-command-failure");
    let session = h.sync.secure_session(&cid("c1")).unwrap();
    assert!(!session.verified);
    assert!(session.needs_sas_confirmation());
    h.flush().await;
    assert!(h.notifications.events().is_empty());

    h.daemon.reject_sas(false);
    h.sync.confirm_sas(&cid("c1")).unwrap();
    assert!(h.sync.secure_session(&cid("c1")).unwrap().verified);
}

#[tokio::test]
async fn test_sdes_off_keeps_zrtp_session() {
    let h = Harness::new();
    h.incoming("c1");
    h.signal("secureZrtpOn", &["c1", "AES1"]);
    h.signal("secureSdesOff", &["c1"]);

    let session = h.sync.secure_session(&cid("c1")).unwrap();
    assert_eq!(session.mechanism, SecureMechanism::Zrtp);
    assert!(session.negotiated);
    assert_eq!(session.cipher.as_deref(), Some("AES1"));
    assert!(session.is_secure());
}

#[tokio::test]
async fn test_session_created_lazily_and_destroyed_with_call() {
    let h = Harness::new();
    h.incoming("c1");
    assert!(h.sync.secure_session(&cid("c1")).is_none());

    h.signal("secureSdesOn", &["c1"]);
    assert_eq!(h.sync.secure_session(&cid("c1")).unwrap().mechanism, SecureMechanism::Sdes);

    h.state("c1", "HUNGUP");
    assert!(h.sync.secure_session(&cid("c1")).is_none());
    assert!(h.sync.snapshot().secure_sessions.is_empty());
    h.sync.check_invariants().unwrap();
}

#[tokio::test]
async fn test_negotiation_failures() {
    let h = Harness::new();
    h.incoming("c1");
    h.signal("zrtpNotSuppOther", &["c1"]);
    assert_eq!(h.sync.secure_session(&cid("c1")).unwrap().zrtp_supported, Some(false));

    h.signal("zrtpNegotiationFailed", &["c1", "hello timeout", "error"]);
    let session = h.sync.secure_session(&cid("c1")).unwrap();
    let failure = session.failure.unwrap();
    assert_eq!(failure.reason, "hello timeout");
    assert_eq!(failure.severity, "error");

    h.signal("secureZrtpOn", &["c1", "AES1"]);
    h.signal("secureZrtpOff", &["c1"]);
    let session = h.sync.secure_session(&cid("c1")).unwrap();
    assert!(!session.negotiated);
    assert!(!session.verified);
    assert_eq!(session.zrtp_supported, Some(false));
}

#[tokio::test]
async fn test_secure_events_for_unknown_calls_are_dropped() {
    let h = Harness::new();
    for (name, args) in [
        ("secureSdesOn", vec!["c1"]),
        ("secureSdesOff", vec!["c1"]),
        ("secureZrtpOn", vec!["c1", "AES1"]),
        ("secureZrtpOff", vec!["c1"]),
        ("showSAS", vec!["c1", "ab12", "1"]),
        ("zrtpNotSuppOther", vec!["c1"]),
        ("zrtpNegotiationFailed", vec!["c1", "x", "y"]),
    ] {
        let handled = h.signal(name, &args);
        assert_eq!(handled.error().map(|e| e.kind()), Some("unknown-id"), "{}", name);
    }
    h.flush().await;
    assert!(h.notifications.events().is_empty());
    assert!(h.sync.snapshot().secure_sessions.is_empty());
}
