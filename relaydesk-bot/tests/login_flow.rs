//! Login flow tests against the scripted platform.
//!
//! Tests cover:
//! - The phone → code → authorized path, end to end on a real loop thread
//! - Retained-session errors (bad code, expired code, wrong password)
//! - Two-factor flow and exactly-once completion
//! - Bridge timeouts and late results
//! - Configuration and connection failures
//! - Startup with stored credentials
//! - Session expiry

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use relaydesk_bot::bridge::EventLoop;
use relaydesk_bot::eventlog::EventLog;
use relaydesk_bot::scripted::{ScriptedAccount, ScriptedConnector, ScriptedNetwork};
use relaydesk_bot::{LoginError, LoginOrchestrator, LoginOutcome, LoginSettings, StoredCredentials};

struct Harness {
    network: Arc<ScriptedNetwork>,
    orchestrator: Arc<LoginOrchestrator>,
    log: Arc<EventLog>,
    // Field order: the orchestrator drops before the loop it dispatches to.
    _bot_loop: EventLoop,
}

fn harness_with(settings: LoginSettings, configured: bool) -> Harness {
    let network = ScriptedNetwork::new();
    network.add_account(
        "+8801000000",
        ScriptedAccount::new(1001, "123456").with_username("Alice"),
    );
    network.add_account(
        "+8801999999",
        ScriptedAccount::new(1002, "654321")
            .with_password("hunter2")
            .with_username("carol"),
    );
    let connector = if configured {
        ScriptedConnector::new(Arc::clone(&network))
    } else {
        ScriptedConnector::unconfigured(Arc::clone(&network))
    };
    let log = Arc::new(EventLog::in_memory());
    let orchestrator = Arc::new(LoginOrchestrator::new(
        Arc::new(connector),
        settings,
        Arc::clone(&log),
    ));
    let bot_loop = EventLoop::spawn("relaydesk-bot-test").unwrap();
    orchestrator.attach_loop(bot_loop.handle());
    Harness {
        network,
        orchestrator,
        log,
        _bot_loop: bot_loop,
    }
}

fn harness() -> Harness {
    harness_with(LoginSettings::default(), true)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ═══════════════════════════════════════════════════════════════════
// 1. Happy path
// ═══════════════════════════════════════════════════════════════════

mod happy_path {
    use super::*;

    #[test]
    fn wrong_code_then_right_code() {
        let h = harness();
        let orch = &h.orchestrator;

        let sid1 = orch.start_login("+8801000000").unwrap();
        assert_eq!(orch.pending_sessions(), 1);
        assert_eq!(h.network.codes_sent.load(Ordering::SeqCst), 1);

        assert_eq!(
            orch.verify_code(&sid1, "000000", None),
            Err(LoginError::InvalidCode)
        );
        assert_eq!(orch.pending_sessions(), 1, "session kept for retry");

        let outcome = orch.verify_code(&sid1, "123456", None).unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Authorized {
                identity: "alice".into()
            }
        );

        let client = orch.get_authenticated_client().expect("client published");
        assert_eq!(client.current_identity(), "alice");
        assert_eq!(client.owning_loop().map(|l| l.name()), Some("relaydesk-bot-test"));
        assert!(orch.is_connected());
        assert_eq!(orch.current_identity(), "alice");
        assert_eq!(orch.pending_sessions(), 0);
        assert!(h.log.recent(10).iter().any(|l| l.ends_with("Bot connected as @alice")));
    }

    #[test]
    fn completed_session_is_gone() {
        let h = harness();
        let sid = h.orchestrator.start_login("+8801000000").unwrap();
        h.orchestrator.verify_code(&sid, "123456", None).unwrap();
        assert_eq!(
            h.orchestrator.verify_code(&sid, "123456", None),
            Err(LoginError::SessionNotFound)
        );
    }

    #[test]
    fn scheduler_runs_on_the_owning_loop() {
        let h = harness_with(
            LoginSettings {
                scheduler_interval: Duration::from_millis(10),
                ..LoginSettings::default()
            },
            true,
        );
        let sid = h.orchestrator.start_login("+8801000000").unwrap();
        h.orchestrator.verify_code(&sid, "123456", None).unwrap();
        let client = h.orchestrator.get_authenticated_client().unwrap();
        assert!(wait_for(|| client.scheduler_ticks().unwrap_or(0) >= 2));
    }
}

// ═══════════════════════════════════════════════════════════════════
// 2. Unknown and retained sessions
// ═══════════════════════════════════════════════════════════════════

mod sessions {
    use super::*;

    #[test]
    fn unknown_id_is_not_found() {
        let h = harness();
        for (code, password) in [("123456", None), ("", Some("hunter2")), ("x", Some(""))] {
            assert_eq!(
                h.orchestrator.verify_code("never-issued", code, password),
                Err(LoginError::SessionNotFound)
            );
        }
    }

    #[test]
    fn expired_code_keeps_the_session() {
        let h = harness();
        let sid = h.orchestrator.start_login("+8801000000").unwrap();
        h.network.expire_codes(true);
        assert_eq!(
            h.orchestrator.verify_code(&sid, "123456", None),
            Err(LoginError::CodeExpired)
        );
        assert_eq!(h.orchestrator.pending_sessions(), 1);
    }

    #[test]
    fn concurrent_starts_get_distinct_ids() {
        let h = harness();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let orch = Arc::clone(&h.orchestrator);
                std::thread::spawn(move || orch.start_login("+8801000000").unwrap())
            })
            .collect();
        let ids: std::collections::HashSet<String> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(h.orchestrator.pending_sessions(), 8);
    }

    #[test]
    fn expired_sessions_are_swept_and_disconnected() {
        let h = harness_with(
            LoginSettings {
                session_ttl: Duration::from_millis(30),
                ..LoginSettings::default()
            },
            true,
        );
        let sid = h.orchestrator.start_login("+8801000000").unwrap();
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(
            h.orchestrator.verify_code(&sid, "123456", None),
            Err(LoginError::SessionNotFound)
        );
        assert_eq!(h.orchestrator.pending_sessions(), 0);
        assert!(wait_for(|| h.network.disconnects.load(Ordering::SeqCst) == 1));
        assert_eq!(h.orchestrator.sweep_expired(), 0);
    }
}

// ═══════════════════════════════════════════════════════════════════
// 3. Two-factor
// ═══════════════════════════════════════════════════════════════════

mod two_factor {
    use super::*;

    #[test]
    fn password_required_then_authorized_once() {
        let h = harness();
        let orch = &h.orchestrator;
        let sid = orch.start_login("+8801999999").unwrap();

        assert_eq!(
            orch.verify_code(&sid, "654321", None).unwrap(),
            LoginOutcome::PasswordRequired
        );
        assert_eq!(orch.pending_sessions(), 1);
        assert!(orch.get_authenticated_client().is_none());

        assert_eq!(
            orch.verify_code(&sid, "654321", Some("wrong")),
            Err(LoginError::InvalidCredentials)
        );
        assert_eq!(orch.pending_sessions(), 1, "retry with a corrected password");

        assert_eq!(
            orch.verify_code(&sid, "654321", Some("hunter2")).unwrap(),
            LoginOutcome::Authorized {
                identity: "carol".into()
            }
        );
        assert_eq!(
            orch.verify_code(&sid, "654321", Some("hunter2")),
            Err(LoginError::SessionNotFound)
        );
    }

    #[test]
    fn password_in_the_first_call() {
        let h = harness();
        let sid = h.orchestrator.start_login("+8801999999").unwrap();
        assert_eq!(
            h.orchestrator
                .verify_code(&sid, "654321", Some("hunter2"))
                .unwrap(),
            LoginOutcome::Authorized {
                identity: "carol".into()
            }
        );
    }

    #[test]
    fn wrong_password_in_the_first_call_keeps_the_session() {
        let h = harness();
        let orch = &h.orchestrator;
        let sid = orch.start_login("+8801999999").unwrap();

        assert_eq!(
            orch.verify_code(&sid, "654321", Some("wrong")),
            Err(LoginError::InvalidCredentials)
        );
        assert_eq!(orch.pending_sessions(), 1);
        assert!(orch.get_authenticated_client().is_none());

        assert_eq!(
            orch.verify_code(&sid, "654321", Some("hunter2")).unwrap(),
            LoginOutcome::Authorized {
                identity: "carol".into()
            }
        );
        assert_eq!(orch.pending_sessions(), 0);
    }

    #[test]
    fn concurrent_completion_publishes_once() {
        let h = harness();
        let sid = h.orchestrator.start_login("+8801999999").unwrap();
        h.orchestrator.verify_code(&sid, "654321", None).unwrap();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let orch = Arc::clone(&h.orchestrator);
                let sid = sid.clone();
                std::thread::spawn(move || orch.verify_code(&sid, "654321", Some("hunter2")))
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        let authorized = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(authorized, 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| *r == Err(LoginError::SessionNotFound))
        );
    }
}

// ═══════════════════════════════════════════════════════════════════
// 4. Failures and timeouts
// ═══════════════════════════════════════════════════════════════════

mod failures {
    use super::*;

    #[test]
    fn missing_credentials_is_a_configuration_error() {
        let h = harness_with(LoginSettings::default(), false);
        assert!(matches!(
            h.orchestrator.start_login("+8801000000"),
            Err(LoginError::Configuration(_))
        ));
        assert_eq!(h.network.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn connection_failure_stores_nothing() {
        let h = harness();
        h.network.set_offline(true);
        assert!(matches!(
            h.orchestrator.start_login("+8801000000"),
            Err(LoginError::Connection(_))
        ));
        assert_eq!(h.orchestrator.pending_sessions(), 0);
    }

    #[test]
    fn unknown_phone_disconnects_and_stores_nothing() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.start_login("+0000"),
            Err(LoginError::Failed(_))
        ));
        assert_eq!(h.orchestrator.pending_sessions(), 0);
        assert_eq!(h.network.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unclassified_sign_in_error_discards_the_session() {
        let h = harness();
        let orch = &h.orchestrator;
        let sid = orch.start_login("+8801000000").unwrap();
        h.network.remove_account("+8801000000");

        let err = orch.verify_code(&sid, "123456", None).unwrap_err();
        assert!(matches!(err, LoginError::Failed(_)), "{err:?}");
        assert!(!err.retains_session());
        assert_eq!(orch.pending_sessions(), 0);
        assert!(wait_for(|| h.network.disconnects.load(Ordering::SeqCst) == 1));
        assert!(orch.get_authenticated_client().is_none());

        assert_eq!(
            orch.verify_code(&sid, "123456", None),
            Err(LoginError::SessionNotFound)
        );
    }

    #[test]
    fn start_timeout_is_bounded() {
        let h = harness_with(
            LoginSettings {
                start_timeout: Duration::from_millis(100),
                ..LoginSettings::default()
            },
            true,
        );
        h.network.set_latency(Duration::from_millis(400));

        let started = Instant::now();
        assert_eq!(
            h.orchestrator.start_login("+8801000000"),
            Err(LoginError::Timeout(Duration::from_millis(100)))
        );
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(h.orchestrator.pending_sessions(), 0);

        // The abandoned attempt finishes on the loop and is then closed.
        assert!(wait_for(|| h.network.disconnects.load(Ordering::SeqCst) == 1));
        assert_eq!(h.orchestrator.pending_sessions(), 0);
    }

    #[test]
    fn late_sign_in_is_completed_by_the_next_call() {
        let h = harness_with(
            LoginSettings {
                verify_timeout: Duration::from_millis(100),
                ..LoginSettings::default()
            },
            true,
        );
        let sid = h.orchestrator.start_login("+8801000000").unwrap();

        h.network.stall_sign_in(Some(Duration::from_millis(300)));
        assert_eq!(
            h.orchestrator.verify_code(&sid, "123456", None),
            Err(LoginError::Timeout(Duration::from_millis(100)))
        );
        assert!(h.orchestrator.get_authenticated_client().is_none());
        assert_eq!(h.orchestrator.pending_sessions(), 1);

        // Let the late sign-in land, then retry without stalling.
        h.network.stall_sign_in(None);
        assert!(wait_for(|| h.network.is_session_authorized(&format!("web_login_{sid}"))));
        let codes_before = h.network.codes_sent.load(Ordering::SeqCst);
        assert_eq!(
            h.orchestrator.verify_code(&sid, "ignored", None).unwrap(),
            LoginOutcome::Authorized {
                identity: "alice".into()
            }
        );
        assert_eq!(h.network.codes_sent.load(Ordering::SeqCst), codes_before);
    }

    #[test]
    fn failure_messages_are_distinct() {
        let h = harness();
        let sid = h.orchestrator.start_login("+8801000000").unwrap();
        let invalid = h.orchestrator.verify_code(&sid, "1", None).unwrap_err();
        let missing = h.orchestrator.verify_code("nope", "1", None).unwrap_err();
        assert_ne!(invalid.to_string(), missing.to_string());
        assert!(!invalid.to_string().is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════
// 5. Stored credentials
// ═══════════════════════════════════════════════════════════════════

mod stored_credentials {
    use super::*;

    fn creds() -> StoredCredentials {
        StoredCredentials {
            phone: "+8801000000".into(),
            session_name: "bot_session".into(),
            target_chat: Some(-100123),
        }
    }

    #[test]
    fn authorized_session_is_published() {
        let h = harness();
        h.network.authorize_session("bot_session", "+8801000000");
        let identity = h.orchestrator.start_with_stored_credentials(&creds()).unwrap();
        assert_eq!(identity.as_deref(), Some("alice"));
        let client = h.orchestrator.get_authenticated_client().unwrap();
        assert_eq!(client.session_name(), "bot_session");
        assert!(client.is_connected());
    }

    #[test]
    fn unauthorized_session_needs_dashboard_login() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.start_with_stored_credentials(&creds()),
            Err(LoginError::Configuration(_))
        ));
        assert!(h.orchestrator.get_authenticated_client().is_none());
        assert_eq!(h.network.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_configuration_skips() {
        let h = harness_with(LoginSettings::default(), false);
        assert_eq!(
            h.orchestrator.start_with_stored_credentials(&creds()),
            Ok(None)
        );
        let h = harness();
        let empty = StoredCredentials {
            phone: " ".into(),
            ..creds()
        };
        assert_eq!(h.orchestrator.start_with_stored_credentials(&empty), Ok(None));
    }

    #[test]
    fn web_login_replaces_the_startup_client() {
        let h = harness();
        h.network.authorize_session("bot_session", "+8801000000");
        h.orchestrator.start_with_stored_credentials(&creds()).unwrap();
        let startup = h.orchestrator.get_authenticated_client().unwrap();

        let sid = h.orchestrator.start_login("+8801999999").unwrap();
        h.orchestrator
            .verify_code(&sid, "654321", Some("hunter2"))
            .unwrap();
        assert_eq!(h.orchestrator.current_identity(), "carol");
        assert!(wait_for(|| !startup.is_connected()));
    }
}

// ═══════════════════════════════════════════════════════════════════
// 6. Shutdown
// ═══════════════════════════════════════════════════════════════════

#[test]
fn shutdown_disconnects_everything() {
    let h = harness();
    let a = h.orchestrator.start_login("+8801000000").unwrap();
    h.orchestrator.verify_code(&a, "123456", None).unwrap();
    h.orchestrator.start_login("+8801999999").unwrap();

    h.orchestrator.shutdown(Duration::from_secs(5));
    assert_eq!(h.network.disconnects.load(Ordering::SeqCst), 2);
    assert!(h.orchestrator.get_authenticated_client().is_none());
    assert_eq!(h.orchestrator.pending_sessions(), 0);
}
