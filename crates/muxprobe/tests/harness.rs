//! End-to-end sessions against loopback HTTP/2 servers.
//!
//! Sessions are blocking and own their runtime, so these are plain `#[test]`s;
//! the servers run on runtimes of their own.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http::header::{ACCEPT_ENCODING, AUTHORIZATION};
use muxprobe::{
    DEFAULT_PATH, HarnessConfig, HarnessError, NegotiationFailure, Protocol, RequestKind,
    ServerLifecycle, Session, SessionState, StreamFailure, StreamId, StreamResponse, TrustPolicy,
    ViolationKind, run, with_server,
};
use muxprobe_testkit::{
    Behavior, LoopbackServer, Route, ServerDefinition, ServerSettings, TestError, TestServer,
};

fn config_for(server: &LoopbackServer) -> HarnessConfig {
    HarnessConfig::new("127.0.0.1", server.port()).with_response_timeout(Duration::from_secs(5))
}

fn ready_session(config: HarnessConfig) -> Session {
    let mut session = Session::new(config);
    session.connect().unwrap();
    assert_eq!(session.state(), SessionState::HandshakeAwaiting);
    session.await_handshake().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    session
}

fn ids(raw: &[u32]) -> Vec<StreamId> {
    raw.iter().map(|&n| StreamId::new(n).unwrap()).collect()
}

#[test]
fn cleartext_get_end_to_end() {
    let server = LoopbackServer::cleartext(Behavior::InOrder).unwrap();
    let mut session = ready_session(config_for(&server).with_token("abc"));
    assert_eq!(session.protocol(), Some(Protocol::H2c));
    assert!(!session.is_tls());
    assert!(session.peer_settings().is_some());

    let id = session.queue(RequestKind::Get, DEFAULT_PATH).unwrap();
    assert_eq!(id, StreamId::FIRST);
    assert_eq!(session.state(), SessionState::Sending { in_flight: 1 });
    assert_eq!(session.flush().unwrap(), 1);
    assert_eq!(session.await_written().unwrap(), 1);

    let report = session.await_completion().unwrap();
    assert!(report.is_success());
    let response = report.response(id).unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, "GET /pizzashack/1.0.0/menu");

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.has_runtime());

    assert_eq!(server.connections(), 1);
    let recorded = server.requests();
    assert_eq!(recorded.len(), 1);
    let request = &recorded[0];
    assert_eq!(request.stream_id, 3);
    assert_eq!(request.path, DEFAULT_PATH);
    assert_eq!(request.scheme.as_deref(), Some("http"));
    let authority = format!("127.0.0.1:{}", server.port());
    assert_eq!(request.authority.as_deref(), Some(authority.as_str()));
    assert_eq!(request.headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
    let encodings: Vec<_> = request.headers.get_all(ACCEPT_ENCODING).iter().collect();
    assert_eq!(encodings.len(), 2);
}

#[test]
fn identifiers_follow_submission_order_across_batches() {
    let server = LoopbackServer::cleartext(Behavior::InOrder).unwrap();
    let mut session = ready_session(config_for(&server));

    let first: Vec<StreamId> = (0..4)
        .map(|_| session.queue(RequestKind::Get, "/batch").unwrap())
        .collect();
    assert_eq!(first, ids(&[3, 5, 7, 9]));
    let written: Vec<StreamId> = session.requests().iter().map(|r| r.id()).collect();
    assert_eq!(written, first);

    let report = session.await_completion().unwrap();
    assert!(report.is_success());
    assert_eq!(report.resolved(), first);

    let second = session.queue(RequestKind::Options, "/batch").unwrap();
    assert_eq!(second.get(), 11);
    let report = session.await_completion().unwrap();
    assert_eq!(report.response(second).unwrap().body, "OPTIONS /batch");

    let mut wire: Vec<u32> = server.requests().iter().map(|r| r.stream_id).collect();
    wire.sort_unstable();
    assert_eq!(wire, vec![3, 5, 7, 9, 11]);
}

#[test]
fn reversed_responses_are_correlated() {
    let server = LoopbackServer::cleartext(Behavior::Reversed { batch: 3 }).unwrap();
    let mut session = ready_session(config_for(&server));

    let paths = ["/a", "/b", "/c"];
    let assigned: Vec<StreamId> = paths
        .iter()
        .map(|path| session.queue(RequestKind::Get, path).unwrap())
        .collect();
    session.flush().unwrap();

    let report = session.await_completion().unwrap();
    assert!(report.is_success());
    for (id, path) in assigned.iter().zip(paths) {
        assert_eq!(report.response(*id).unwrap().body, format!("GET {path}"));
    }
    assert_eq!(server.answered(), vec![7, 5, 3]);
}

#[test]
fn refused_stream_settles_as_a_reset() {
    let server = LoopbackServer::cleartext(Behavior::Reset {
        path: "/refused".into(),
    })
    .unwrap();
    let mut session = ready_session(config_for(&server));

    let served = session.queue(RequestKind::Get, "/served").unwrap();
    let refused = session.queue(RequestKind::Get, "/refused").unwrap();

    let report = session.await_completion().unwrap();
    assert!(report.is_complete());
    assert!(!report.is_success());
    assert_eq!(report.response(served).unwrap().body, "GET /served");
    assert_eq!(
        report.failures.get(&refused),
        Some(&StreamFailure::Reset(h2::Reason::REFUSED_STREAM))
    );
    assert!(report.violations.is_empty());
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn hangup_during_handshake_is_a_lost_connection() {
    let server = LoopbackServer::cleartext(Behavior::Hangup).unwrap();
    let config = config_for(&server).with_handshake_timeout(Duration::from_secs(5));

    let mut session = Session::new(config);
    session.connect().unwrap();
    let err = session.await_handshake().unwrap_err();
    assert!(
        matches!(err, HarnessError::ConnectionLost { .. }),
        "expected a lost connection, got {err}"
    );
    assert!(err.is_fatal());
    assert!(err.to_string().contains(&format!("127.0.0.1:{}", server.port())));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.has_runtime());
    assert_eq!(server.connections(), 1);
}

#[test]
fn unanswered_stream_is_reported_on_timeout() {
    let server = LoopbackServer::cleartext(Behavior::Ignore {
        path: "/slow".into(),
    })
    .unwrap();
    let config = config_for(&server).with_response_timeout(Duration::from_millis(500));
    let mut session = ready_session(config);

    let fast = session.queue(RequestKind::Get, "/fast").unwrap();
    let slow = session.queue(RequestKind::Get, "/slow").unwrap();
    let other = session.queue(RequestKind::Head, "/other").unwrap();
    session.flush().unwrap();

    let err = session.await_completion().unwrap_err();
    assert!(!err.is_fatal());
    let HarnessError::ResponseTimeout { report, .. } = &err else {
        panic!("expected a response timeout, got {err}");
    };
    assert_eq!(report.unresolved, vec![slow]);
    assert_eq!(report.resolved(), vec![fast, other]);
    assert!(report.response(other).unwrap().body.is_empty());
    assert!(err.to_string().contains("1 of 3 streams unresolved"));

    // The timeout is not fatal: the session is usable until closed.
    assert_eq!(session.state(), SessionState::Ready);
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn delivery_for_unknown_stream_is_a_violation() {
    let server = LoopbackServer::cleartext(Behavior::InOrder).unwrap();
    let mut session = ready_session(config_for(&server));

    let a = session.queue(RequestKind::Get, "/a").unwrap();
    let b = session.queue(RequestKind::Get, "/b").unwrap();

    let stray = StreamId::new(99).unwrap();
    let violation = session
        .correlator()
        .deliver(
            stray,
            Ok(StreamResponse {
                status: StatusCode::OK,
                headers: Default::default(),
                body: Bytes::from_static(b"stray"),
                trailers: None,
            }),
        )
        .unwrap_err();
    assert_eq!(violation.kind, ViolationKind::UnknownStream);

    let report = session.await_completion().unwrap();
    assert!(report.is_complete());
    assert!(!report.is_success());
    assert_eq!(report.resolved(), vec![a, b]);
    assert_eq!(report.violations, vec![violation]);
}

#[test]
fn post_carries_its_body() {
    let server = LoopbackServer::cleartext(Behavior::InOrder).unwrap();
    let config = config_for(&server)
        .with_request(RequestKind::Post {
            body: Bytes::from_static(b"test data!"),
        })
        .with_path("/submit")
        .with_count(2);

    let report = run(&config).unwrap();
    assert!(report.is_success());
    assert_eq!(report.len(), 2);

    let recorded = server.wait_for_requests(2, Duration::from_secs(1));
    assert_eq!(recorded.len(), 2);
    for request in recorded {
        assert_eq!(request.method, http::Method::POST);
        assert_eq!(request.body, "test data!");
    }
}

#[test]
fn trailers_are_collected() {
    let definition = ServerDefinition::new(Behavior::InOrder)
        .with_route(Route::new("/menu").with_body("[]").with_trailer("x-checksum", "42"));
    let server = LoopbackServer::start(definition, ServerSettings::default()).unwrap();

    let report = run(&config_for(&server).with_path("/menu")).unwrap();
    let response = report.response(StreamId::FIRST).unwrap();
    assert_eq!(response.body, "[]");
    let trailers = response.trailers.as_ref().unwrap();
    assert_eq!(trailers.get("x-checksum").unwrap(), "42");
}

#[test]
fn refused_connection_is_fatal() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = run(&HarnessConfig::new("127.0.0.1", port)).unwrap_err();
    assert!(matches!(err, HarnessError::Connection { .. }));
    assert!(err.is_fatal());
}

#[test]
fn silent_peer_times_out_the_handshake() {
    let server = LoopbackServer::cleartext(Behavior::Silent).unwrap();
    let config = config_for(&server).with_handshake_timeout(Duration::from_millis(300));

    let mut session = Session::new(config);
    session.connect().unwrap();
    let err = session.await_handshake().unwrap_err();
    assert!(matches!(err, HarnessError::HandshakeTimeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.has_runtime());
    assert!(matches!(
        session.queue(RequestKind::Get, "/"),
        Err(HarnessError::InvalidState { .. })
    ));
}

#[test]
fn tls_with_permissive_trust() {
    let server = LoopbackServer::start(ServerDefinition::default(), ServerSettings::tls()).unwrap();
    let config = config_for(&server)
        .with_tls(TrustPolicy::AcceptAny)
        .with_count(3);

    let mut session = ready_session(config);
    assert_eq!(session.protocol(), Some(Protocol::H2));
    for _ in 0..3 {
        session.queue(RequestKind::Get, DEFAULT_PATH).unwrap();
    }
    let report = session.await_completion().unwrap();
    assert!(report.is_success());
    assert_eq!(report.len(), 3);
    drop(session);

    let recorded = server.requests();
    assert!(recorded.iter().all(|r| r.scheme.as_deref() == Some("https")));
}

#[test]
fn tls_with_pinned_certificate() {
    let server = LoopbackServer::start(ServerDefinition::default(), ServerSettings::tls()).unwrap();
    let certificate = server.certificate().unwrap().clone();
    let config = config_for(&server)
        .with_tls(TrustPolicy::Certificates(vec![certificate]))
        .with_server_name("localhost");

    let report = run(&config).unwrap();
    assert!(report.is_success());
}

#[test]
fn tls_rejects_untrusted_certificate_by_default() {
    let server = LoopbackServer::start(ServerDefinition::default(), ServerSettings::tls()).unwrap();
    let config = config_for(&server)
        .with_tls(TrustPolicy::default())
        .with_server_name("localhost");

    let err = run(&config).unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Negotiation {
            reason: NegotiationFailure::Tls(_),
            ..
        }
    ));
}

#[test]
fn http11_alpn_selection_is_rejected() {
    let settings = ServerSettings::tls().with_alpn(&["http/1.1"]);
    let server = LoopbackServer::start(ServerDefinition::default(), settings).unwrap();
    let config = config_for(&server).with_tls(TrustPolicy::AcceptAny);

    let err = run(&config).unwrap_err();
    match err {
        HarnessError::Negotiation {
            reason: NegotiationFailure::Alpn { selected },
            ..
        } => assert_eq!(selected.as_deref(), Some("http/1.1")),
        other => panic!("expected ALPN rejection, got {other}"),
    }
}

fn fixture(name: &str, contents: &serde_json::Value) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("muxprobe-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents.to_string()).unwrap();
    path
}

#[test]
fn server_lifecycle_from_definition_files() {
    let definition = fixture(
        "definition.json",
        &serde_json::json!({
            "behavior": { "kind": "in_order" },
            "routes": [{ "path": "/pizzashack/1.0.0/menu", "body": "[\"margherita\"]" }]
        }),
    );
    let settings = fixture("settings.json", &serde_json::json!({ "bind": "127.0.0.1:0" }));

    let mut server = TestServer::new();
    assert!(!server.is_running());

    let report = with_server(&mut server, &definition, Some(settings.as_path()), |server| {
        assert!(server.is_running());
        let port = server.server().unwrap().port();
        run(&HarnessConfig::new("127.0.0.1", port)).unwrap()
    })
    .unwrap();

    assert!(!server.is_running());
    assert_eq!(
        report.response(StreamId::FIRST).unwrap().body,
        "[\"margherita\"]"
    );
    assert!(matches!(server.stop(true), Err(TestError::NotRunning)));
}

#[test]
fn missing_definition_file_fails_to_start() {
    let mut server = TestServer::new();
    let err = server
        .start(&PathBuf::from("/nonexistent/muxprobe/definition.json"), None)
        .unwrap_err();
    assert!(matches!(err, TestError::Io(_)));
    assert!(!server.is_running());
}
