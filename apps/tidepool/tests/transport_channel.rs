mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tidepool::config::TransportTuning;
use tidepool::protocol::{CandidatePayload, Envelope, IceCandidate, LinkKind, Signal};
use tidepool::transport::{Endpoints, SignalSink, SignalingTransport, TransportEvent};

use support::{FakeOptions, FakeServer, init_tracing, wait_for};

fn candidate(dst: &str, n: u16) -> Envelope {
    Envelope::to(
        dst,
        Signal::Candidate(CandidatePayload {
            connection_id: format!("dc_{n}"),
            kind: LinkKind::Data,
            candidate: IceCandidate {
                candidate: format!("candidate:{n}"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }),
    )
}

fn transport(
    server: &FakeServer,
    tuning: TransportTuning,
) -> (Arc<SignalingTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
    let endpoints = Endpoints::from_options(&server.peer_options()).expect("endpoints");
    SignalingTransport::new(endpoints, tuning).expect("transport")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("transport event in time")
        .expect("transport event stream open")
}

async fn next_signal(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Envelope {
    match next_event(events).await {
        TransportEvent::Message(envelope) => envelope,
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn sends_before_start_go_out_in_order() {
    init_tracing();
    let server = FakeServer::start(FakeOptions {
        socket: false,
        ..FakeOptions::default()
    })
    .await;
    let (transport, _events) = transport(&server, TransportTuning::default());

    for n in 0..3 {
        transport.send(candidate("bob", n));
    }
    assert_eq!(transport.queued_len(), 3);
    assert!(server.hub.posts().is_empty());

    transport.start("alice");
    assert!(transport.is_started());
    assert_eq!(transport.queued_len(), 0);

    wait_for("three posts", || server.hub.posts().len() == 3).await;
    let order: Vec<String> = server
        .hub
        .posts()
        .iter()
        .map(|post| post["payload"]["connectionId"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(order, vec!["dc_0", "dc_1", "dc_2"]);
    assert!(server.hub.posts().iter().all(|post| post["type"] == "CANDIDATE"));
}

#[tokio::test]
async fn stream_delivers_lines_after_the_preamble() {
    init_tracing();
    let server = FakeServer::start(FakeOptions {
        socket: false,
        ..FakeOptions::default()
    })
    .await;
    let (transport, mut events) = transport(&server, TransportTuning::default());
    transport.start("alice");

    assert_eq!(next_signal(&mut events).await.signal, Signal::Open);

    server.hub.push("alice", json!({ "type": "BOGUS" }));
    server.hub.push("alice", json!({ "type": "LEAVE", "src": "bob" }));
    let leave = next_signal(&mut events).await;
    assert_eq!(leave.signal, Signal::Leave);
    assert_eq!(leave.src.as_deref(), Some("bob"));
    assert!(!transport.is_socket_open());
}

#[tokio::test]
async fn watchdog_restarts_stream_without_losing_messages() {
    init_tracing();
    let server = FakeServer::start(FakeOptions {
        socket: false,
        ..FakeOptions::default()
    })
    .await;
    let tuning = TransportTuning {
        stream_watchdog: Duration::from_millis(400),
        ..TransportTuning::default()
    };
    let (transport, mut events) = transport(&server, tuning);
    transport.start("alice");
    assert_eq!(next_signal(&mut events).await.signal, Signal::Open);

    server.hub.push("alice", json!({ "type": "LEAVE", "src": "early" }));
    assert_eq!(next_signal(&mut events).await.src.as_deref(), Some("early"));

    wait_for("second stream request", || {
        server.hub.stream_requests().iter().any(|(_, index)| *index >= 1)
    })
    .await;
    server.hub.push("alice", json!({ "type": "LEAVE", "src": "late" }));
    assert_eq!(next_signal(&mut events).await.src.as_deref(), Some("late"));

    let indices: Vec<u32> = server
        .hub
        .stream_requests()
        .into_iter()
        .map(|(_, index)| index)
        .collect();
    assert_eq!(indices[0], 0);
    assert!(indices.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert!(transport.stream_index().unwrap_or_default() >= 1);
}

#[tokio::test]
async fn socket_takes_over_outbound_once_open() {
    init_tracing();
    let server = FakeServer::start(FakeOptions::default()).await;
    let (transport, mut events) = transport(&server, TransportTuning::default());
    transport.start("alice");
    assert_eq!(next_signal(&mut events).await.signal, Signal::Open);

    wait_for("socket open", || transport.is_socket_open()).await;
    wait_for("server socket", || server.hub.has_socket("alice")).await;
    transport.send(candidate("bob", 7));

    wait_for("socket frame", || server.hub.socket_frames().len() == 1).await;
    assert_eq!(server.hub.socket_frames()[0]["dst"], "bob");
    assert!(server.hub.posts().is_empty());
}

#[tokio::test]
async fn stream_is_torn_down_after_socket_grace() {
    init_tracing();
    let server = FakeServer::start(FakeOptions::default()).await;
    let tuning = TransportTuning {
        socket_grace: Duration::from_secs(1),
        ..TransportTuning::default()
    };
    let (transport, mut events) = transport(&server, tuning);
    transport.start("alice");
    assert_eq!(next_signal(&mut events).await.signal, Signal::Open);

    wait_for("socket open", || transport.is_socket_open()).await;
    assert_eq!(transport.stream_index(), Some(0));

    wait_for("stream retired", || transport.stream_index().is_none()).await;
    assert!(transport.is_socket_open());
    assert_eq!(server.hub.stream_requests().len(), 1);

    wait_for("server socket", || server.hub.has_socket("alice")).await;
    assert!(server.hub.push("alice", json!({ "type": "LEAVE", "src": "bob" })));
    assert_eq!(next_signal(&mut events).await.src.as_deref(), Some("bob"));
}

#[tokio::test]
async fn server_dropping_socket_is_reported() {
    init_tracing();
    let server = FakeServer::start(FakeOptions::default()).await;
    let (transport, mut events) = transport(&server, TransportTuning::default());
    transport.start("alice");
    wait_for("socket open", || transport.is_socket_open()).await;
    wait_for("server socket", || server.hub.has_socket("alice")).await;

    server.hub.drop_socket("alice");

    loop {
        match next_event(&mut events).await {
            TransportEvent::Closed { explicit } => {
                assert!(!explicit);
                break;
            }
            TransportEvent::Message(_) => continue,
            TransportEvent::Error(err) => panic!("unexpected transport error: {err}"),
        }
    }
    assert!(!transport.is_socket_open());
}

#[tokio::test]
async fn close_twice_reports_once() {
    init_tracing();
    let server = FakeServer::start(FakeOptions::default()).await;
    let (transport, mut events) = transport(&server, TransportTuning::default());
    transport.start("alice");
    assert_eq!(next_signal(&mut events).await.signal, Signal::Open);

    transport.close();
    transport.close();
    assert!(transport.is_closed());
    transport.send(candidate("bob", 1));
    assert_eq!(transport.queued_len(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut closes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::Closed { explicit } => {
                assert!(explicit);
                closes += 1;
            }
            TransportEvent::Message(_) => {}
            TransportEvent::Error(err) => panic!("unexpected transport error: {err}"),
        }
    }
    assert_eq!(closes, 1);
}
