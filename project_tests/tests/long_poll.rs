use std::sync::Arc;
use std::time::Duration;

use lib_alerts::{AlertDispatcher, ConnectionState, DeliveryError, LongPollChannel, LoopState, PollLoop, SinkEvent};
use project_tests::{Fault, MockServer, collect_alerts, drain_events, eventually};

const WAIT: Duration = Duration::from_secs(5);

async fn poll_loop(server: &MockServer, dir: &std::path::Path) -> (PollLoop<Arc<AlertDispatcher>>, Arc<AlertDispatcher>) {
    let config = server.delivery_config(dir);
    let dispatcher = Arc::new(AlertDispatcher::new());
    let channel = LongPollChannel::from_config(&config).unwrap();
    let delivery = PollLoop::from_config(&config, channel, Arc::clone(&dispatcher)).unwrap();
    (delivery, dispatcher)
}

#[tokio::test]
async fn delivers_in_order_with_identity_and_hint() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.publish("a1", "Disk", "80%");
    server.state.publish("a2", "Disk", "90%");
    server.state.publish("a3", "Disk", "95%");

    assert!(delivery.start().await.unwrap());
    let ids = collect_alerts(&mut rx, 3, WAIT).await;
    assert_eq!(ids, vec!["a1", "a2", "a3"]);

    let client_id = delivery.client_id().unwrap().to_string();
    let requests = server.state.poll_requests();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|(id, hint)| *id == client_id && *hint == Some(1)));

    delivery.stop().await;
    assert_eq!(delivery.state(), LoopState::Stopped);
    assert_eq!(delivery.metrics().snapshot().alerts_delivered, 3);
}

#[tokio::test]
async fn identity_survives_a_new_loop() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let (mut first, _) = poll_loop(&server, dir.path()).await;
    first.start().await.unwrap();
    let first_id = first.client_id().unwrap().to_string();
    first.stop().await;

    let (mut second, _) = poll_loop(&server, dir.path()).await;
    second.start().await.unwrap();
    assert_eq!(second.client_id(), Some(first_id.as_str()));
    second.stop().await;
}

#[tokio::test]
async fn replayed_alert_is_rendered_once() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.publish("a1", "Disk", "80%");
    delivery.start().await.unwrap();
    assert_eq!(collect_alerts(&mut rx, 1, WAIT).await, vec!["a1"]);

    server.state.inject(Fault::ReplayLast);
    server.state.inject(Fault::ReplayLast);
    server.state.publish("a2", "Disk", "90%");

    assert_eq!(collect_alerts(&mut rx, 1, WAIT).await, vec!["a2"]);
    let metrics = delivery.metrics();
    assert!(eventually(WAIT, || metrics.snapshot().duplicates_suppressed == 2).await);
    delivery.stop().await;

    assert_eq!(metrics.snapshot().alerts_delivered, 2);
    assert!(drain_events(&mut rx, Duration::from_millis(50))
        .await
        .iter()
        .all(|e| !matches!(&**e, SinkEvent::Alert(_))));
}

#[tokio::test]
async fn server_error_is_reported_then_recovers() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.inject(Fault::Reply(500, r#"{"error":"database unavailable"}"#.into()));
    server.state.publish("a1", "Disk", "80%");
    delivery.start().await.unwrap();

    assert_eq!(collect_alerts(&mut rx, 1, WAIT).await, vec!["a1"]);
    delivery.stop().await;

    let snapshot = delivery.metrics().snapshot();
    assert_eq!(snapshot.server_errors, 1);
    assert_eq!(snapshot.recoveries, 1);
    assert_eq!(delivery.state(), LoopState::Stopped);
}

#[tokio::test]
async fn malformed_body_does_not_stop_delivery() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.inject(Fault::Reply(200, "<html>gateway</html>".into()));
    server.state.publish("a1", "Disk", "80%");
    delivery.start().await.unwrap();

    assert_eq!(collect_alerts(&mut rx, 1, WAIT).await, vec!["a1"]);
    delivery.stop().await;
    assert_eq!(delivery.metrics().snapshot().protocol_errors, 1);
}

#[tokio::test]
async fn reset_while_running_replays_from_the_start() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.publish("a1", "Disk", "80%");
    server.state.publish("a2", "Disk", "90%");
    delivery.start().await.unwrap();
    assert_eq!(collect_alerts(&mut rx, 2, WAIT).await, vec!["a1", "a2"]);

    delivery.reset().await.unwrap();
    assert_eq!(server.state.resets(), vec![delivery.client_id().unwrap().to_string()]);

    // Cursor and dedup memory were both cleared, so the backlog renders again.
    assert_eq!(collect_alerts(&mut rx, 2, WAIT).await, vec!["a1", "a2"]);
    delivery.stop().await;
}

#[tokio::test]
async fn reset_while_stopped_hits_the_endpoint() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, _) = poll_loop(&server, dir.path()).await;

    delivery.reset().await.unwrap();
    assert_eq!(server.state.resets().len(), 1);
    assert_eq!(delivery.state(), LoopState::Stopped);
}

#[tokio::test]
async fn bad_reset_acknowledgements_keep_dedup_memory() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.publish("a1", "Disk", "80%");
    delivery.start().await.unwrap();
    assert_eq!(collect_alerts(&mut rx, 1, WAIT).await, vec!["a1"]);

    server.state.inject_reset_reply(200, "ok");
    let err = delivery.reset().await.unwrap_err();
    assert!(matches!(err, DeliveryError::Protocol(_)), "{:?}", err);

    server.state.inject_reset_reply(200, "[1, 2]");
    let err = delivery.reset().await.unwrap_err();
    assert!(matches!(err, DeliveryError::Protocol(_)), "{:?}", err);

    server.state.inject_reset_reply(200, r#"{"error":"unknown client"}"#);
    let err = delivery.reset().await.unwrap_err();
    assert!(matches!(err, DeliveryError::Server(ref m) if m == "unknown client"), "{:?}", err);

    // Nothing was rewound, so a replay of a1 is still suppressed.
    assert!(server.state.resets().is_empty());
    server.state.inject(Fault::ReplayLast);
    let metrics = delivery.metrics();
    assert!(eventually(WAIT, || metrics.snapshot().duplicates_suppressed == 1).await);
    delivery.stop().await;
    assert_eq!(metrics.snapshot().alerts_delivered, 1);
}

#[tokio::test]
async fn confirmations_are_posted() {
    let server = MockServer::spawn().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (mut delivery, dispatcher) = poll_loop(&server, dir.path()).await;
    let mut rx = dispatcher.add_subscriber("test");

    server.state.publish_confirmable("a1", "Disk", "80%");
    server.state.publish("a2", "Disk", "90%");
    delivery.start().await.unwrap();
    assert_eq!(collect_alerts(&mut rx, 2, WAIT).await, vec!["a1", "a2"]);
    delivery.stop().await;

    assert_eq!(server.state.confirmations(), vec!["msg_a1"]);
    assert_eq!(delivery.metrics().snapshot().confirmations_sent, 1);
}

#[tokio::test]
async fn unreachable_server_keeps_reconnecting_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::spawn().await.unwrap();
    let mut config = server.delivery_config(dir.path());
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    config.poll_url = format!("http://{}/api/poll/alerts/", addr);

    let dispatcher = Arc::new(AlertDispatcher::new());
    let mut rx = dispatcher.add_subscriber("test");
    let channel = LongPollChannel::from_config(&config).unwrap();
    let mut delivery = PollLoop::from_config(&config, channel, Arc::clone(&dispatcher)).unwrap();
    delivery.start().await.unwrap();

    let events = drain_events(&mut rx, Duration::from_millis(600)).await;
    assert!(events.iter().any(|e| matches!(
        &**e,
        SinkEvent::Status {
            state: ConnectionState::Reconnecting,
            ..
        }
    )));
    // Long polling never gives up.
    assert_eq!(delivery.state(), LoopState::Running);
    assert!(delivery.metrics().snapshot().transport_errors >= 2);

    delivery.stop().await;
    assert_eq!(delivery.state(), LoopState::Stopped);
}
