use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;

use crate::connection::connection::{Connection, INBOX_PREFIX};
use crate::connection::connection_config::ConnectionOptions;
use crate::connection::connection_events::ConnectionEvent;
use crate::connection::connection_state::ConnectionState;
use crate::error::NatsError;
use crate::message::Message;
use crate::subscription::message_handler::MessageHandler;
use crate::test_util::event::TrackingEventHandler;
use crate::test_util::mock_server::{wait_until, InMemoryTransport, MockAuth, MockServer};

const TIMEOUT: Duration = Duration::from_secs(5);

fn options(servers: &[&Arc<MockServer>]) -> ConnectionOptions {
    let mut options = ConnectionOptions::new(servers.iter().map(|s| s.url()).collect());
    options.randomize = false;
    options.connect_timeout = Duration::from_millis(300);
    options.reconnect_wait = Duration::from_millis(20);
    options
}

async fn connect(mut options: ConnectionOptions, servers: &[&Arc<MockServer>]) -> (Connection, Arc<TrackingEventHandler>) {
    let tracker = Arc::new(TrackingEventHandler::default());
    options.add_event_handler(tracker.clone());
    let transport = Arc::new(InMemoryTransport::new(servers.iter().map(|s| (*s).clone()).collect()));
    let conn = Connection::connect_with_transport(options, transport).await.unwrap();
    (conn, tracker)
}

async fn wait_for_state(conn: &Connection, state: ConnectionState) {
    let mut changes = conn.state_changes();
    tokio::time::timeout(TIMEOUT, changes.wait_for(|s| *s == state)).await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_publish_subscribe() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.connected_url(), Some(server.url()));

    let sub = conn.subscribe("foo").unwrap();
    conn.publish("foo", None, b"hello").unwrap();
    conn.publish("foo", Some("bar"), b"world").unwrap();

    let msg = sub.next_message(TIMEOUT).await.unwrap();
    assert_eq!(msg.subject(), "foo");
    assert_eq!(&msg.payload()[..], b"hello");
    assert_eq!(msg.reply_to(), None);
    assert_eq!(msg.sid(), Some(sub.sid()));

    let msg = sub.next_message(TIMEOUT).await.unwrap();
    assert_eq!(&msg.payload()[..], b"world");
    assert_eq!(msg.reply_to(), Some("bar"));

    let stats = conn.stats();
    assert_eq!(stats.out_msgs, 2);
    assert_eq!(stats.out_bytes, 10);
    assert_eq!(stats.in_msgs, 2);
    assert_eq!(stats.in_bytes, 10);
    assert_eq!(stats.reconnects, 0);
}

#[tokio::test]
async fn test_verbose_server() {
    let server = Arc::new(MockServer::new("a:4222").with_verbose());
    let mut options = options(&[&server]);
    options.verbose = true;
    let (conn, _) = connect(options, &[&server]).await;

    let sub = conn.subscribe("foo").unwrap();
    conn.publish("foo", None, b"x").unwrap();
    assert_eq!(&sub.next_message(TIMEOUT).await.unwrap().payload()[..], b"x");
}

#[tokio::test]
async fn test_flush() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    conn.publish("foo", None, b"data").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    let received = server.received_lines();
    assert!(received.iter().any(|l| l == "PUB foo 4"));
    assert_eq!(received.last().map(|s| s.as_str()), Some("PING"));
}

#[tokio::test]
async fn test_flush_timeout() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    server.set_answer_pings(false);
    assert!(matches!(conn.flush(Duration::from_millis(50)).await, Err(NatsError::Timeout)));
}

#[tokio::test]
async fn test_request_reply() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;
    let conn = Arc::new(conn);

    let responder = conn.subscribe("help").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    let replier = conn.clone();
    tokio::spawn(async move {
        let request = responder.next_message(TIMEOUT).await.unwrap();
        assert_eq!(&request.payload()[..], b"please");
        replier.publish(request.reply_to().unwrap(), None, b"here you go").unwrap();
    });

    let reply = conn.request("help", b"please", TIMEOUT).await.unwrap();
    assert_eq!(&reply.payload()[..], b"here you go");
    assert!(reply.subject().starts_with(INBOX_PREFIX));

    // the inbox subscription ended with the reply
    assert!(reply.subscription().is_none());
    assert_eq!(server.num_subscriptions(), 1);
}

#[tokio::test]
async fn test_request_timeout() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let result = conn.request("nobody.listens", b"hello?", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(NatsError::Timeout)));
}

#[tokio::test]
async fn test_queue_group() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let worker_1 = conn.queue_subscribe("jobs", "workers").unwrap();
    let worker_2 = conn.queue_subscribe("jobs", "workers").unwrap();
    for _ in 0..10 {
        conn.publish("jobs", None, b"job").unwrap();
    }
    conn.flush(TIMEOUT).await.unwrap();

    let pending = worker_1.stats().unwrap().pending_msgs + worker_2.stats().unwrap().pending_msgs;
    assert_eq!(pending, 10);
    assert!(server.received_lines().iter().any(|l| l == "SUB jobs workers 1"));
}

#[tokio::test]
async fn test_unsubscribe() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let sub = conn.subscribe("foo").unwrap();
    conn.flush(TIMEOUT).await.unwrap();
    assert_eq!(server.num_subscriptions(), 1);

    sub.unsubscribe().unwrap();
    conn.flush(TIMEOUT).await.unwrap();
    assert_eq!(server.num_subscriptions(), 0);
    assert!(!sub.is_valid());
    assert!(matches!(sub.unsubscribe(), Err(NatsError::BadSubscription)));
}

#[tokio::test]
async fn test_auto_unsubscribe() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let sub = conn.subscribe("foo").unwrap();
    sub.auto_unsubscribe(2).unwrap();
    for _ in 0..5 {
        conn.publish("foo", None, b"x").unwrap();
    }
    conn.flush(TIMEOUT).await.unwrap();

    sub.next_message(TIMEOUT).await.unwrap();
    sub.next_message(TIMEOUT).await.unwrap();
    assert!(!sub.is_valid());
    assert!(matches!(sub.next_message(TIMEOUT).await, Err(NatsError::BadSubscription)));
    assert_eq!(server.num_subscriptions(), 0);
}

#[tokio::test]
async fn test_async_subscription() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let received = received.clone();
        Arc::new(move |msg: Message| {
            received.lock().push(String::from_utf8_lossy(msg.payload()).to_string());
        }) as Arc<dyn MessageHandler>
    };
    let sub = conn.subscribe_with_handler("foo", None, handler).unwrap();
    assert!(matches!(sub.next_message(TIMEOUT).await, Err(NatsError::AsyncSubscription)));

    for i in 0..3 {
        conn.publish("foo", None, format!("msg-{}", i).as_bytes()).unwrap();
    }
    wait_until(TIMEOUT, || received.lock().len() == 3).await.unwrap();
    assert_eq!(*received.lock(), vec!["msg-0", "msg-1", "msg-2"]);
}

#[tokio::test]
async fn test_slow_consumer() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;

    let sub = conn.subscribe_with_limits("foo", None, 2, 1024).unwrap();
    for _ in 0..5 {
        conn.publish("foo", None, b"x").unwrap();
    }
    conn.flush(TIMEOUT).await.unwrap();

    let stats = sub.stats().unwrap();
    assert_eq!(stats.pending_msgs, 2);
    assert_eq!(stats.dropped, 3);
    assert!(stats.slow_consumer);

    // Closed is the last event, so everything before it was dispatched
    conn.close().await;
    tracker.wait_for_closed(TIMEOUT).await.unwrap();
    let slow_consumer_events = tracker.async_errors().iter()
        .filter(|e| matches!(e, NatsError::SlowConsumer { sid } if *sid == sub.sid()))
        .count();
    assert_eq!(slow_consumer_events, 1);
}

#[tokio::test]
async fn test_slow_consumer_does_not_affect_other_subscriptions() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    let slow = conn.subscribe_with_limits("foo", None, 1, 1024).unwrap();
    let regular = conn.subscribe("foo").unwrap();
    for i in 0..5 {
        conn.publish("foo", None, format!("msg-{}", i).as_bytes()).unwrap();
    }
    conn.flush(TIMEOUT).await.unwrap();

    for i in 0..5 {
        let msg = regular.next_message(TIMEOUT).await.unwrap();
        assert_eq!(&msg.payload()[..], format!("msg-{}", i).as_bytes());
    }
    let regular_stats = regular.stats().unwrap();
    assert_eq!(regular_stats.dropped, 0);
    assert!(!regular_stats.slow_consumer);

    let slow_stats = slow.stats().unwrap();
    assert_eq!(slow_stats.dropped, 4);
    assert!(slow_stats.slow_consumer);
    assert_eq!(&slow.next_message(TIMEOUT).await.unwrap().payload()[..], b"msg-0");
}

#[tokio::test]
async fn test_max_payload() {
    let server = Arc::new(MockServer::new("a:4222").with_max_payload(16));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;
    assert_eq!(conn.max_payload(), 16);

    conn.publish("foo", None, &[0u8; 16]).unwrap();
    assert!(matches!(conn.publish("foo", None, &[0u8; 17]), Err(NatsError::MaxPayload { max: 16 })));
}

#[tokio::test]
async fn test_invalid_subjects() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;

    assert!(matches!(conn.publish("", None, b"x"), Err(NatsError::InvalidSubject)));
    assert!(matches!(conn.publish("foo bar", None, b"x"), Err(NatsError::InvalidSubject)));
    assert!(matches!(conn.subscribe(""), Err(NatsError::InvalidSubject)));
}

#[tokio::test]
async fn test_operations_on_closed_connection() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;
    let sub = conn.subscribe("foo").unwrap();

    conn.close().await;
    conn.close().await;
    assert!(conn.is_closed());
    assert_eq!(conn.connected_url(), None);

    assert!(matches!(conn.publish("foo", None, b"x"), Err(NatsError::ConnectionClosed)));
    assert!(matches!(conn.subscribe("foo"), Err(NatsError::ConnectionClosed)));
    assert!(matches!(conn.flush(TIMEOUT).await, Err(NatsError::ConnectionClosed)));
    assert!(!sub.is_valid());
    assert!(matches!(sub.next_message(TIMEOUT).await, Err(NatsError::BadSubscription)));

    tracker.wait_for_closed(TIMEOUT).await.unwrap();
    assert_eq!(tracker.closes(), 1);
    wait_until(TIMEOUT, || server.num_clients() == 0).await.unwrap();
}

#[tokio::test]
async fn test_initial_connect_tries_next_server() {
    let a = Arc::new(MockServer::new("a:4222"));
    let b = Arc::new(MockServer::new("b:4222"));
    a.set_reachable(false);

    let (conn, tracker) = connect(options(&[&a, &b]), &[&a, &b]).await;
    assert_eq!(conn.connected_url(), Some(b.url()));
    assert!(tracker.events().is_empty());
}

#[tokio::test]
async fn test_initial_connect_fails() {
    let a = Arc::new(MockServer::new("a:4222"));
    a.set_reachable(false);
    let transport = Arc::new(InMemoryTransport::new(vec![a.clone()]));

    let result = Connection::connect_with_transport(options(&[&a]), transport.clone()).await;
    assert!(matches!(result, Err(NatsError::Connect(_))));
    assert_eq!(transport.num_opens(), 1);
}

#[tokio::test]
async fn test_initial_auth_failure() {
    let server = Arc::new(MockServer::new("a:4222").with_auth(MockAuth::Token("secret".to_string())));
    let tracker = Arc::new(TrackingEventHandler::default());
    let mut options = options(&[&server]);
    options.add_event_handler(tracker.clone());

    let transport = Arc::new(InMemoryTransport::new(vec![server.clone()]));
    let err = Connection::connect_with_transport(options, transport).await.err().unwrap();
    assert!(err.is_authorization());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tracker.disconnects(), 0);
    assert_eq!(server.num_connects(), 0);
}

#[tokio::test]
async fn test_credentials_from_url() {
    let server = Arc::new(MockServer::new("a:4222").with_auth(MockAuth::UserPass("derek".to_string(), "foo".to_string())));
    let mut options = options(&[&server]);
    options.servers = vec!["nats://derek:foo@a:4222".to_string()];

    let (conn, _) = connect(options, &[&server]).await;
    assert_eq!(server.num_connects(), 1);
    assert_eq!(conn.connected_url(), Some("nats://a:4222".to_string()));
}

/// A dies, B rejects the credentials, C accepts: the connection ends up at C after a single
///  reconnect, and the subscription is carried over
#[tokio::test]
async fn test_failover_skips_unauthorized_server() {
    let a = Arc::new(MockServer::new("a:4222"));
    let b = Arc::new(MockServer::new("b:4222").with_auth(MockAuth::UserPass("derek".to_string(), "foo".to_string())));
    let c = Arc::new(MockServer::new("c:4222"));

    let (conn, tracker) = connect(options(&[&a, &b, &c]), &[&a, &b, &c]).await;
    assert_eq!(conn.connected_url(), Some(a.url()));
    let sub = conn.subscribe("foo").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    a.shutdown();
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();

    assert_eq!(conn.connected_url(), Some(c.url()));
    assert_eq!(tracker.disconnects(), 1);
    assert_eq!(tracker.reconnected_urls(), vec![c.url()]);
    assert_eq!(b.num_connects(), 0);
    assert!(b.received_lines().iter().any(|l| l.starts_with("CONNECT")));
    assert_eq!(conn.stats().reconnects, 1);

    conn.publish("foo", None, b"after failover").unwrap();
    assert_eq!(&sub.next_message(TIMEOUT).await.unwrap().payload()[..], b"after failover");
}

#[tokio::test]
async fn test_subscriptions_replayed_after_reconnect() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;

    let plain = conn.subscribe("foo").unwrap();
    let limited = conn.subscribe("bar").unwrap();
    limited.auto_unsubscribe(3).unwrap();
    conn.publish("bar", None, b"1").unwrap();
    limited.next_message(TIMEOUT).await.unwrap();

    server.kill_connections();
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    assert_eq!(server.num_subscriptions(), 2);
    let received = server.received_lines();
    assert_eq!(received.iter().filter(|l| *l == "SUB foo 1").count(), 2);
    assert!(received.iter().any(|l| l == "UNSUB 2 2"));

    conn.publish("foo", None, b"again").unwrap();
    assert_eq!(&plain.next_message(TIMEOUT).await.unwrap().payload()[..], b"again");
}

#[tokio::test]
async fn test_publish_buffered_while_reconnecting() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.max_reconnect_attempts = None;
    options.reconnect_buffer_size = 64;
    let (conn, tracker) = connect(options, &[&server]).await;

    let sub = conn.subscribe("foo").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    server.shutdown();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;
    assert!(conn.is_reconnecting());
    assert_eq!(conn.connected_url(), None);

    conn.publish("foo", None, b"buffered").unwrap();
    let too_big = conn.publish("foo", None, &[0u8; 100]);
    assert!(matches!(too_big, Err(NatsError::ResourceExhausted { limit: 64 })));

    server.set_reachable(true);
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    assert_eq!(&sub.next_message(TIMEOUT).await.unwrap().payload()[..], b"buffered");
}

#[tokio::test]
async fn test_flush_while_reconnecting_respects_buffer_limit() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.max_reconnect_attempts = None;
    options.reconnect_buffer_size = 64;
    let (conn, tracker) = connect(options, &[&server]).await;
    let sub = conn.subscribe("foo").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    server.shutdown();
    wait_for_state(&conn, ConnectionState::Reconnecting).await;

    conn.publish("foo", None, b"buffered").unwrap();
    let mut num_buffered_flushes = 0;
    loop {
        match conn.flush(Duration::from_millis(1)).await {
            Err(NatsError::Timeout) => num_buffered_flushes += 1,
            Err(NatsError::ResourceExhausted { limit: 64 }) => break,
            other => panic!("unexpected {:?}", other),
        }
        assert!(num_buffered_flushes <= 64 / 6);
    }
    assert!(num_buffered_flushes > 0);

    server.set_reachable(true);
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    assert_eq!(&sub.next_message(TIMEOUT).await.unwrap().payload()[..], b"buffered");
    conn.flush(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_flush_fails_on_disconnect() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.max_reconnect_attempts = None;
    let (conn, _) = connect(options, &[&server]).await;
    let conn = Arc::new(conn);

    server.set_answer_pings(false);
    let flusher = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.flush(TIMEOUT).await })
    };
    // one PING from the handshake, one from the flush
    wait_until(TIMEOUT, || server.received_lines().iter().filter(|l| *l == "PING").count() == 2).await.unwrap();

    server.kill_connections();
    assert!(matches!(flusher.await.unwrap(), Err(NatsError::Disconnected)));
}

#[tokio::test]
async fn test_stale_connection() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.ping_interval = Duration::from_millis(30);
    options.max_pings_out = 2;
    options.max_reconnect_attempts = None;
    let (conn, tracker) = connect(options, &[&server]).await;

    server.set_answer_pings(false);
    tracker.wait_until(TIMEOUT, |events| events.iter().any(|e| matches!(e, ConnectionEvent::Disconnected(_)))).await.unwrap();

    let stale = tracker.events().into_iter().any(|e| matches!(e, ConnectionEvent::Disconnected(data) if matches!(data.error, Some(NatsError::StaleConnection))));
    assert!(stale);

    server.set_answer_pings(true);
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_pongs_keep_connection_alive() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.ping_interval = Duration::from_millis(20);
    options.max_pings_out = 2;
    let (conn, tracker) = connect(options, &[&server]).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(tracker.disconnects(), 0);
    assert!(server.received_lines().iter().filter(|l| *l == "PING").count() >= 2);
}

#[tokio::test]
async fn test_reconnect_budget_exhausted() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.max_reconnect_attempts = Some(2);
    options.reconnect_wait = Duration::from_millis(10);
    let transport = Arc::new(InMemoryTransport::new(vec![server.clone()]));
    let tracker = Arc::new(TrackingEventHandler::default());
    options.add_event_handler(tracker.clone());
    let conn = Connection::connect_with_transport(options, transport.clone()).await.unwrap();

    let sub = conn.subscribe("foo").unwrap();
    server.shutdown();
    tracker.wait_for_closed(TIMEOUT).await.unwrap();

    assert!(conn.is_closed());
    assert!(matches!(conn.last_error(), Some(NatsError::NoServers)));
    assert!(!sub.is_valid());
    assert_eq!(tracker.disconnects(), 1);
    assert_eq!(tracker.closes(), 1);
    assert!(tracker.reconnected_urls().is_empty());
    // the initial connect plus two reconnect attempts
    assert_eq!(transport.num_opens(), 3);
}

#[tokio::test]
async fn test_no_reconnect() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.allow_reconnect = false;
    let (conn, tracker) = connect(options, &[&server]).await;

    server.kill_connections();
    tracker.wait_for_closed(TIMEOUT).await.unwrap();
    assert!(conn.is_closed());
    assert_eq!(tracker.disconnects(), 1);
    assert!(matches!(conn.last_error(), Some(NatsError::Disconnected)));
}

#[tokio::test]
async fn test_authorization_error_forces_reconnect() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;

    server.send_raw(b"-ERR 'Authorization Violation'\r\n");
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    let events = tracker.events();
    assert!(matches!(&events[0], ConnectionEvent::Disconnected(data) if matches!(data.error, Some(NatsError::Authorization(_)))));
}

#[tokio::test]
async fn test_server_error_reported_asynchronously() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;

    server.send_raw(b"-ERR 'Unknown Protocol Operation'\r\n");
    tracker.wait_until(TIMEOUT, |events| events.iter().any(|e| matches!(e, ConnectionEvent::AsyncError(_)))).await.unwrap();

    assert!(matches!(tracker.async_errors()[0], NatsError::Server(_)));
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(tracker.disconnects(), 0);
    assert!(matches!(conn.last_error(), Some(NatsError::Server(_))));
}

#[rstest]
#[case::unknown_op(b"GARBAGE\r\n")]
#[case::size_overflow(b"MSG foo 1 18446744073709551615\r\nabc\r\n")]
#[case::size_above_max_payload(b"MSG foo 1 4000000000\r\n")]
#[tokio::test]
async fn test_protocol_error_forces_reconnect(#[case] data: &'static [u8]) {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;

    server.send_raw(data);
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(matches!(&tracker.events()[0], ConnectionEvent::Disconnected(data) if matches!(data.error, Some(NatsError::Protocol(_)))));
}

#[tokio::test]
async fn test_max_payload_updated_by_info() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;
    let sub = conn.subscribe("foo").unwrap();
    conn.flush(TIMEOUT).await.unwrap();

    server.send_raw(b"INFO {\"server_id\":\"a\",\"max_payload\":4}\r\n");
    wait_until(TIMEOUT, || conn.max_payload() == 4).await.unwrap();

    server.send_raw(b"MSG foo 1 4\r\nabcd\r\n");
    assert_eq!(&sub.next_message(TIMEOUT).await.unwrap().payload()[..], b"abcd");
    assert_eq!(tracker.disconnects(), 0);

    server.send_raw(b"MSG foo 1 5\r\nabcde\r\n");
    tracker.wait_until(TIMEOUT, |events| events.iter().any(|e| matches!(e, ConnectionEvent::Disconnected(_)))).await.unwrap();
}

#[tokio::test]
async fn test_servers_discovered() {
    let a = Arc::new(MockServer::new("a:4222").with_connect_urls(&["b:4222"]));
    let (conn, tracker) = connect(options(&[&a]), &[&a]).await;

    assert_eq!(conn.discovered_servers(), vec!["nats://b:4222".to_string()]);
    tracker.wait_until(TIMEOUT, |events| events.iter().any(|e| matches!(e, ConnectionEvent::ServersDiscovered(_)))).await.unwrap();

    a.announce_servers(&["b:4222", "c:4222"]);
    tracker.wait_until(TIMEOUT, |events| events.iter().filter(|e| matches!(e, ConnectionEvent::ServersDiscovered(_))).count() == 2).await.unwrap();

    assert_eq!(tracker.discovered_urls(), vec!["nats://b:4222".to_string(), "nats://c:4222".to_string()]);
    assert_eq!(conn.servers().len(), 3);
}

/// Servers learned from the cluster are failover candidates like configured ones
#[tokio::test]
async fn test_failover_to_discovered_server() {
    let a = Arc::new(MockServer::new("a:4222").with_connect_urls(&["b:4222"]));
    let b = Arc::new(MockServer::new("b:4222"));
    let (conn, tracker) = connect(options(&[&a]), &[&a, &b]).await;

    a.shutdown();
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    assert_eq!(conn.connected_url(), Some(b.url()));
}

#[tokio::test]
async fn test_drop_closes_connection() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, tracker) = connect(options(&[&server]), &[&server]).await;
    let sub = conn.subscribe("foo").unwrap();

    drop(conn);
    tracker.wait_for_closed(TIMEOUT).await.unwrap();
    assert!(!sub.is_valid());
    wait_until(TIMEOUT, || server.num_clients() == 0).await.unwrap();
}

#[cfg(debug_assertions)]
#[tokio::test]
#[should_panic(expected = "illegal connection state transition")]
async fn test_closed_is_terminal() {
    let server = Arc::new(MockServer::new("a:4222"));
    let (conn, _) = connect(options(&[&server]), &[&server]).await;
    conn.close().await;

    let inner = conn.inner.clone();
    let mut core = inner.core.lock();
    inner.set_state(&mut core, ConnectionState::Connecting);
}

#[tokio::test]
async fn test_state_transitions_are_legal() {
    let server = Arc::new(MockServer::new("a:4222"));
    let mut options = options(&[&server]);
    options.max_reconnect_attempts = None;
    let (conn, tracker) = connect(options, &[&server]).await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    server.kill_connections();
    tracker.wait_for_reconnects(1, TIMEOUT).await.unwrap();
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);

    // a late transport failure does not leave Closed
    let generation = conn.inner.core.lock().generation;
    conn.inner.handle_transport_failure(generation, NatsError::Disconnected);
    assert_eq!(conn.state(), ConnectionState::Closed);
    tracker.wait_for_closed(TIMEOUT).await.unwrap();
    assert_eq!(tracker.closes(), 1);
}
