use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::connection::connection_config::ConnectionOptions;
use crate::connection::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::connection::connection_state::{ConnectionState, ConnectionStats, StatsCounters};
use crate::connection::handshake::perform_handshake;
use crate::connection::server_pool::ServerPool;
use crate::error::{NatsError, Result};
use crate::message::{validate_subject, Message};
use crate::protocol::client_ops::{put_ping, put_pub, put_sub, put_unsub};
use crate::protocol::server_info::ServerInfo;
use crate::subscription::message_handler::{spawn_handler_loop, MessageHandler};
use crate::subscription::subscription::{Subscription, SubscriptionOwner, SubscriptionState};
use crate::transport::tcp_transport::TcpTransport;
use crate::transport::Transport;

pub const INBOX_PREFIX: &str = "_INBOX.";
const INBOX_ID_LEN: usize = 22;

/// A client connection to a NATS cluster.
///
/// The connection survives the loss of individual servers: while reconnection is allowed, a
///  lost server connection moves it to [ConnectionState::Reconnecting], and it tries the other
///  servers of its pool until one accepts it or the reconnect budget is used up. Subscriptions
///  are re-established transparently, and data published in the meantime is buffered (up to
///  [ConnectionOptions::reconnect_buffer_size]) and sent after reconnecting.
///
/// Dropping a `Connection` closes it without flushing buffered data; use
///  [Connection::close] for an orderly shutdown.
pub struct Connection {
    pub(super) inner: Arc<ConnectionInner>,
}

/// state shared between the application-facing [Connection] and the connection's tasks
pub(crate) struct ConnectionInner {
    pub(crate) options: ConnectionOptions,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) core: Mutex<ConnectionCore>,
    pub(crate) events: ConnectionEventNotifier,
    /// signals the writer task that there is outbound data
    pub(crate) flush_signal: Notify,
    pub(crate) state_watch: watch::Sender<ConnectionState>,
    pub(crate) stats: StatsCounters,
}

/// Everything that changes with state transitions. Only ever locked briefly, and never
///  across an `.await`.
pub(crate) struct ConnectionCore {
    pub state: ConnectionState,
    pub pool: ServerPool,
    pub server_info: ServerInfo,
    /// ordered by sid, i.e. by creation, for replay after reconnecting
    pub subscriptions: BTreeMap<u64, Arc<SubscriptionState>>,
    pub next_sid: u64,
    /// protocol data not handed to the writer yet. While reconnecting, this is the reconnect
    ///  buffer.
    pub outbound: BytesMut,
    /// one entry per PING in flight, in the order they were sent; flush calls wait for theirs
    pub pongs: VecDeque<Option<oneshot::Sender<Result<()>>>>,
    pub pings_out: u32,
    /// incremented for each physical connection, so that tasks of a previous connection can
    ///  recognize they are stale
    pub generation: u64,
    pub tasks: Vec<JoinHandle<()>>,
    pub writer_task: Option<JoinHandle<()>>,
    pub last_error: Option<NatsError>,
}

impl ConnectionInner {
    /// Transitions that [ConnectionState::can_transition_to] does not allow are refused
    pub(crate) fn set_state(&self, core: &mut ConnectionCore, state: ConnectionState) {
        if core.state == state {
            return;
        }
        if !core.state.can_transition_to(state) {
            error!("illegal connection state transition {} -> {}", core.state, state);
            debug_assert!(false, "illegal connection state transition {} -> {}", core.state, state);
            return;
        }
        debug!("connection state {} -> {}", core.state, state);
        core.state = state;
        self.state_watch.send_replace(state);
    }

    fn add_subscription(self: &Arc<Self>, subject: &str, queue_group: Option<&str>, pending_limits: (usize, usize), is_async: bool) -> Result<Arc<SubscriptionState>> {
        validate_subject(subject)?;
        if let Some(queue_group) = queue_group {
            validate_subject(queue_group)?;
        }

        let weak = Arc::downgrade(self);
        let owner: Weak<dyn SubscriptionOwner> = weak;

        let mut core = self.core.lock();
        if core.state.is_closed() {
            return Err(NatsError::ConnectionClosed);
        }

        core.next_sid += 1;
        let sid = core.next_sid;
        let state = SubscriptionState::new(sid, subject, queue_group, pending_limits, is_async, owner)?;
        core.subscriptions.insert(sid, state.clone());

        let connected = core.state == ConnectionState::Connected;
        if connected {
            put_sub(&mut core.outbound, subject, queue_group, sid);
        }
        drop(core);

        debug!("subscribed to {} with sid {}", subject, sid);
        if connected {
            self.flush_signal.notify_one();
        }
        Ok(state)
    }
}

impl SubscriptionOwner for ConnectionInner {
    fn unsubscribe(&self, sid: u64, max: u64) -> Result<()> {
        let mut core = self.core.lock();
        if core.state.is_closed() {
            return Err(NatsError::ConnectionClosed);
        }
        if max == 0 {
            core.subscriptions.remove(&sid);
        }

        // SUBs are replayed with their remaining UNSUB threshold on reconnect
        let connected = core.state == ConnectionState::Connected;
        if connected {
            put_unsub(&mut core.outbound, sid, max);
        }
        drop(core);

        if connected {
            self.flush_signal.notify_one();
        }
        Ok(())
    }

    fn forget(&self, sid: u64) {
        self.core.lock().subscriptions.remove(&sid);
    }
}

impl Connection {
    /// Connects to one of the configured servers via TCP (and TLS where required)
    pub async fn connect(options: ConnectionOptions) -> Result<Connection> {
        let transport = Arc::new(TcpTransport::new(options.tls_config.clone()));
        Self::connect_with_transport(options, transport).await
    }

    /// Tries each server of the pool once, in pool order, and fails with the last error if none
    ///  of them completes the handshake. A failed initial connect does not send any events.
    pub async fn connect_with_transport(mut options: ConnectionOptions, transport: Arc<dyn Transport>) -> Result<Connection> {
        options.validate()?;
        let pool = ServerPool::initialize(&options.servers, options.randomize)?;
        let handlers = std::mem::take(&mut options.event_handlers);

        let (state_watch, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(ConnectionInner {
            options,
            transport,
            core: Mutex::new(ConnectionCore {
                state: ConnectionState::Disconnected,
                pool,
                server_info: Default::default(),
                subscriptions: Default::default(),
                next_sid: 0,
                outbound: BytesMut::new(),
                pongs: Default::default(),
                pings_out: 0,
                generation: 0,
                tasks: Vec::new(),
                writer_task: None,
                last_error: None,
            }),
            events: ConnectionEventNotifier::new(handlers),
            flush_signal: Notify::new(),
            state_watch,
            stats: Default::default(),
        });

        inner.initial_connect().await?;
        Ok(Connection { inner })
    }

    /// Publishes a message. This does not wait for the data to be written, see
    ///  [Connection::flush] for that.
    pub fn publish(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) -> Result<()> {
        validate_subject(subject)?;
        let reply_to = match reply_to {
            Some("") | None => None,
            Some(r) => {
                validate_subject(r)?;
                Some(r)
            }
        };

        let mut core = self.inner.core.lock();
        match core.state {
            ConnectionState::Closed => return Err(NatsError::ConnectionClosed),
            ConnectionState::Connected | ConnectionState::Reconnecting => {}
            _ => return Err(NatsError::Disconnected),
        }

        let max_payload = core.server_info.max_payload;
        if max_payload > 0 && payload.len() > max_payload {
            return Err(NatsError::MaxPayload { max: max_payload });
        }

        let len_before = core.outbound.len();
        put_pub(&mut core.outbound, subject, reply_to, payload);

        let connected = core.state == ConnectionState::Connected;
        if !connected && core.outbound.len() > self.inner.options.reconnect_buffer_size {
            core.outbound.truncate(len_before);
            return Err(NatsError::ResourceExhausted { limit: self.inner.options.reconnect_buffer_size });
        }
        drop(core);

        self.inner.stats.on_outbound(payload.len());
        if connected {
            self.inner.flush_signal.notify_one();
        }
        Ok(())
    }

    pub fn publish_message(&self, msg: &Message) -> Result<()> {
        self.publish(msg.subject(), msg.reply_to(), msg.payload())
    }

    /// Waits until the server acknowledged everything sent so far, by a PING / PONG round
    ///  trip. Fails with [NatsError::Disconnected] if the connection is lost before the PONG
    ///  arrives.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let recv = {
            let mut core = self.inner.core.lock();
            if core.state.is_closed() {
                return Err(NatsError::ConnectionClosed);
            }

            let len_before = core.outbound.len();
            put_ping(&mut core.outbound);
            if core.state != ConnectionState::Connected && core.outbound.len() > self.inner.options.reconnect_buffer_size {
                core.outbound.truncate(len_before);
                return Err(NatsError::ResourceExhausted { limit: self.inner.options.reconnect_buffer_size });
            }

            let (send, recv) = oneshot::channel();
            core.pongs.push_back(Some(send));
            recv
        };
        self.inner.flush_signal.notify_one();

        match tokio::time::timeout(timeout, recv).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NatsError::ConnectionClosed),
            Err(_) => Err(NatsError::Timeout),
        }
    }

    pub fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_with_limits(subject, None, self.inner.options.pending_msgs_limit, self.inner.options.pending_bytes_limit)
    }

    /// Members of a queue group share the subject's messages: each message goes to exactly
    ///  one of them.
    pub fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        self.subscribe_with_limits(subject, Some(queue_group), self.inner.options.pending_msgs_limit, self.inner.options.pending_bytes_limit)
    }

    pub fn subscribe_with_limits(&self, subject: &str, queue_group: Option<&str>, pending_msgs_limit: usize, pending_bytes_limit: usize) -> Result<Subscription> {
        let state = self.inner.add_subscription(subject, queue_group, (pending_msgs_limit, pending_bytes_limit), false)?;
        Ok(Subscription::from_state(state))
    }

    /// Creates an asynchronous subscription: messages are passed to `handler` on a dedicated
    ///  task, in the order they were received, until the subscription is closed.
    pub fn subscribe_with_handler(&self, subject: &str, queue_group: Option<&str>, handler: Arc<dyn MessageHandler>) -> Result<Subscription> {
        let limits = (self.inner.options.pending_msgs_limit, self.inner.options.pending_bytes_limit);
        let state = self.inner.add_subscription(subject, queue_group, limits, true)?;
        spawn_handler_loop(state.clone(), handler);
        Ok(Subscription::from_state(state))
    }

    /// Sends a request and waits for the first reply, using a unique inbox as the reply
    ///  subject
    pub async fn request(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Message> {
        let inbox = new_inbox();
        let sub = self.subscribe(&inbox)?;
        sub.auto_unsubscribe(1)?;
        self.publish(subject, Some(&inbox), payload)?;

        let result = sub.next_message(timeout).await;
        if result.is_err() {
            sub.close();
        }
        result
    }

    /// Closes the connection for good: subscriptions are closed, and buffered data is written on
    ///  a best-effort basis. Closing a closed connection has no effect.
    pub async fn close(&self) {
        self.inner.close(None).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state() == ConnectionState::Reconnecting
    }

    /// watch for state changes, e.g. to wait for the connection to reconnect
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_watch.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// URL of the server the connection is currently attached to, `None` unless connected
    pub fn connected_url(&self) -> Option<String> {
        let core = self.inner.core.lock();
        if core.state != ConnectionState::Connected {
            return None;
        }
        core.pool.current_endpoint()
            .map(|s| s.url())
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.core.lock().server_info.clone()
    }

    pub fn max_payload(&self) -> usize {
        self.inner.core.lock().server_info.max_payload
    }

    /// all servers in the pool, including those announced by the cluster
    pub fn servers(&self) -> Vec<String> {
        self.inner.core.lock().pool.urls()
    }

    pub fn discovered_servers(&self) -> Vec<String> {
        self.inner.core.lock().pool.endpoints().iter()
            .filter(|s| s.discovered)
            .map(|s| s.url())
            .collect()
    }

    pub fn last_error(&self) -> Option<NatsError> {
        self.inner.core.lock().last_error.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(writer) = self.inner.begin_close(None) {
            writer.abort();
        }
    }
}

/// A subject that is unique with overwhelming probability, for receiving replies
pub fn new_inbox() -> String {
    let id: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INBOX_ID_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", INBOX_PREFIX, id)
}

impl ConnectionInner {
    /// The synchronous part of closing: everything except waiting for the writer. Returns the
    ///  writer task if the connection was not closed before.
    pub(crate) fn begin_close(&self, reason: Option<NatsError>) -> Option<JoinHandle<()>> {
        let (subscriptions, tasks, writer, pongs) = {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return None;
            }
            self.set_state(&mut core, ConnectionState::Closed);
            if reason.is_some() {
                core.last_error = reason;
            }
            (
                std::mem::take(&mut core.subscriptions),
                std::mem::take(&mut core.tasks),
                core.writer_task.take(),
                std::mem::take(&mut core.pongs),
            )
        };

        for sub in subscriptions.values() {
            sub.close_local();
        }
        for pong in pongs.into_iter().flatten() {
            let _ = pong.send(Err(NatsError::ConnectionClosed));
        }
        for task in tasks {
            task.abort();
        }

        info!("connection closed");
        self.events.send_event(ConnectionEvent::Closed);

        // wake the writer so it writes what is left and shuts down
        self.flush_signal.notify_one();
        writer
    }

    pub(crate) async fn close(&self, reason: Option<NatsError>) {
        let Some(writer) = self.begin_close(reason) else {
            return;
        };
        let abort_handle = writer.abort_handle();
        if tokio::time::timeout(self.options.connect_timeout, writer).await.is_err() {
            debug!("writer did not finish in time, aborting");
            abort_handle.abort();
        }
    }

    async fn initial_connect(self: &Arc<Self>) -> Result<()> {
        let num_servers = {
            let mut core = self.core.lock();
            self.set_state(&mut core, ConnectionState::Connecting);
            core.pool.len()
        };

        let mut last_error = NatsError::NoServers;
        for _ in 0..num_servers {
            let endpoint = {
                let mut core = self.core.lock();
                let Some(endpoint) = core.pool.advance() else {
                    break;
                };
                endpoint.last_attempt = Some(tokio::time::Instant::now());
                endpoint.clone()
            };

            debug!("connecting to {}", endpoint);
            match perform_handshake(self.transport.as_ref(), &endpoint, &self.options).await {
                Ok(handshake) => {
                    if self.establish(handshake, false) {
                        return Ok(());
                    }
                    last_error = NatsError::ConnectionClosed;
                    break;
                }
                Err(e) => {
                    debug!("connecting to {} failed: {}", endpoint, e);
                    last_error = e;
                }
            }
        }

        let mut core = self.core.lock();
        if !core.state.is_closed() {
            self.set_state(&mut core, ConnectionState::Disconnected);
        }
        core.last_error = Some(last_error.clone());
        Err(last_error)
    }
}
