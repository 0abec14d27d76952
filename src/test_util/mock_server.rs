//! An in-memory NATS server speaking enough of the protocol to test client behavior: INFO,
//!  CONNECT with optional authentication, PING / PONG, SUB / UNSUB (including auto-unsubscribe),
//!  and PUB with wildcard subjects and queue groups. It is reached through
//!  [InMemoryTransport], which connects clients to servers by their `host:port` address.
//!
//! Servers can be made unreachable and their live connections killed, which is what
//!  failover tests need.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::server_pool::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::protocol::connect_info::ConnectInfo;
use crate::protocol::server_info::ServerInfo;
use crate::transport::{BoxedStream, Transport};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub enum MockAuth {
    UserPass(String, String),
    Token(String),
}

pub struct MockServer {
    address: String,
    auth: Option<MockAuth>,
    verbose: bool,
    max_payload: usize,
    connect_urls: Mutex<Vec<String>>,
    reachable: AtomicBool,
    answer_pings: AtomicBool,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    next_client_id: u64,
    clients: BTreeMap<u64, ClientHandle>,
    /// control lines received from all clients, in order
    received: Vec<String>,
    num_connects: usize,
}

struct ClientHandle {
    sender: mpsc::UnboundedSender<Bytes>,
    subs: BTreeMap<String, ServerSub>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerSub {
    subject: String,
    queue_group: Option<String>,
    /// 0 for unlimited
    max: u64,
    delivered: u64,
}

impl MockServer {
    pub fn new(address: &str) -> MockServer {
        MockServer {
            address: address.to_string(),
            auth: None,
            verbose: false,
            max_payload: 1024 * 1024,
            connect_urls: Default::default(),
            reachable: AtomicBool::new(true),
            answer_pings: AtomicBool::new(true),
            state: Default::default(),
        }
    }

    pub fn with_auth(mut self, auth: MockAuth) -> MockServer {
        self.auth = Some(auth);
        self
    }

    pub fn with_verbose(mut self) -> MockServer {
        self.verbose = true;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> MockServer {
        self.max_payload = max_payload;
        self
    }

    pub fn with_connect_urls(self, urls: &[&str]) -> MockServer {
        *self.connect_urls.lock() = urls.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.address)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// A server that does not answer PINGs looks stale to its clients
    pub fn set_answer_pings(&self, answer_pings: bool) {
        self.answer_pings.store(answer_pings, Ordering::Release);
    }

    /// Drops all live client connections, as if the server process died
    pub fn kill_connections(&self) {
        let clients = std::mem::take(&mut self.state.lock().clients);
        debug!("mock server {}: killing {} connections", self.address, clients.len());
        for client in clients.into_values() {
            for task in client.tasks {
                task.abort();
            }
        }
    }

    /// makes the server unreachable and kills its connections
    pub fn shutdown(&self) {
        self.set_reachable(false);
        self.kill_connections();
    }

    /// Sends raw protocol data to all connected clients
    pub fn send_raw(&self, data: &[u8]) {
        let data = Bytes::copy_from_slice(data);
        for client in self.state.lock().clients.values() {
            let _ = client.sender.send(data.clone());
        }
    }

    /// Announces additional cluster members to all connected clients
    pub fn announce_servers(&self, urls: &[&str]) {
        *self.connect_urls.lock() = urls.iter().map(|s| s.to_string()).collect();
        let info = self.info_line();
        self.send_raw(&info);
    }

    pub fn num_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// number of CONNECTs this server accepted
    pub fn num_connects(&self) -> usize {
        self.state.lock().num_connects
    }

    pub fn num_subscriptions(&self) -> usize {
        self.state.lock().clients.values()
            .map(|c| c.subs.len())
            .sum()
    }

    pub fn received_lines(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    fn info_line(&self) -> Vec<u8> {
        let (host, port) = match ServerEndpoint::parse(&self.address) {
            Ok(endpoint) => (endpoint.host, endpoint.port),
            Err(_) => (self.address.clone(), 0),
        };
        let connect_urls = self.connect_urls.lock().clone();
        let info = ServerInfo {
            server_id: format!("mock-{}", self.address),
            version: "mock".to_string(),
            host,
            port,
            auth_required: self.auth.is_some(),
            max_payload: self.max_payload,
            connect_urls: if connect_urls.is_empty() { None } else { Some(connect_urls) },
            ..Default::default()
        };
        format!("{}\r\n", info).into_bytes()
    }

    fn is_authorized(&self, connect: &ConnectInfo) -> bool {
        match &self.auth {
            None => true,
            Some(MockAuth::UserPass(user, pass)) => connect.user.as_ref() == Some(user) && connect.pass.as_ref() == Some(pass),
            Some(MockAuth::Token(token)) => connect.auth_token.as_ref() == Some(token),
        }
    }

    fn accept(self: &Arc<Self>) -> BoxedStream {
        let (client_end, server_end) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        let (read, write) = tokio::io::split(server_end);
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(Bytes::from(self.info_line()));

        let client_id = {
            let mut state = self.state.lock();
            state.next_client_id += 1;
            let client_id = state.next_client_id;
            state.clients.insert(client_id, ClientHandle {
                sender: sender.clone(),
                subs: Default::default(),
                tasks: Vec::new(),
            });
            client_id
        };

        let writer = tokio::spawn(write_loop(write, receiver));
        let server = self.clone();
        let reader = tokio::spawn(async move {
            if let Err(e) = server.run_session(client_id, read, sender).await {
                debug!("mock server {}: session {} failed: {}", server.address, client_id, e);
            }
            server.state.lock().clients.remove(&client_id);
        });

        let mut state = self.state.lock();
        match state.clients.get_mut(&client_id) {
            Some(client) => {
                client.tasks.push(reader);
                client.tasks.push(writer);
            }
            None => {
                reader.abort();
                writer.abort();
            }
        }
        Box::new(client_end)
    }

    async fn run_session(&self, client_id: u64, read: ReadHalf<DuplexStream>, sender: mpsc::UnboundedSender<Bytes>) -> anyhow::Result<()> {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        let reply = |data: &'static [u8]| sender.send(Bytes::from_static(data)).map_err(|_| anyhow!("client gone"));

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            trace!("mock server {} <= {}", self.address, line);
            self.state.lock().received.push(line.to_string());

            let (verb, rest) = match line.split_once(' ') {
                Some((verb, rest)) => (verb, rest.trim()),
                None => (line, ""),
            };
            let args = rest.split_ascii_whitespace().collect::<Vec<_>>();

            match verb.to_ascii_uppercase().as_str() {
                "CONNECT" => {
                    let connect = ConnectInfo::parse_json(rest)?;
                    if !self.is_authorized(&connect) {
                        reply(b"-ERR 'Authorization Violation'\r\n")?;
                        return Ok(());
                    }
                    self.state.lock().num_connects += 1;
                    if connect.verbose {
                        reply(b"+OK\r\n")?;
                    }
                }
                "PING" => {
                    if self.answer_pings.load(Ordering::Acquire) {
                        reply(b"PONG\r\n")?;
                    }
                }
                "PONG" => {}
                "SUB" => {
                    let (subject, queue_group, sid) = match args.as_slice() {
                        [subject, sid] => (*subject, None, *sid),
                        [subject, queue_group, sid] => (*subject, Some(queue_group.to_string()), *sid),
                        _ => bail!("malformed SUB: {}", line),
                    };
                    let mut state = self.state.lock();
                    if let Some(client) = state.clients.get_mut(&client_id) {
                        client.subs.insert(sid.to_string(), ServerSub {
                            subject: subject.to_string(),
                            queue_group,
                            max: 0,
                            delivered: 0,
                        });
                    }
                }
                "UNSUB" => {
                    let (sid, max) = match args.as_slice() {
                        [sid] => (*sid, 0),
                        [sid, max] => (*sid, max.parse::<u64>()?),
                        _ => bail!("malformed UNSUB: {}", line),
                    };
                    let mut state = self.state.lock();
                    if let Some(client) = state.clients.get_mut(&client_id) {
                        let done = match client.subs.get_mut(sid) {
                            Some(sub) if max > 0 => {
                                sub.max = max;
                                sub.delivered >= max
                            }
                            _ => true,
                        };
                        if done {
                            client.subs.remove(sid);
                        }
                    }
                }
                "PUB" => {
                    let (subject, reply_to, size) = match args.as_slice() {
                        [subject, size] => (*subject, None, size.parse::<usize>()?),
                        [subject, reply_to, size] => (*subject, Some(*reply_to), size.parse::<usize>()?),
                        _ => bail!("malformed PUB: {}", line),
                    };
                    let mut payload = vec![0u8; size + 2];
                    reader.read_exact(&mut payload).await?;
                    if &payload[size..] != b"\r\n" {
                        reply(b"-ERR 'Unknown Protocol Operation'\r\n")?;
                        return Ok(());
                    }
                    payload.truncate(size);

                    if size > self.max_payload {
                        reply(b"-ERR 'Maximum Payload Exceeded'\r\n")?;
                        return Ok(());
                    }
                    self.route(subject, reply_to, &payload);
                    if self.verbose {
                        reply(b"+OK\r\n")?;
                    }
                }
                _ => {
                    reply(b"-ERR 'Unknown Protocol Operation'\r\n")?;
                }
            }
        }
    }

    fn route(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
        let mut state = self.state.lock();

        // plain subscribers get every message, queue groups get one copy per group
        let mut targets: Vec<(u64, String)> = Vec::new();
        let mut queue_groups: FxHashMap<String, Vec<(u64, String)>> = Default::default();
        for (client_id, client) in state.clients.iter() {
            for (sid, sub) in client.subs.iter() {
                if !subject_matches(&sub.subject, subject) {
                    continue;
                }
                match &sub.queue_group {
                    None => targets.push((*client_id, sid.clone())),
                    Some(group) => queue_groups.entry(group.clone()).or_default().push((*client_id, sid.clone())),
                }
            }
        }
        for members in queue_groups.into_values() {
            if let Some(chosen) = members.choose(&mut rand::thread_rng()) {
                targets.push(chosen.clone());
            }
        }

        for (client_id, sid) in targets {
            let Some(client) = state.clients.get_mut(&client_id) else {
                continue;
            };

            let mut msg = BytesMut::with_capacity(subject.len() + payload.len() + 64);
            put_msg(&mut msg, subject, &sid, reply_to, payload);
            let _ = client.sender.send(msg.freeze());

            let exhausted = match client.subs.get_mut(&sid) {
                Some(sub) => {
                    sub.delivered += 1;
                    sub.max > 0 && sub.delivered >= sub.max
                }
                None => false,
            };
            if exhausted {
                client.subs.remove(&sid);
            }
        }
    }
}

/// The server side's framing of a message delivered to a subscription
pub fn put_msg(buf: &mut BytesMut, subject: &str, sid: &str, reply_to: Option<&str>, payload: &[u8]) {
    buf.put_slice(format!("MSG {} {} ", subject, sid).as_bytes());
    if let Some(reply_to) = reply_to {
        buf.put_slice(reply_to.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(format!("{}\r\n", payload.len()).as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
}

async fn write_loop(mut write: WriteHalf<DuplexStream>, mut receiver: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = receiver.recv().await {
        if write.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = write.shutdown().await;
}

/// NATS subject matching: `*` matches a single token, `>` matches one or more trailing tokens
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Connects clients to [MockServer]s by address. Unknown or unreachable addresses fail to
///  open, like a refused TCP connection.
#[derive(Default)]
pub struct InMemoryTransport {
    servers: Mutex<FxHashMap<String, Arc<MockServer>>>,
    num_opens: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new(servers: Vec<Arc<MockServer>>) -> InMemoryTransport {
        let transport = InMemoryTransport::default();
        for server in servers {
            transport.add_server(server);
        }
        transport
    }

    pub fn add_server(&self, server: Arc<MockServer>) {
        self.servers.lock().insert(server.address().to_string(), server);
    }

    /// number of attempts to open a connection, successful or not
    pub fn num_opens(&self) -> usize {
        self.num_opens.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, endpoint: &ServerEndpoint, _timeout: Duration) -> Result<BoxedStream> {
        self.num_opens.fetch_add(1, Ordering::AcqRel);
        let address = endpoint.address();
        let server = self.servers.lock().get(&address).cloned();
        match server {
            Some(server) if server.is_reachable() => Ok(server.accept()),
            _ => Err(NatsError::Connect(format!("{}: connection refused", address))),
        }
    }

    async fn upgrade_to_tls(&self, _stream: BoxedStream, endpoint: &ServerEndpoint) -> Result<BoxedStream> {
        Err(NatsError::Tls(format!("{}: TLS is not supported by the in-memory transport", endpoint)))
    }
}

/// Polls `condition` until it holds, failing after `timeout`
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
