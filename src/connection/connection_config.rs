use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls::ClientConfig;

use crate::connection::connection_events::ConnectionEventHandler;
use crate::connection::server_pool::{ServerEndpoint, DEFAULT_URL};
use crate::error::{NatsError, Result};
use crate::subscription::pending_queue::{DEFAULT_MAX_PENDING_BYTES, DEFAULT_MAX_PENDING_MSGS};

pub struct ConnectionOptions {
    pub servers: Vec<String>,
    pub name: Option<String>,

    pub verbose: bool,
    pub pedantic: bool,

    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,

    /// require TLS even if the server does not ask for it
    pub secure: bool,
    /// trust anchors and client certificates for TLS; without them, no server can be verified
    pub tls_config: Option<Arc<ClientConfig>>,

    /// bounds the entire handshake with a single server, not only opening the socket
    pub connect_timeout: Duration,

    pub allow_reconnect: bool,
    /// per server in the pool; `None` for unlimited
    pub max_reconnect_attempts: Option<u32>,
    /// minimum time between two attempts on the same server
    pub reconnect_wait: Duration,
    /// upper bound for data published while reconnecting
    pub reconnect_buffer_size: usize,

    pub ping_interval: Duration,
    /// number of unanswered PINGs after which the connection is considered stale
    pub max_pings_out: u32,

    pub pending_msgs_limit: usize,
    pub pending_bytes_limit: usize,

    /// shuffle the server pool rather than trying servers in the configured order
    pub randomize: bool,

    pub event_handlers: Vec<Arc<dyn ConnectionEventHandler>>,
}

impl ConnectionOptions {
    pub fn new(servers: Vec<String>) -> ConnectionOptions {
        let servers = if servers.is_empty() {
            vec![DEFAULT_URL.to_string()]
        }
        else {
            servers
        };

        ConnectionOptions {
            servers,
            name: None,
            verbose: false,
            pedantic: false,
            user: None,
            pass: None,
            token: None,
            secure: false,
            tls_config: None,
            connect_timeout: Duration::from_secs(2),
            allow_reconnect: true,
            max_reconnect_attempts: Some(60),
            reconnect_wait: Duration::from_secs(2),
            reconnect_buffer_size: 8 * 1024 * 1024,
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            pending_msgs_limit: DEFAULT_MAX_PENDING_MSGS,
            pending_bytes_limit: DEFAULT_MAX_PENDING_BYTES,
            randomize: true,
            event_handlers: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for url in &self.servers {
            ServerEndpoint::parse(url)?;
        }
        if self.connect_timeout.is_zero() {
            return Err(NatsError::InvalidConfig("connect timeout must be positive".to_string()));
        }
        if self.ping_interval.is_zero() {
            return Err(NatsError::InvalidConfig("ping interval must be positive".to_string()));
        }
        if self.pending_msgs_limit == 0 {
            return Err(NatsError::InvalidConfig("pending message limit cannot be zero".to_string()));
        }
        if self.pending_bytes_limit == 0 {
            return Err(NatsError::InvalidConfig("pending bytes limit cannot be zero".to_string()));
        }
        if self.user.is_some() && self.token.is_some() {
            return Err(NatsError::InvalidConfig("user and token are mutually exclusive".to_string()));
        }
        Ok(())
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ConnectionEventHandler>) {
        self.event_handlers.push(handler);
    }
}

impl Debug for ConnectionOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("user", &self.user)
            .field("secure", &self.secure)
            .field("connect_timeout", &self.connect_timeout)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("reconnect_buffer_size", &self.reconnect_buffer_size)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("pending_msgs_limit", &self.pending_msgs_limit)
            .field("pending_bytes_limit", &self.pending_bytes_limit)
            .field("randomize", &self.randomize)
            .field("event_handlers", &self.event_handlers.len())
            .finish()
    }
}
