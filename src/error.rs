use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, NatsError>;

/// All failures surfaced by the client. Errors that are local to a single call or subscription
///  never affect the liveness of the connection; see [crate::connection::connection::Connection]
///  for how transport loss is reported.
///
/// The error is `Clone` so it can be carried inside broadcast
///  [crate::connection::connection_events::ConnectionEvent]s.
#[derive(thiserror::Error, Debug, Clone)]
pub enum NatsError {
    /// transport or handshake failure before a connection was established
    #[error("nats: connection error: {0}")]
    Connect(String),
    #[error("nats: authorization violation: {0}")]
    Authorization(String),
    /// malformed data on the wire - fatal for the current physical connection
    #[error("nats: protocol error: {0}")]
    Protocol(String),
    #[error("nats: invalid subscription")]
    BadSubscription,
    #[error("nats: slow consumer, messages dropped on subscription {sid}")]
    SlowConsumer { sid: u64 },
    #[error("nats: timeout")]
    Timeout,
    /// the reconnect buffer for outbound data is full
    #[error("nats: outbound buffer limit of {limit} bytes exceeded")]
    ResourceExhausted { limit: usize },
    #[error("nats: connection closed")]
    ConnectionClosed,
    #[error("nats: connection lost")]
    Disconnected,
    #[error("nats: no servers available for connection")]
    NoServers,
    #[error("nats: invalid subject")]
    InvalidSubject,
    #[error("nats: invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("nats: maximum payload of {max} bytes exceeded")]
    MaxPayload { max: usize },
    #[error("nats: illegal call on an async subscription")]
    AsyncSubscription,
    /// a `-ERR` from the server that does not fit any of the other categories
    #[error("nats: server error: {0}")]
    Server(String),
    #[error("nats: stale connection")]
    StaleConnection,
    #[error("nats: tls error: {0}")]
    Tls(String),
    #[error("nats: i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for NatsError {
    fn from(e: io::Error) -> Self {
        NatsError::Io(Arc::new(e))
    }
}

impl NatsError {
    /// Classifies the reason text of a server `-ERR` line
    pub fn from_server_reason(reason: &str) -> NatsError {
        let lower = reason.to_ascii_lowercase();
        if lower.starts_with("authorization violation") {
            NatsError::Authorization(reason.to_string())
        }
        else if lower.starts_with("stale connection") {
            NatsError::StaleConnection
        }
        else {
            NatsError::Server(reason.to_string())
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, NatsError::Authorization(_))
    }
}
