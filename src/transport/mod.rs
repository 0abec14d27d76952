//! The byte-stream collaborator underneath a connection. The connection only needs a way to
//!  open a bidirectional stream to an endpoint and to wrap an open stream in TLS; everything
//!  else (read, write, close) is the stream's [AsyncRead] / [AsyncWrite] implementation.
//!
//! Tests substitute in-memory streams, see [crate::test_util::mock_server::InMemoryTransport].

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::server_pool::ServerEndpoint;
use crate::error::Result;

pub mod tcp_transport;
pub mod tls;

pub trait NatsStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> NatsStream for T {}

pub type BoxedStream = Box<dyn NatsStream>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a plain stream to the endpoint, failing with [crate::NatsError::Connect] if that
    ///  is not possible within `timeout`
    async fn open(&self, endpoint: &ServerEndpoint, timeout: Duration) -> Result<BoxedStream>;

    /// Performs a client-side TLS handshake on an open stream
    async fn upgrade_to_tls(&self, stream: BoxedStream, endpoint: &ServerEndpoint) -> Result<BoxedStream>;
}
