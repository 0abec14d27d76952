use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, trace};

use crate::connection::server_pool::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::transport::tls::{connect_tls, empty_client_config};
use crate::transport::{BoxedStream, Transport};

/// The production transport: plain TCP with `TCP_NODELAY`, optionally upgraded to TLS
pub struct TcpTransport {
    tls_config: Option<Arc<ClientConfig>>,
}

impl TcpTransport {
    pub fn new(tls_config: Option<Arc<ClientConfig>>) -> TcpTransport {
        TcpTransport {
            tls_config,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &ServerEndpoint, timeout: Duration) -> Result<BoxedStream> {
        let address = endpoint.address();
        trace!("opening TCP connection to {}", address);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((endpoint.host.as_str(), endpoint.port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(NatsError::Connect(format!("{}: {}", address, e))),
            Err(_) => return Err(NatsError::Connect(format!("{}: timed out after {:?}", address, timeout))),
        };
        stream.set_nodelay(true)?;

        debug!("TCP connection to {} established", address);
        Ok(Box::new(stream))
    }

    async fn upgrade_to_tls(&self, stream: BoxedStream, endpoint: &ServerEndpoint) -> Result<BoxedStream> {
        let config = match &self.tls_config {
            Some(config) => config.clone(),
            None => empty_client_config(),
        };
        connect_tls(config, stream, endpoint).await
    }
}
