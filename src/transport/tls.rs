use std::sync::Arc;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::connection::server_pool::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::transport::BoxedStream;

/// A client config that trusts no server at all. It is only useful as a placeholder until
///  the application provides its trust anchors via
///  [crate::connection::connection_config::ConnectionOptions::tls_config].
pub fn empty_client_config() -> Arc<ClientConfig> {
    warn!("no TLS configuration provided - TLS handshakes will fail unless a root store is configured");
    let config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    Arc::new(config)
}

pub async fn connect_tls(config: Arc<ClientConfig>, stream: BoxedStream, endpoint: &ServerEndpoint) -> Result<BoxedStream> {
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| NatsError::Tls(format!("invalid server name {}: {}", endpoint.host, e)))?;

    debug!("starting TLS handshake with {}", endpoint);
    let tls_stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| NatsError::Tls(e.to_string()))?;
    Ok(Box::new(tls_stream))
}
