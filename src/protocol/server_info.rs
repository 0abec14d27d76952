use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{NatsError, Result};

/// The server's self-description, sent as `INFO {json}` when a connection is opened and
///  (asynchronously) whenever the cluster topology changes.
///
/// Absence of `connect_urls` is valid and means 'no news about the cluster', it does not mean
///  that the cluster shrank.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub auth_required: bool,
    pub ssl_required: bool,
    pub tls_required: bool,
    pub tls_verify: bool,
    pub max_payload: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_urls: Option<Vec<String>>,
}

impl ServerInfo {
    pub fn parse_json(json: &str) -> Result<ServerInfo> {
        serde_json::from_str(json.trim())
            .map_err(|e| NatsError::Protocol(format!("unparseable INFO: {}", e)))
    }

    /// Older servers announce TLS as `ssl_required`, newer ones as `tls_required`
    pub fn is_tls_required(&self) -> bool {
        self.ssl_required || self.tls_required
    }

    pub fn connect_urls(&self) -> &[String] {
        self.connect_urls.as_deref()
            .unwrap_or(&[])
    }
}

impl Display for ServerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self)
            .map_err(|_| std::fmt::Error)?;
        write!(f, "INFO {}", json)
    }
}
