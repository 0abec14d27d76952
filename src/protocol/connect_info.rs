use serde::{Deserialize, Serialize};

use crate::error::{NatsError, Result};

pub const LANG: &str = "rust";
pub const PROTOCOL_VERSION: u32 = 1;

/// The body of the client's `CONNECT {json}` line
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub ssl_required: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u32,
    pub echo: bool,
}

impl ConnectInfo {
    pub fn new(verbose: bool, pedantic: bool, tls_required: bool, name: Option<String>) -> ConnectInfo {
        ConnectInfo {
            verbose,
            pedantic,
            user: None,
            pass: None,
            auth_token: None,
            ssl_required: tls_required,
            tls_required,
            name,
            lang: LANG.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            echo: true,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| NatsError::Protocol(format!("cannot serialize CONNECT: {}", e)))
    }

    pub fn parse_json(json: &str) -> Result<ConnectInfo> {
        serde_json::from_str(json.trim())
            .map_err(|e| NatsError::Protocol(format!("unparseable CONNECT: {}", e)))
    }
}
