use bytes::Bytes;

use crate::protocol::server_info::ServerInfo;

/// The arguments of a `MSG <subject> <sid> [reply-to] <#bytes>` line
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MsgArgs {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub size: usize,
}

/// A single operation received from the server
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProtocolOp {
    Info(ServerInfo),
    Msg {
        args: MsgArgs,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    /// the reason text, with surrounding quotes removed
    Err(String),
}

impl ProtocolOp {
    /// name of the operation for logging
    pub fn verb(&self) -> &'static str {
        match self {
            ProtocolOp::Info(_) => "INFO",
            ProtocolOp::Msg { .. } => "MSG",
            ProtocolOp::Ping => "PING",
            ProtocolOp::Pong => "PONG",
            ProtocolOp::Ok => "+OK",
            ProtocolOp::Err(_) => "-ERR",
        }
    }
}
