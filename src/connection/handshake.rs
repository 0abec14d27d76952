use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::connection::connection_config::ConnectionOptions;
use crate::connection::server_pool::ServerEndpoint;
use crate::error::{NatsError, Result};
use crate::protocol::client_ops::{put_connect, put_ping, PONG};
use crate::protocol::connect_info::ConnectInfo;
use crate::protocol::parser::ProtocolParser;
use crate::protocol::protocol_op::ProtocolOp;
use crate::protocol::server_info::ServerInfo;
use crate::transport::{BoxedStream, Transport};

const READ_BUF_SIZE: usize = 4096;

/// A physical connection that completed the handshake. The parser may hold data the server
///  sent after its `PONG`, so it must be handed on to the reader.
pub(crate) struct Handshake {
    pub endpoint: ServerEndpoint,
    pub stream: BoxedStream,
    pub parser: ProtocolParser,
    pub info: ServerInfo,
}

/// Opens a connection to the endpoint and runs the handshake: INFO from the server, TLS
///  upgrade if either side requires it, CONNECT followed by PING, and the server's PONG. The
///  whole sequence is bounded by the connect timeout.
///
/// An `-ERR` from the server during the handshake fails it, with an authorization violation
///  reported as [NatsError::Authorization].
pub(crate) async fn perform_handshake(transport: &dyn Transport, endpoint: &ServerEndpoint, options: &ConnectionOptions) -> Result<Handshake> {
    match tokio::time::timeout(options.connect_timeout, do_handshake(transport, endpoint, options)).await {
        Ok(result) => result,
        Err(_) => Err(NatsError::Connect(format!("handshake with {} timed out", endpoint))),
    }
}

async fn do_handshake(transport: &dyn Transport, endpoint: &ServerEndpoint, options: &ConnectionOptions) -> Result<Handshake> {
    let mut stream = transport.open(endpoint, options.connect_timeout).await?;
    let mut parser = ProtocolParser::new();

    let info = match read_op(&mut stream, &mut parser).await? {
        ProtocolOp::Info(info) => info,
        ProtocolOp::Err(reason) => return Err(NatsError::from_server_reason(&reason)),
        op => return Err(NatsError::Protocol(format!("expected INFO from {}, got {}", endpoint, op.verb()))),
    };
    trace!("<= {}", info);
    parser.set_max_payload(info.max_payload);

    let tls_required = info.is_tls_required() || options.secure || endpoint.tls_required;
    if tls_required {
        stream = transport.upgrade_to_tls(stream, endpoint).await?;
    }

    let mut buf = BytesMut::new();
    put_connect(&mut buf, &connect_info(options, endpoint, tls_required))?;
    put_ping(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut info = info;
    loop {
        match read_op(&mut stream, &mut parser).await? {
            ProtocolOp::Pong => break,
            ProtocolOp::Ok => trace!("<= +OK"),
            ProtocolOp::Ping => {
                stream.write_all(PONG).await?;
                stream.flush().await?;
            }
            ProtocolOp::Info(updated) => {
                parser.set_max_payload(updated.max_payload);
                info = updated;
            }
            ProtocolOp::Err(reason) => return Err(NatsError::from_server_reason(&reason)),
            ProtocolOp::Msg { .. } => return Err(NatsError::Protocol("MSG received during handshake".to_string())),
        }
    }

    debug!("handshake with {} complete (server id {})", endpoint, info.server_id);
    Ok(Handshake {
        endpoint: endpoint.clone(),
        stream,
        parser,
        info,
    })
}

/// Credentials from the server URL take precedence over those from the options
fn connect_info(options: &ConnectionOptions, endpoint: &ServerEndpoint, tls_required: bool) -> ConnectInfo {
    let mut info = ConnectInfo::new(options.verbose, options.pedantic, tls_required, options.name.clone());
    if endpoint.has_credentials() {
        info.user = endpoint.user.clone();
        info.pass = endpoint.pass.clone();
        info.auth_token = endpoint.token.clone();
    }
    else {
        info.user = options.user.clone();
        info.pass = options.pass.clone();
        info.auth_token = options.token.clone();
    }
    info
}

async fn read_op(stream: &mut BoxedStream, parser: &mut ProtocolParser) -> Result<ProtocolOp> {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if let Some(op) = parser.next_op()? {
            return Ok(op);
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(NatsError::Connect("connection closed by server during handshake".to_string()));
        }
        parser.extend(&buf[..n]);
    }
}
