use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{NatsError, Result};
use crate::protocol::protocol_op::{MsgArgs, ProtocolOp};
use crate::protocol::server_info::ServerInfo;

/// Upper bound for a single control line (i.e. everything up to the first line break). A
///  server sending longer lines is treated as speaking a different protocol.
pub const MAX_CONTROL_LINE_SIZE: usize = 4096;

/// An incremental parser for the server-to-client direction of the protocol.
///
/// Bytes are fed in arbitrarily sized chunks as they arrive from the transport, and every
///  operation that is complete after a chunk is returned exactly once, in wire order. Partial
///  data is kept until the rest arrives, including a `MSG` whose header was seen but whose
///  payload is still incomplete.
///
/// Once the parser reported an error, the stream is out of sync and there is no way to recover:
///  the parser stays failed, and the connection owning it must be discarded.
#[derive(Debug, Default)]
pub struct ProtocolParser {
    buf: BytesMut,
    pending_msg: Option<MsgArgs>,
    /// largest MSG payload accepted, 0 for no limit
    max_payload: usize,
    failed: bool,
}

impl ProtocolParser {
    pub fn new() -> ProtocolParser {
        Default::default()
    }

    /// Appends a chunk of received data, returning an iterator over all operations that are
    ///  complete now.
    pub fn feed(&mut self, data: &[u8]) -> ParsedOps<'_> {
        self.extend(data);
        ParsedOps {
            parser: self,
            done: false,
        }
    }

    /// Appends received data without parsing it yet; ops are pulled with
    ///  [ProtocolParser::next_op].
    pub fn extend(&mut self, data: &[u8]) {
        if !self.failed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Limits the announced payload size of incoming MSGs, which is the server's `max_payload`
    ///  once its INFO was received. A MSG exceeding the limit is rejected when its header is
    ///  parsed, before any payload is buffered. 0 removes the limit.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// number of bytes received but not yet consumed by a complete operation
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete operation from the buffered data, `Ok(None)` if more data is
    ///  needed.
    pub fn next_op(&mut self) -> Result<Option<ProtocolOp>> {
        if self.failed {
            return Err(NatsError::Protocol("parser is out of sync after a previous error".to_string()));
        }

        let result = self.try_next_op();
        if result.is_err() {
            self.failed = true;
            self.buf.clear();
            self.pending_msg = None;
        }
        result
    }

    fn try_next_op(&mut self) -> Result<Option<ProtocolOp>> {
        if self.pending_msg.is_none() {
            let line = match self.take_control_line()? {
                Some(line) => line,
                None => return Ok(None),
            };

            match parse_control_line(&line)? {
                ControlLine::Op(op) => return Ok(Some(op)),
                ControlLine::MsgHeader(args) => {
                    if self.max_payload > 0 && args.size > self.max_payload {
                        return Err(NatsError::Protocol(format!("MSG payload of {} bytes exceeds the maximum of {}", args.size, self.max_payload)));
                    }
                    self.pending_msg = Some(args);
                }
            }
        }

        self.try_msg_payload()
    }

    fn take_control_line(&mut self) -> Result<Option<String>> {
        let eol = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                if self.buf.len() > MAX_CONTROL_LINE_SIZE {
                    return Err(NatsError::Protocol(format!("control line exceeds maximum of {} bytes", MAX_CONTROL_LINE_SIZE)));
                }
                return Ok(None);
            }
        };
        if eol > MAX_CONTROL_LINE_SIZE {
            return Err(NatsError::Protocol(format!("control line exceeds maximum of {} bytes", MAX_CONTROL_LINE_SIZE)));
        }

        let line = self.buf.split_to(eol + 1);
        let raw: &[u8] = &line;
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| NatsError::Protocol("control line is not valid UTF-8".to_string()))
    }

    fn try_msg_payload(&mut self) -> Result<Option<ProtocolOp>> {
        let size = match &self.pending_msg {
            Some(args) => args.size,
            None => return Ok(None),
        };

        let framed_size = size.checked_add(2)
            .ok_or_else(|| NatsError::Protocol(format!("MSG payload size {} is out of range", size)))?;

        if self.buf.len() < framed_size {
            trace!("waiting for payload: {} of {} bytes buffered", self.buf.len(), framed_size);
            return Ok(None);
        }
        if &self.buf[size..framed_size] != b"\r\n" {
            return Err(NatsError::Protocol(format!("message payload does not match announced length of {} bytes", size)));
        }

        let payload = self.buf.split_to(size).freeze();
        self.buf.advance(2);

        match self.pending_msg.take() {
            Some(args) => Ok(Some(ProtocolOp::Msg { args, payload })),
            None => Ok(None),
        }
    }
}

enum ControlLine {
    Op(ProtocolOp),
    MsgHeader(MsgArgs),
}

fn parse_control_line(line: &str) -> Result<ControlLine> {
    let trimmed = line.trim_start();
    let (verb, rest) = match trimmed.find(|c: char| c == ' ' || c == '\t') {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim()),
        None => (trimmed, ""),
    };

    if verb.eq_ignore_ascii_case("MSG") {
        return parse_msg_args(rest).map(ControlLine::MsgHeader);
    }

    let op = if verb.eq_ignore_ascii_case("PING") {
        ProtocolOp::Ping
    }
    else if verb.eq_ignore_ascii_case("PONG") {
        ProtocolOp::Pong
    }
    else if verb.eq_ignore_ascii_case("+OK") {
        ProtocolOp::Ok
    }
    else if verb.eq_ignore_ascii_case("-ERR") {
        ProtocolOp::Err(unquote(rest).to_string())
    }
    else if verb.eq_ignore_ascii_case("INFO") {
        ProtocolOp::Info(ServerInfo::parse_json(rest)?)
    }
    else {
        return Err(NatsError::Protocol(format!("unknown protocol operation: {}", verb)));
    };
    Ok(ControlLine::Op(op))
}

fn parse_msg_args(rest: &str) -> Result<MsgArgs> {
    let args = rest.split_ascii_whitespace().collect::<Vec<_>>();
    let (subject, sid, reply_to, size) = match args.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply_to, size] => (*subject, *sid, Some(reply_to.to_string()), *size),
        _ => return Err(NatsError::Protocol(format!("malformed MSG arguments: '{}'", rest))),
    };

    let sid = sid.parse::<u64>()
        .map_err(|_| NatsError::Protocol(format!("malformed sid in MSG: '{}'", sid)))?;
    let size = size.parse::<usize>()
        .map_err(|_| NatsError::Protocol(format!("malformed size in MSG: '{}'", size)))?;

    Ok(MsgArgs {
        subject: subject.to_string(),
        sid,
        reply_to,
        size,
    })
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s)
}

/// Iterator over the operations that are complete after [ProtocolParser::feed]. It yields at
///  most one error, and nothing after it.
pub struct ParsedOps<'a> {
    parser: &'a mut ProtocolParser,
    done: bool,
}

impl Iterator for ParsedOps<'_> {
    type Item = Result<ProtocolOp>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.parser.next_op() {
            Ok(Some(op)) => Some(Ok(op)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for ParsedOps<'_> {}
