//! Serialization of client-to-server operations into an outbound buffer. Subjects are assumed
//!  to be validated by the caller.

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::protocol::connect_info::ConnectInfo;

pub const CRLF: &[u8] = b"\r\n";
pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

pub fn put_connect(buf: &mut BytesMut, info: &ConnectInfo) -> Result<()> {
    let json = info.to_json()?;
    buf.put_slice(b"CONNECT ");
    buf.put_slice(json.as_bytes());
    buf.put_slice(CRLF);
    Ok(())
}

pub fn put_pub(buf: &mut BytesMut, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
    buf.reserve(subject.len() + payload.len() + 32);
    buf.put_slice(b"PUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply_to) = reply_to {
        buf.put_slice(reply_to.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}

pub fn put_sub(buf: &mut BytesMut, subject: &str, queue_group: Option<&str>, sid: u64) {
    buf.put_slice(b"SUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(queue_group) = queue_group {
        buf.put_slice(queue_group.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(sid.to_string().as_bytes());
    buf.put_slice(CRLF);
}

/// `max` of 0 means 'unsubscribe now'
pub fn put_unsub(buf: &mut BytesMut, sid: u64, max: u64) {
    buf.put_slice(b"UNSUB ");
    buf.put_slice(sid.to_string().as_bytes());
    if max > 0 {
        buf.put_u8(b' ');
        buf.put_slice(max.to_string().as_bytes());
    }
    buf.put_slice(CRLF);
}

pub fn put_ping(buf: &mut BytesMut) {
    buf.put_slice(PING);
}

pub fn put_pong(buf: &mut BytesMut) {
    buf.put_slice(PONG);
}
