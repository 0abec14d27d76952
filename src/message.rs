use std::fmt::{Debug, Display, Formatter};
use std::sync::Weak;

use bytes::Bytes;

use crate::error::{NatsError, Result};
use crate::protocol::protocol_op::MsgArgs;
use crate::subscription::subscription::{Subscription, SubscriptionState};

const MAX_DISPLAYED_PAYLOAD: usize = 32;

/// A message as published by the application, or as received on a subscription.
///
/// A received message keeps a weak back-reference to the subscription it was delivered on.
///  It does not keep the subscription alive: once the subscription is gone,
///  [Message::subscription] returns `None`.
#[derive(Clone)]
pub struct Message {
    subject: String,
    reply_to: Option<String>,
    payload: Bytes,
    sid: Option<u64>,
    subscription: Weak<SubscriptionState>,
}

impl Message {
    /// Creates a message for publishing. An empty reply-to is the same as no reply-to.
    pub fn new(subject: &str, reply_to: Option<&str>, payload: impl Into<Bytes>) -> Result<Message> {
        validate_subject(subject)?;
        let reply_to = match reply_to {
            Some("") | None => None,
            Some(r) => {
                validate_subject(r)?;
                Some(r.to_string())
            }
        };

        Ok(Message {
            subject: subject.to_string(),
            reply_to,
            payload: payload.into(),
            sid: None,
            subscription: Weak::new(),
        })
    }

    /// Creates a message from a parsed `MSG` line and the payload bytes that followed it. The
    ///  payload must have exactly the size announced in the `MSG` line.
    pub fn from_wire(args: MsgArgs, payload: Bytes, subscription: Weak<SubscriptionState>) -> Result<Message> {
        if payload.len() < args.size {
            return Err(NatsError::Protocol("source buffer smaller than requested copy length".to_string()));
        }
        if payload.len() > args.size {
            return Err(NatsError::Protocol("requested copy length larger than declared size".to_string()));
        }

        Ok(Message {
            subject: args.subject,
            reply_to: args.reply_to.filter(|r| !r.is_empty()),
            payload,
            sid: Some(args.sid),
            subscription,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The subscription id this message was delivered on, `None` for messages created locally
    pub fn sid(&self) -> Option<u64> {
        self.sid
    }

    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription.upgrade()
            .map(Subscription::from_state)
    }
}

/// Subjects must be non-empty and must not contain whitespace, since whitespace separates
///  the arguments of a protocol line.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.chars().any(|c| c.is_whitespace()) {
        return Err(NatsError::InvalidSubject);
    }
    Ok(())
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{Subject={};Reply={};Payload=<", self.subject, self.reply_to.as_deref().unwrap_or(""))?;
        if self.payload.len() > MAX_DISPLAYED_PAYLOAD {
            write!(f, "{}{} more bytes",
                   String::from_utf8_lossy(&self.payload[..MAX_DISPLAYED_PAYLOAD]),
                   self.payload.len() - MAX_DISPLAYED_PAYLOAD,
            )?;
        }
        else {
            write!(f, "{}", String::from_utf8_lossy(&self.payload))?;
        }
        write!(f, ">}}")
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply_to", &self.reply_to)
            .field("sid", &self.sid)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
