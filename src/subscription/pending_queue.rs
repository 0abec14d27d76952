use std::collections::VecDeque;

use crate::error::{NatsError, Result};
use crate::message::Message;

pub const DEFAULT_MAX_PENDING_MSGS: usize = 65536;
pub const DEFAULT_MAX_PENDING_BYTES: usize = 65536 * 1024;

/// What happened to a message offered to a [PendingQueue]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliverOutcome {
    Accepted,
    /// The message would have exceeded a pending limit and was dropped. `first_in_episode` is
    ///  true if the subscription was not in slow-consumer state before.
    Dropped { first_in_episode: bool },
    /// the auto-unsubscribe threshold was already reached; not counted as dropped
    PastMax,
    Closed,
}

/// A point-in-time copy of a subscription's counters
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SubscriptionStats {
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    pub pending_msgs_limit: usize,
    pub pending_bytes_limit: usize,
    pub dropped: u64,
    pub delivered: u64,
    pub slow_consumer: bool,
    /// auto-unsubscribe threshold, 0 for unlimited
    pub max: u64,
}

/// The bounded FIFO buffer between the connection's reader and a subscription's consumer.
///
/// Capacity is bounded both by message count and by accumulated payload size. Only payload
///  bytes are counted, subject and reply-to are not.
#[derive(Debug)]
pub struct PendingQueue {
    messages: VecDeque<Message>,
    pending_bytes: usize,
    pending_msgs_limit: usize,
    pending_bytes_limit: usize,
    max_pending_msgs: usize,
    max_pending_bytes: usize,
    dropped: u64,
    slow_consumer: bool,
    /// number of messages offered from the wire, whether accepted or not
    received: u64,
    delivered: u64,
    max: u64,
    closed: bool,
}

impl PendingQueue {
    pub fn new(pending_msgs_limit: usize, pending_bytes_limit: usize) -> Result<PendingQueue> {
        validate_limits(pending_msgs_limit, pending_bytes_limit)?;

        Ok(PendingQueue {
            messages: Default::default(),
            pending_bytes: 0,
            pending_msgs_limit,
            pending_bytes_limit,
            max_pending_msgs: 0,
            max_pending_bytes: 0,
            dropped: 0,
            slow_consumer: false,
            received: 0,
            delivered: 0,
            max: 0,
            closed: false,
        })
    }

    pub fn deliver(&mut self, msg: Message) -> DeliverOutcome {
        if self.closed {
            return DeliverOutcome::Closed;
        }

        self.received += 1;
        if self.max > 0 && self.received > self.max {
            return DeliverOutcome::PastMax;
        }

        let len = msg.payload().len();
        if self.messages.len() + 1 > self.pending_msgs_limit || self.pending_bytes + len > self.pending_bytes_limit {
            self.dropped += 1;
            let first_in_episode = !self.slow_consumer;
            self.slow_consumer = true;
            return DeliverOutcome::Dropped { first_in_episode };
        }

        self.messages.push_back(msg);
        self.pending_bytes += len;
        self.max_pending_msgs = self.max_pending_msgs.max(self.messages.len());
        self.max_pending_bytes = self.max_pending_bytes.max(self.pending_bytes);
        self.slow_consumer = false;
        DeliverOutcome::Accepted
    }

    /// Removes the oldest message. Fails if the queue was closed, returns `Ok(None)` if it is
    ///  empty.
    pub fn pop(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Err(NatsError::BadSubscription);
        }

        let msg = self.messages.pop_front();
        if let Some(msg) = &msg {
            self.pending_bytes -= msg.payload().len();
            self.delivered += 1;
        }
        Ok(msg)
    }

    /// True if the auto-unsubscribe threshold was reached and everything the server will
    ///  ever send for it was consumed
    pub fn is_exhausted(&self) -> bool {
        self.max > 0 && self.received >= self.max && self.messages.is_empty()
    }

    /// Closes the queue, discarding buffered messages. Returns false if it was closed already.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.messages.clear();
        self.pending_bytes = 0;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_max(&mut self, max: u64) -> Result<()> {
        if self.closed {
            return Err(NatsError::BadSubscription);
        }
        self.max = max;
        Ok(())
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// messages the server still has to deliver before the auto-unsubscribe threshold is
    ///  reached, `None` if there is no threshold
    pub fn remaining(&self) -> Option<u64> {
        if self.max == 0 {
            None
        }
        else {
            Some(self.max.saturating_sub(self.received))
        }
    }

    pub fn set_pending_limits(&mut self, msgs: usize, bytes: usize) -> Result<()> {
        if self.closed {
            return Err(NatsError::BadSubscription);
        }
        validate_limits(msgs, bytes)?;
        self.pending_msgs_limit = msgs;
        self.pending_bytes_limit = bytes;
        Ok(())
    }

    pub fn clear_max_pending(&mut self) -> Result<()> {
        if self.closed {
            return Err(NatsError::BadSubscription);
        }
        self.max_pending_msgs = 0;
        self.max_pending_bytes = 0;
        Ok(())
    }

    pub fn stats(&self) -> Result<SubscriptionStats> {
        if self.closed {
            return Err(NatsError::BadSubscription);
        }
        Ok(SubscriptionStats {
            pending_msgs: self.messages.len(),
            pending_bytes: self.pending_bytes,
            max_pending_msgs: self.max_pending_msgs,
            max_pending_bytes: self.max_pending_bytes,
            pending_msgs_limit: self.pending_msgs_limit,
            pending_bytes_limit: self.pending_bytes_limit,
            dropped: self.dropped,
            delivered: self.delivered,
            slow_consumer: self.slow_consumer,
            max: self.max,
        })
    }
}

fn validate_limits(msgs: usize, bytes: usize) -> Result<()> {
    if msgs == 0 {
        return Err(NatsError::InvalidConfig("pending message limit cannot be zero".to_string()));
    }
    if bytes == 0 {
        return Err(NatsError::InvalidConfig("pending bytes limit cannot be zero".to_string()));
    }
    Ok(())
}
