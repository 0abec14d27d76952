use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{NatsError, Result};
use crate::message::Message;
use crate::protocol::protocol_op::MsgArgs;
use crate::subscription::pending_queue::{DeliverOutcome, PendingQueue, SubscriptionStats};

/// The side of the connection that a subscription talks back to: the subscription registry
///  and the outbound protocol stream.
#[cfg_attr(test, automock)]
pub trait SubscriptionOwner: Send + Sync {
    /// Sends `UNSUB <sid> [max]`. With `max == 0`, the subscription is also removed from the
    ///  registry.
    fn unsubscribe(&self, sid: u64, max: u64) -> Result<()>;

    /// Removes a subscription from the registry without telling the server, after the server
    ///  delivered all messages of an auto-unsubscribe
    fn forget(&self, sid: u64);
}

/// State shared between the connection's reader (the producer), the registry and the
///  application's [Subscription] handles (consumers).
pub struct SubscriptionState {
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    is_async: bool,
    queue: Mutex<PendingQueue>,
    notify: Notify,
    owner: Weak<dyn SubscriptionOwner>,
}

impl SubscriptionState {
    pub(crate) fn new(
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
        pending_limits: (usize, usize),
        is_async: bool,
        owner: Weak<dyn SubscriptionOwner>,
    ) -> Result<Arc<SubscriptionState>> {
        let (pending_msgs_limit, pending_bytes_limit) = pending_limits;
        Ok(Arc::new(SubscriptionState {
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(|s| s.to_string()),
            is_async,
            queue: Mutex::new(PendingQueue::new(pending_msgs_limit, pending_bytes_limit)?),
            notify: Notify::new(),
            owner,
        }))
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Offers a message received from the wire. Never blocks on the consumer.
    pub(crate) fn deliver(self: &Arc<Self>, args: MsgArgs, payload: Bytes) -> Result<DeliverOutcome> {
        let msg = Message::from_wire(args, payload, Arc::downgrade(self))?;

        let (outcome, exhausted) = {
            let mut queue = self.queue.lock();
            let outcome = queue.deliver(msg);
            let exhausted = outcome != DeliverOutcome::Accepted && queue.is_exhausted() && queue.close();
            (outcome, exhausted)
        };

        match outcome {
            DeliverOutcome::Accepted => self.notify.notify_waiters(),
            DeliverOutcome::Closed => trace!("message for closed subscription {} discarded", self.sid),
            _ => {}
        }
        if exhausted {
            self.on_exhausted();
        }
        Ok(outcome)
    }

    /// Waits for the next message without a deadline
    pub(crate) async fn next(&self) -> Result<Message> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (msg, exhausted) = {
                let mut queue = self.queue.lock();
                let msg = queue.pop()?;
                let exhausted = msg.is_some() && queue.is_exhausted() && queue.close();
                (msg, exhausted)
            };
            if exhausted {
                self.on_exhausted();
            }
            if let Some(msg) = msg {
                return Ok(msg);
            }

            notified.await;
        }
    }

    fn on_exhausted(&self) {
        debug!("subscription {} reached its auto-unsubscribe limit", self.sid);
        self.notify.notify_waiters();
        if let Some(owner) = self.owner.upgrade() {
            owner.forget(self.sid);
        }
    }

    /// Closes the subscription without talking to the server, e.g. because the connection
    ///  closed. Returns false if it was closed already.
    pub(crate) fn close_local(&self) -> bool {
        let closed = self.queue.lock().close();
        if closed {
            self.notify.notify_waiters();
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().is_closed()
    }

    /// UNSUB threshold to replay after a reconnect: `None` for no threshold
    pub(crate) fn remaining(&self) -> Option<u64> {
        self.queue.lock().remaining()
    }
}

impl Debug for SubscriptionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// The application's handle to a subscription. Handles are cheap to clone, and all clones
///  refer to the same subscription.
///
/// Dropping a handle does *not* unsubscribe: the subscription stays registered with the
///  connection until [Subscription::unsubscribe] or [Subscription::close] is called, or the
///  connection is closed.
#[derive(Clone, Debug)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn from_state(state: Arc<SubscriptionState>) -> Subscription {
        Subscription { state }
    }

    pub fn sid(&self) -> u64 {
        self.state.sid
    }

    pub fn subject(&self) -> &str {
        &self.state.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.state.queue_group()
    }

    pub fn is_valid(&self) -> bool {
        !self.state.is_closed()
    }

    /// Returns the oldest pending message, waiting up to `timeout` for one to arrive.
    ///
    /// Not available for subscriptions with a message handler.
    pub async fn next_message(&self, timeout: Duration) -> Result<Message> {
        if self.state.is_async {
            return Err(NatsError::AsyncSubscription);
        }
        match tokio::time::timeout(timeout, self.state.next()).await {
            Ok(result) => result,
            Err(_) => Err(NatsError::Timeout),
        }
    }

    /// Removes interest in the subject. Fails with [NatsError::BadSubscription] if the
    ///  subscription is closed already.
    pub fn unsubscribe(&self) -> Result<()> {
        if !self.state.close_local() {
            return Err(NatsError::BadSubscription);
        }
        debug!("unsubscribing {} ({})", self.state.sid, self.state.subject);
        match self.state.owner.upgrade() {
            Some(owner) => owner.unsubscribe(self.state.sid, 0),
            None => Ok(()),
        }
    }

    /// Like [Subscription::unsubscribe], but closing an already closed subscription is a
    ///  no-op
    pub fn close(&self) {
        if self.state.close_local() {
            if let Some(owner) = self.state.owner.upgrade() {
                let _ = owner.unsubscribe(self.state.sid, 0);
            }
        }
    }

    /// Asks the server to stop delivering after a total of `max` messages. The subscription
    ///  closes when the last of them was consumed. `max == 0` unsubscribes immediately.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        if max == 0 {
            return self.unsubscribe();
        }

        let already_done = {
            let mut queue = self.state.queue.lock();
            queue.set_max(max)?;
            queue.is_exhausted() && queue.close()
        };

        if already_done {
            self.state.notify.notify_waiters();
        }

        let Some(owner) = self.state.owner.upgrade() else {
            return Ok(());
        };
        if already_done {
            owner.unsubscribe(self.state.sid, 0)
        }
        else {
            owner.unsubscribe(self.state.sid, max)
        }
    }

    pub fn stats(&self) -> Result<SubscriptionStats> {
        self.state.queue.lock().stats()
    }

    pub fn set_pending_limits(&self, msgs: usize, bytes: usize) -> Result<()> {
        self.state.queue.lock().set_pending_limits(msgs, bytes)
    }

    /// resets the high-water marks for pending messages and bytes
    pub fn clear_max_pending(&self) -> Result<()> {
        self.state.queue.lock().clear_max_pending()
    }
}
