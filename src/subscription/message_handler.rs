use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use crate::message::Message;
use crate::subscription::subscription::SubscriptionState;

/// Callback for asynchronous subscriptions. Messages of a single subscription are passed to
///  the handler one at a time and in the order they were received.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, msg: Message);
}

#[async_trait]
impl<F> MessageHandler for F
where F: Fn(Message) + Send + Sync + 'static
{
    async fn on_message(&self, msg: Message) {
        (self)(msg)
    }
}

/// Drains a subscription's pending queue into its handler until the subscription is closed
pub(crate) fn spawn_handler_loop(state: Arc<SubscriptionState>, handler: Arc<dyn MessageHandler>) -> JoinHandle<()> {
    let span = tracing::debug_span!("handler", sid = state.sid(), subject = state.subject());
    tokio::spawn(async move {
        loop {
            match state.next().await {
                Ok(msg) => handler.on_message(msg).await,
                Err(e) => {
                    debug!("stopping message handler: {}", e);
                    break;
                }
            }
        }
    }.instrument(span))
}
