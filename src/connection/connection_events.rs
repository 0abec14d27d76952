use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::NatsError;

#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The connection to a server was lost and reconnecting started. Sent once per loss, and
    ///  never for a failed initial connect.
    Disconnected(DisconnectedData),
    Reconnected(ReconnectedData),
    /// The connection is closed for good, either explicitly or because the reconnect budget
    ///  is used up. This is the last event of a connection.
    Closed,
    /// A problem that does not fail any particular call, e.g. a slow consumer or an `-ERR`
    ///  from the server
    AsyncError(AsyncErrorData),
    ServersDiscovered(ServersDiscoveredData),
}

#[derive(Clone, Debug)]
pub struct DisconnectedData {
    pub url: String,
    pub error: Option<NatsError>,
}

#[derive(Clone, Debug)]
pub struct ReconnectedData {
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct AsyncErrorData {
    pub sid: Option<u64>,
    pub error: NatsError,
}

#[derive(Clone, Debug)]
pub struct ServersDiscoveredData {
    pub urls: Vec<String>,
}

/// Application callbacks for lifecycle events. Handlers run on a dedicated task, one event at
///  a time and in the order the events occurred, so a slow handler delays subsequent
///  notifications but never the connection itself.
#[async_trait]
pub trait ConnectionEventHandler: Send + Sync + 'static {
    async fn on_disconnected(&self, _data: &DisconnectedData) {}
    async fn on_reconnected(&self, _data: &ReconnectedData) {}
    async fn on_closed(&self) {}
    async fn on_async_error(&self, _data: &AsyncErrorData) {}
    async fn on_servers_discovered(&self, _data: &ServersDiscoveredData) {}
}

pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
    handler_queue: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl ConnectionEventNotifier {
    pub fn new(handlers: Vec<Arc<dyn ConnectionEventHandler>>) -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        let handler_queue = if handlers.is_empty() {
            None
        }
        else {
            let (send, recv) = mpsc::unbounded_channel();
            tokio::spawn(dispatch_to_handlers(recv, handlers));
            Some(send)
        };

        ConnectionEventNotifier {
            sender,
            handler_queue,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        if let Some(queue) = &self.handler_queue {
            let _ = queue.send(event.clone());
        }
        let _ = self.sender.send(event);
    }
}

async fn dispatch_to_handlers(mut recv: mpsc::UnboundedReceiver<ConnectionEvent>, handlers: Vec<Arc<dyn ConnectionEventHandler>>) {
    while let Some(event) = recv.recv().await {
        for handler in &handlers {
            match &event {
                ConnectionEvent::Disconnected(data) => handler.on_disconnected(data).await,
                ConnectionEvent::Reconnected(data) => handler.on_reconnected(data).await,
                ConnectionEvent::Closed => handler.on_closed().await,
                ConnectionEvent::AsyncError(data) => handler.on_async_error(data).await,
                ConnectionEvent::ServersDiscovered(data) => handler.on_servers_discovered(data).await,
            }
        }
    }
    trace!("event dispatcher finished");
}
