use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::connection_events::{AsyncErrorData, ConnectionEvent, ConnectionEventHandler, DisconnectedData, ReconnectedData, ServersDiscoveredData};
use crate::error::NatsError;

/// A [ConnectionEventHandler] that records every callback it receives, for later assertions
#[derive(Default)]
pub struct TrackingEventHandler {
    tracker: Mutex<Vec<ConnectionEvent>>,
    changed: Notify,
}

impl TrackingEventHandler {
    fn track(&self, event: ConnectionEvent) {
        self.tracker.lock().push(event);
        self.changed.notify_waiters();
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.tracker.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.tracker.lock().iter()
            .filter(|e| matches!(e, ConnectionEvent::Disconnected(_)))
            .count()
    }

    pub fn reconnected_urls(&self) -> Vec<String> {
        self.tracker.lock().iter()
            .filter_map(|e| match e {
                ConnectionEvent::Reconnected(data) => Some(data.url.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.tracker.lock().iter()
            .filter(|e| matches!(e, ConnectionEvent::Closed))
            .count()
    }

    pub fn async_errors(&self) -> Vec<NatsError> {
        self.tracker.lock().iter()
            .filter_map(|e| match e {
                ConnectionEvent::AsyncError(data) => Some(data.error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn discovered_urls(&self) -> Vec<String> {
        self.tracker.lock().iter()
            .flat_map(|e| match e {
                ConnectionEvent::ServersDiscovered(data) => data.urls.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Waits until the recorded events satisfy `condition`
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&[ConnectionEvent]) -> bool) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let satisfied = condition(&self.tracker.lock());
            if satisfied {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                bail!("expected events did not arrive within {:?}, got {:?}", timeout, self.events());
            }
        }
    }

    pub async fn wait_for_closed(&self, timeout: Duration) -> anyhow::Result<()> {
        self.wait_until(timeout, |events| events.iter().any(|e| matches!(e, ConnectionEvent::Closed))).await
    }

    pub async fn wait_for_reconnects(&self, num_reconnects: usize, timeout: Duration) -> anyhow::Result<()> {
        self.wait_until(timeout, |events| {
            events.iter()
                .filter(|e| matches!(e, ConnectionEvent::Reconnected(_)))
                .count() >= num_reconnects
        }).await
    }
}

#[async_trait]
impl ConnectionEventHandler for TrackingEventHandler {
    async fn on_disconnected(&self, data: &DisconnectedData) {
        self.track(ConnectionEvent::Disconnected(data.clone()));
    }

    async fn on_reconnected(&self, data: &ReconnectedData) {
        self.track(ConnectionEvent::Reconnected(data.clone()));
    }

    async fn on_closed(&self) {
        self.track(ConnectionEvent::Closed);
    }

    async fn on_async_error(&self, data: &AsyncErrorData) {
        self.track(ConnectionEvent::AsyncError(data.clone()));
    }

    async fn on_servers_discovered(&self, data: &ServersDiscoveredData) {
        self.track(ConnectionEvent::ServersDiscovered(data.clone()));
    }
}
