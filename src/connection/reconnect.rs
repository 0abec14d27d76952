//! Installing a physical connection after a successful handshake, detecting its loss, and
//!  finding a replacement.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::connection::connection::ConnectionInner;
use crate::connection::connection_events::{ConnectionEvent, DisconnectedData, ReconnectedData, ServersDiscoveredData};
use crate::connection::connection_state::ConnectionState;
use crate::connection::handshake::{perform_handshake, Handshake};
use crate::connection::io_tasks::{run_pinger, run_reader, run_writer};
use crate::error::NatsError;
use crate::protocol::client_ops::{put_sub, put_unsub};

impl ConnectionInner {
    /// Makes a connection that completed the handshake the live one. For a reconnect, the
    ///  subscriptions are re-sent first, followed by everything buffered while reconnecting.
    ///
    /// Returns false if the connection was closed in the meantime, in which case the new
    ///  physical connection is dropped.
    pub(crate) fn establish(self: &Arc<Self>, handshake: Handshake, is_reconnect: bool) -> bool {
        let Handshake { endpoint, stream, parser, info } = handshake;
        let url = endpoint.url();

        let added = {
            let mut core = self.core.lock();
            if core.state.is_closed() {
                return false;
            }

            core.generation += 1;
            let generation = core.generation;

            let added = core.pool.merge_discovered(info.connect_urls());
            core.server_info = info;
            core.pool.reset_reconnect_attempts();
            if let Some(current) = core.pool.current_endpoint_mut() {
                current.did_connect = true;
            }
            core.pings_out = 0;

            if is_reconnect {
                let mut replay = BytesMut::new();
                for (sid, sub) in core.subscriptions.iter() {
                    if sub.is_closed() {
                        continue;
                    }
                    put_sub(&mut replay, sub.subject(), sub.queue_group(), *sid);
                    if let Some(remaining) = sub.remaining() {
                        put_unsub(&mut replay, *sid, remaining);
                    }
                }
                replay.extend_from_slice(&core.outbound);
                core.outbound = replay;
            }

            let (reader, writer) = tokio::io::split(stream);
            let span = tracing::info_span!("connection", url = %url, generation);
            core.tasks.push(tokio::spawn(run_reader(self.clone(), generation, reader, parser).instrument(span.clone())));
            core.tasks.push(tokio::spawn(run_pinger(self.clone(), generation).instrument(span.clone())));
            core.writer_task = Some(tokio::spawn(run_writer(self.clone(), generation, writer).instrument(span)));

            self.set_state(&mut core, ConnectionState::Connected);
            added
        };
        self.flush_signal.notify_one();

        if is_reconnect {
            info!("reconnected to {}", url);
            self.stats.on_reconnect();
            self.events.send_event(ConnectionEvent::Reconnected(ReconnectedData { url }));
        }
        else {
            info!("connected to {}", url);
        }
        if !added.is_empty() {
            self.events.send_event(ConnectionEvent::ServersDiscovered(ServersDiscoveredData { urls: added }));
        }
        true
    }

    /// Called by the connection's tasks when the physical connection is lost or must be
    ///  abandoned. Reports from tasks of an older physical connection are ignored, so this
    ///  takes effect once per physical connection.
    pub(crate) fn handle_transport_failure(self: &Arc<Self>, generation: u64, error: NatsError) {
        let (url, pongs) = {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != ConnectionState::Connected {
                return;
            }

            warn!("connection lost: {}", error);
            for task in core.tasks.drain(..) {
                task.abort();
            }
            if let Some(writer) = core.writer_task.take() {
                writer.abort();
            }

            core.pings_out = 0;
            core.last_error = Some(error.clone());
            let url = core.pool.current_endpoint()
                .map(|s| s.url())
                .unwrap_or_default();

            if self.options.allow_reconnect {
                self.set_state(&mut core, ConnectionState::Reconnecting);
            }
            (url, std::mem::take(&mut core.pongs))
        };

        for pong in pongs.into_iter().flatten() {
            let _ = pong.send(Err(NatsError::Disconnected));
        }
        self.events.send_event(ConnectionEvent::Disconnected(DisconnectedData {
            url,
            error: Some(error.clone()),
        }));

        if !self.options.allow_reconnect {
            let _ = self.begin_close(Some(error));
            return;
        }

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            inner.reconnect_loop().await
        }.instrument(tracing::info_span!("reconnect")));
        self.core.lock().tasks.push(handle);
    }

    /// Tries the servers of the pool in turn until one completes the handshake, waiting
    ///  `reconnect_wait` between attempts on the same server. Gives up and closes the connection
    ///  when no server has reconnect attempts left.
    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut core = self.core.lock();
                if core.state != ConnectionState::Reconnecting {
                    return;
                }

                match core.pool.advance_with_budget(self.options.max_reconnect_attempts) {
                    Some(endpoint) => {
                        let now = Instant::now();
                        let start = match endpoint.last_attempt {
                            Some(last) if last + self.options.reconnect_wait > now => last + self.options.reconnect_wait,
                            _ => now,
                        };
                        endpoint.reconnect_attempts += 1;
                        endpoint.last_attempt = Some(start);
                        Some((endpoint.clone(), start))
                    }
                    None => None,
                }
            };

            let Some((endpoint, start)) = next else {
                warn!("reconnect attempts exhausted, closing the connection");
                let _ = self.begin_close(Some(NatsError::NoServers));
                return;
            };

            tokio::time::sleep_until(start).await;
            if self.core.lock().state != ConnectionState::Reconnecting {
                return;
            }

            debug!("trying to reconnect to {} (attempt {})", endpoint, endpoint.reconnect_attempts);
            match perform_handshake(self.transport.as_ref(), &endpoint, &self.options).await {
                Ok(handshake) => {
                    self.establish(handshake, true);
                    return;
                }
                Err(e) => {
                    if e.is_authorization() {
                        warn!("{} rejected the credentials, trying the next server", endpoint);
                    }
                    else {
                        debug!("reconnecting to {} failed: {}", endpoint, e);
                    }
                    self.core.lock().last_error = Some(e);
                }
            }
        }
    }
}
