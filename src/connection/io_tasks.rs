//! The per-connection tasks: a reader feeding the parser and routing the resulting ops, a
//!  writer draining the outbound buffer, and a pinger for keep-alive and stale detection.
//!
//! All of them belong to one physical connection (identified by its generation). They stop
//!  when the connection they belong to is replaced or closed.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::connection::connection::ConnectionInner;
use crate::connection::connection_events::{AsyncErrorData, ConnectionEvent, ServersDiscoveredData};
use crate::connection::connection_state::ConnectionState;
use crate::error::{NatsError, Result};
use crate::protocol::client_ops::{put_ping, put_pong};
use crate::protocol::parser::ProtocolParser;
use crate::protocol::protocol_op::ProtocolOp;
use crate::subscription::pending_queue::DeliverOutcome;
use crate::transport::BoxedStream;

const READ_BUF_SIZE: usize = 32 * 1024;

pub(crate) async fn run_reader(inner: Arc<ConnectionInner>, generation: u64, mut reader: ReadHalf<BoxedStream>, mut parser: ProtocolParser) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        // the handshake may have left complete ops in the parser, so drain before reading
        loop {
            match parser.next_op() {
                Ok(Some(op)) => {
                    if let ProtocolOp::Info(info) = &op {
                        parser.set_max_payload(info.max_payload);
                    }
                    if let Err(e) = inner.process_op(generation, op) {
                        inner.handle_transport_failure(generation, e);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error: {}", e);
                    inner.handle_transport_failure(generation, e);
                    return;
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("connection closed by server");
                inner.handle_transport_failure(generation, NatsError::Disconnected);
                return;
            }
            Ok(n) => parser.extend(&buf[..n]),
            Err(e) => {
                debug!("read failed: {}", e);
                inner.handle_transport_failure(generation, e.into());
                return;
            }
        }
    }
}

pub(crate) async fn run_writer(inner: Arc<ConnectionInner>, generation: u64, mut writer: WriteHalf<BoxedStream>) {
    loop {
        let notified = inner.flush_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (data, closing) = {
            let mut core = inner.core.lock();
            if core.generation != generation {
                return;
            }
            match core.state {
                ConnectionState::Connected => (core.outbound.split().freeze(), false),
                ConnectionState::Closed => (core.outbound.split().freeze(), true),
                _ => return,
            }
        };

        if !data.is_empty() {
            trace!("=> {} bytes", data.len());
            let written = match writer.write_all(&data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                debug!("write failed: {}", e);
                if !closing {
                    inner.handle_transport_failure(generation, e.into());
                }
                return;
            }
        }

        if closing {
            let _ = writer.shutdown().await;
            debug!("writer finished");
            return;
        }

        notified.await;
    }
}

pub(crate) async fn run_pinger(inner: Arc<ConnectionInner>, generation: u64) {
    let period = inner.options.ping_interval;
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let stale = {
            let mut core = inner.core.lock();
            if core.generation != generation || core.state != ConnectionState::Connected {
                return;
            }
            if core.pings_out >= inner.options.max_pings_out {
                true
            }
            else {
                core.pings_out += 1;
                core.pongs.push_back(None);
                put_ping(&mut core.outbound);
                false
            }
        };

        if stale {
            warn!("no PONG for {} PINGs, connection is stale", inner.options.max_pings_out);
            inner.handle_transport_failure(generation, NatsError::StaleConnection);
            return;
        }
        trace!("=> PING");
        inner.flush_signal.notify_one();
    }
}

impl ConnectionInner {
    /// Routes a single op received in steady state. An error means that the physical
    ///  connection must be abandoned.
    pub(crate) fn process_op(&self, generation: u64, op: ProtocolOp) -> Result<()> {
        match op {
            ProtocolOp::Msg { args, payload } => {
                let sid = args.sid;
                self.stats.on_inbound(payload.len());

                let subscription = self.core.lock().subscriptions.get(&sid).cloned();
                let Some(subscription) = subscription else {
                    trace!("message for unknown sid {} discarded", sid);
                    return Ok(());
                };

                if let DeliverOutcome::Dropped { first_in_episode } = subscription.deliver(args, payload)? {
                    if first_in_episode {
                        warn!("slow consumer on subscription {} ({}), dropping messages", sid, subscription.subject());
                        self.events.send_event(ConnectionEvent::AsyncError(AsyncErrorData {
                            sid: Some(sid),
                            error: NatsError::SlowConsumer { sid },
                        }));
                    }
                }
            }
            ProtocolOp::Ping => {
                trace!("<= PING");
                {
                    let mut core = self.core.lock();
                    if core.generation != generation {
                        return Ok(());
                    }
                    put_pong(&mut core.outbound);
                }
                self.flush_signal.notify_one();
            }
            ProtocolOp::Pong => {
                trace!("<= PONG");
                let waiter = {
                    let mut core = self.core.lock();
                    core.pings_out = 0;
                    core.pongs.pop_front()
                };
                if let Some(Some(waiter)) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            ProtocolOp::Ok => trace!("<= +OK"),
            ProtocolOp::Info(info) => {
                trace!("<= {}", info);
                let added = {
                    let mut core = self.core.lock();
                    let added = core.pool.merge_discovered(info.connect_urls());
                    core.server_info = info;
                    added
                };
                if !added.is_empty() {
                    debug!("servers discovered: {:?}", added);
                    self.events.send_event(ConnectionEvent::ServersDiscovered(ServersDiscoveredData { urls: added }));
                }
            }
            ProtocolOp::Err(reason) => self.process_server_error(&reason)?,
        }
        Ok(())
    }

    fn process_server_error(&self, reason: &str) -> Result<()> {
        let error = NatsError::from_server_reason(reason);
        self.core.lock().last_error = Some(error.clone());

        match error {
            NatsError::Authorization(_) | NatsError::StaleConnection => {
                warn!("server error '{}', abandoning connection", reason);
                Err(error)
            }
            _ => {
                if reason.to_ascii_lowercase().contains("slow consumer") {
                    warn!("server reports this client as a slow consumer");
                }
                else {
                    warn!("server error: {}", reason);
                }
                self.events.send_event(ConnectionEvent::AsyncError(AsyncErrorData {
                    sid: None,
                    error,
                }));
                Ok(())
            }
        }
    }
}
