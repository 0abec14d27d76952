use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use rustnats::connection::connection_events::{AsyncErrorData, ConnectionEventHandler, DisconnectedData, ReconnectedData};
use rustnats::{Connection, ConnectionOptions, NatsError};
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    /// server URLs, e.g. nats://localhost:4222
    #[clap(long)]
    server: Vec<String>,

    #[clap(long)]
    name: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// publish a number of messages to a subject
    Pub {
        subject: String,
        payload: String,
        #[clap(long, default_value_t = 1)]
        count: usize,
    },
    /// print messages on a subject until interrupted
    Sub {
        subject: String,
        #[clap(long)]
        queue: Option<String>,
    },
    /// send a request and print the reply
    Request {
        subject: String,
        payload: String,
        #[clap(long, default_value_t = 2000)]
        timeout_millis: u64,
    },
}

struct LoggingEventHandler;

#[async_trait]
impl ConnectionEventHandler for LoggingEventHandler {
    async fn on_disconnected(&self, data: &DisconnectedData) {
        warn!("disconnected from {}: {:?}", data.url, data.error);
    }

    async fn on_reconnected(&self, data: &ReconnectedData) {
        info!("reconnected to {}", data.url);
    }

    async fn on_closed(&self) {
        info!("connection closed");
    }

    async fn on_async_error(&self, data: &AsyncErrorData) {
        warn!("asynchronous error: {}", data.error);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut options = ConnectionOptions::new(args.server);
    options.name = args.name;
    options.add_event_handler(Arc::new(LoggingEventHandler));

    let conn = Connection::connect(options).await?;
    info!("connected to {:?}", conn.connected_url());

    match args.command {
        Command::Pub { subject, payload, count } => {
            for _ in 0..count {
                conn.publish(&subject, None, payload.as_bytes())?;
            }
            conn.flush(Duration::from_secs(5)).await?;
            info!("published {} messages to {}", count, subject);
        }
        Command::Sub { subject, queue } => {
            let sub = match &queue {
                Some(queue) => conn.queue_subscribe(&subject, queue)?,
                None => conn.subscribe(&subject)?,
            };
            loop {
                match sub.next_message(Duration::from_secs(3600)).await {
                    Ok(msg) => println!("{}", msg),
                    Err(NatsError::Timeout) => {}
                    Err(e) => return Err(anyhow!("subscription ended: {}", e)),
                }
            }
        }
        Command::Request { subject, payload, timeout_millis } => {
            let reply = conn.request(&subject, payload.as_bytes(), Duration::from_millis(timeout_millis)).await?;
            println!("{}", String::from_utf8_lossy(reply.payload()));
        }
    }

    conn.close().await;
    Ok(())
}
