//! Roomfeed terminal client.
//!
//! Tails one chat room: prints the recent history, then every new message
//! and connection change as it happens. Each line read from stdin is sent to
//! the room.
//!
//! # Usage
//!
//! ```bash
//! roomfeed --server ws://localhost:8000 \
//!          --api http://localhost:8000/api/community \
//!          --room general --user ada --name Ada
//! ```

mod render;

use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use roomfeed_client::{
    Author, SyncClient, SyncConfig, SyncError, SystemEnv, history_http::HttpHistoryApi,
    websocket::WebSocketTransport,
};
use roomfeed_proto::RoomId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::render::{FeedPrinter, format_status};

/// Roomfeed terminal client
#[derive(Parser, Debug)]
#[command(name = "roomfeed")]
#[command(about = "Tail a chat room and send messages from stdin")]
#[command(version)]
struct Args {
    /// WebSocket base URL of the live endpoint
    #[arg(short, long, default_value = "ws://localhost:8000")]
    server: String,

    /// Base URL of the history API
    #[arg(short, long, default_value = "http://localhost:8000/api/community")]
    api: String,

    /// Room to join
    #[arg(short, long, default_value = "general")]
    room: String,

    /// Messages loaded on join
    #[arg(long, default_value = "50")]
    page_size: usize,

    /// Seconds to wait for a message confirmation
    #[arg(long, default_value = "10")]
    send_timeout: u64,

    /// User id stamped on sent messages
    #[arg(short, long, default_value = "anonymous")]
    user: String,

    /// Display name (defaults to the user id)
    #[arg(short, long)]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // Logs go to stderr so they never interleave with the feed
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let display_name = args.name.clone().unwrap_or_else(|| args.user.clone());
    let config = SyncConfig {
        author: Author::new(args.user.clone(), display_name),
        history_page_size: args.page_size,
        send_timeout: Duration::from_secs(args.send_timeout),
        ..SyncConfig::default()
    };

    tracing::info!(server = %args.server, api = %args.api, room = %args.room, "Starting");

    let client = SyncClient::new(
        SystemEnv::new(),
        HttpHistoryApi::new(args.api),
        WebSocketTransport::new(args.server),
        config,
    );
    let mut handle = client.subscribe(RoomId::new(args.room));

    let printer = Arc::new(Mutex::new(FeedPrinter::default()));
    handle.on_change(move |snapshot| {
        let lines = match printer.lock() {
            Ok(mut printer) => printer.render(snapshot),
            Err(poisoned) => poisoned.into_inner().render(snapshot),
        };
        emit(&lines);
    });
    handle.on_status(|status| emit(&[format_status(status)]));
    handle.on_failure(|error| {
        if error.is_resendable() {
            emit(&[format!("-- {error}, resend if needed")]);
        } else {
            emit(&[format!("-- {error}")]);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match handle.send(&line) {
                    Ok(nonce) => tracing::debug!(%nonce, "Queued message"),
                    Err(SyncError::EmptyBody) => {},
                    Err(e) => {
                        tracing::warn!(error = %e, "Send rejected");
                        break;
                    },
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn emit(lines: &[String]) {
    let mut out = std::io::stdout().lock();
    for line in lines {
        if writeln!(out, "{line}").is_err() {
            return;
        }
    }
}
