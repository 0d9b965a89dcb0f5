//! smsgate CLI entry point.
//!
//! Provides `run`, `dispatch`, `enqueue`, `status` and `ack` subcommands for
//! running the dispatch loop, running a single cycle, queueing a message,
//! inspecting the queue, and feeding a transport acknowledgement.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing::info;

use smsgate::config::{config_dir, load_config, GatewayConfig};
use smsgate::dispatch::{run_dispatch_loop, DispatchSettings, Dispatcher};
use smsgate::logging;
use smsgate::message::OutboundMessage;
use smsgate::receipts::{run_receipt_loop, PartEventKind, ReceiptTracker};
use smsgate::status::StatusMachine;
use smsgate::store::{MessageStore, SqliteMessageStore};
use smsgate::transport::{spawn_event_listener, HttpTransport};

/// Transport events buffered between the bridge listener and the tracker.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// smsgate: outbound SMS dispatch pipeline.
#[derive(Parser)]
#[command(name = "smsgate", version, about)]
struct Cli {
    /// Path to config.toml. Defaults to ~/.smsgate/config.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run dispatch cycles on the configured interval until interrupted.
    Run,
    /// Run a single dispatch cycle and exit.
    Dispatch,
    /// Queue a message for sending.
    Enqueue {
        /// Destination phone number.
        #[arg(long)]
        to: String,
        /// Message text.
        #[arg(long)]
        body: String,
    },
    /// Show message counts per status and recent gateway events.
    Status,
    /// Record that a whole message was sent or delivered.
    Ack {
        /// Message to acknowledge.
        message_id: String,
        /// Which acknowledgement arrived.
        #[arg(long, value_enum)]
        kind: AckKind,
    },
}

/// Acknowledgement kinds accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum AckKind {
    /// The message was sent.
    Sent,
    /// The message was delivered.
    Delivered,
}

impl From<AckKind> for PartEventKind {
    fn from(kind: AckKind) -> Self {
        match kind {
            AckKind::Sent => Self::Sent,
            AckKind::Delivered => Self::Delivered,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => handle_run(config).await,
        Command::Dispatch => {
            let _logging_guard = logging::init(None)?;
            handle_dispatch(config).await
        }
        Command::Enqueue { to, body } => {
            let _logging_guard = logging::init(None)?;
            handle_enqueue(config, to, body).await
        }
        Command::Status => {
            let _logging_guard = logging::init(None)?;
            handle_status(config).await
        }
        Command::Ack { message_id, kind } => {
            let _logging_guard = logging::init(None)?;
            handle_ack(config, &message_id, kind.into()).await
        }
    }
}

/// Load the explicit config, the default one if it exists, or defaults.
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let default_path = config_dir()?.join("config.toml");
    if default_path.exists() {
        load_config(&default_path)
    } else {
        Ok(GatewayConfig::default())
    }
}

async fn open_store(config: &GatewayConfig) -> anyhow::Result<Arc<SqliteMessageStore>> {
    let path = &config.store.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteMessageStore::open(path)
        .await
        .with_context(|| format!("failed to open message store at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn build_dispatcher(config: &GatewayConfig) -> anyhow::Result<Dispatcher> {
    let store = open_store(config).await?;
    let transport = HttpTransport::new(
        config.transport.base_url.clone(),
        Duration::from_secs(config.transport.connect_timeout_secs),
        Duration::from_secs(config.transport.request_timeout_secs),
    );
    let tokens = config.dispatch.token_source.build();
    Ok(Dispatcher::new(
        store,
        Arc::new(transport),
        DispatchSettings::from_config(config),
    )
    .with_tokens(Arc::from(tokens)))
}

/// Run the dispatch loop and the acknowledgement listener until Ctrl-C.
async fn handle_run(config: GatewayConfig) -> anyhow::Result<()> {
    let _logging_guard = logging::init(config.logging.logs_dir.as_deref())?;

    let dispatcher = Arc::new(build_dispatcher(&config).await?);
    let interval = Duration::from_secs(config.dispatch.interval_secs.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let listener_handle =
        spawn_event_listener(&config.transport.base_url, event_tx, shutdown_rx.clone());
    let receipts_handle = tokio::spawn(run_receipt_loop(dispatcher.receipts(), event_rx));
    let loop_handle = tokio::spawn(run_dispatch_loop(dispatcher, interval, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    loop_handle.await.context("dispatch loop panicked")?;
    listener_handle
        .await
        .context("transport event listener panicked")?;
    // The listener dropped its sender, so the receipt loop drains and exits.
    receipts_handle.await.context("receipt loop panicked")?;
    Ok(())
}

async fn handle_dispatch(config: GatewayConfig) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&config).await?;
    let summary = dispatcher
        .dispatch_pending()
        .await
        .context("dispatch cycle failed")?;
    println!(
        "fetched={} dispatched={} skipped={} failed={} parts={}",
        summary.fetched, summary.dispatched, summary.skipped, summary.failed, summary.parts_sent
    );
    Ok(())
}

async fn handle_enqueue(config: GatewayConfig, to: String, body: String) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let message = OutboundMessage::new(to, body);
    store
        .insert_message(&message)
        .await
        .context("failed to queue message")?;
    println!("{}", message.id);
    Ok(())
}

async fn handle_status(config: GatewayConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    for (status, count) in store.count_by_status().await? {
        println!("{status:<10} {count}");
    }
    let events = store.recent_events(10).await?;
    if !events.is_empty() {
        println!();
        for event in events {
            println!("{}  {}", event.logged_at, event.message);
        }
    }
    Ok(())
}

/// Acknowledge a message as a single part.
///
/// Part counters live in the running dispatcher, so a one-shot process can
/// only report whole-message events.
async fn handle_ack(
    config: GatewayConfig,
    message_id: &str,
    kind: PartEventKind,
) -> anyhow::Result<()> {
    let store: Arc<dyn MessageStore> = open_store(&config).await?;
    let tracker = ReceiptTracker::new(StatusMachine::new(store));
    let outcome = tracker
        .on_part_event(kind, message_id, 0, 1)
        .await
        .context("failed to record acknowledgement")?;
    println!("{outcome:?}");
    Ok(())
}
