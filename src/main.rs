use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticket_relay::dispatch::{AlertAggregator, LogAlertSink, RelayConfig};
use ticket_relay::relay::{DestinationConfig, Producer, Relay};
use ticket_relay::types::Task;

const USAGE: &str = "usage: ticket-relay [enqueue <destination.json>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticket_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [] => serve(config).await,
        [cmd, destination] if cmd == "enqueue" => enqueue(config, destination),
        _ => bail!(USAGE),
    }
}

/// Runs the relay until Ctrl-C.
async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let alerts = Arc::new(AlertAggregator::new(Box::new(LogAlertSink)));
    Relay::new(config, alerts).run(cancel).await?;
    Ok(())
}

/// Queues the task JSON read from stdin for the given destination.
fn enqueue(config: RelayConfig, destination: &str) -> anyhow::Result<()> {
    let destination: DestinationConfig = serde_json::from_slice(
        &std::fs::read(destination).with_context(|| format!("reading {destination}"))?,
    )
    .context("parsing destination config")?;

    let mut input = Vec::new();
    std::io::stdin().read_to_end(&mut input)?;
    let task: Task = serde_json::from_slice(&input).context("parsing task from stdin")?;

    let id = Producer::new(&config.queues_dir).enqueue_task(&destination, &task)?;
    println!("{id}");
    Ok(())
}
