//! # flowcast
//!
//! `flowcast serve` runs the fan-out server, optionally fed NDJSON flow
//! events on stdin. `flowcast tail` runs a reconnecting subscriber and prints
//! buffered events as they arrive.

#![deny(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flowcast_client::{SubscriberConfig, spawn_subscriber};
use flowcast_core::FlowEvent;
use flowcast_server::{FlowPublisher, FlowServer, ServerConfig};
use flowcast_settings::{FlowcastSettings, LogFormat};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Trade-flow fan-out server and subscriber.
#[derive(Parser, Debug)]
#[command(name = "flowcast", version, about = "Trade-flow fan-out server and subscriber")]
struct Cli {
    /// Settings file (default `~/.flowcast/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server.
    Serve(ServeArgs),
    /// Subscribe to a server and print flow events.
    Tail(TailArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Liveness sweep period in milliseconds.
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Maximum concurrent subscribers.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Read newline-delimited JSON flow events from stdin and publish them.
    #[arg(long)]
    feed_stdin: bool,
}

#[derive(Args, Debug, Default)]
struct TailArgs {
    /// Server `WebSocket` URL (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Only show this instrument.
    #[arg(long)]
    coin: Option<String>,
}

impl ServeArgs {
    fn server_config(&self, settings: &FlowcastSettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(&settings.server);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms.max(1);
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max.max(1);
        }
        config
    }
}

impl TailArgs {
    fn subscriber_config(&self, settings: &FlowcastSettings) -> SubscriberConfig {
        let mut config = SubscriberConfig::from_settings(&settings.client);
        if let Some(url) = &self.url {
            config.url.clone_from(url);
        }
        config.with_coin(self.coin.clone())
    }
}

fn load_settings(path: Option<&Path>) -> Result<FlowcastSettings> {
    let path = path.map_or_else(flowcast_settings::settings_path, Path::to_path_buf);
    flowcast_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn init_logging(settings: &FlowcastSettings, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&settings.logging.level);
    match settings.logging.format {
        LogFormat::Compact => flowcast_core::logging::init_subscriber(level),
        LogFormat::Json => flowcast_core::logging::init_json_subscriber(level),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    init_logging(&settings, cli.log_level.as_deref());

    match cli.command {
        Command::Serve(args) => serve(&args, &settings).await,
        Command::Tail(args) => tail(&args, &settings).await,
    }
}

async fn serve(args: &ServeArgs, settings: &FlowcastSettings) -> Result<()> {
    let config = args.server_config(settings);
    let metrics = flowcast_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = FlowServer::new(config).with_metrics(metrics);
    let handle = server.listen().await.context("Failed to start server")?;
    info!(url = %handle.ws_url(), "ready");

    let feeder = args.feed_stdin.then(|| {
        let publisher = server.publisher();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            match feed(stdin, &publisher).await {
                Ok(count) => info!(count, "stdin feed finished"),
                Err(e) => warn!(error = %e, "stdin feed failed"),
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutting down");

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    server
        .shutdown()
        .graceful_shutdown(handle.into_tasks(), Some(Duration::from_secs(10)))
        .await;
    Ok(())
}

/// Publish every parseable NDJSON line. Returns how many were published.
async fn feed<R>(reader: R, publisher: &FlowPublisher) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut published = 0;
    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_event_line(&line) else {
            continue;
        };
        publisher
            .publish(event)
            .await
            .context("Server stopped accepting events")?;
        published += 1;
    }
    Ok(published)
}

fn parse_event_line(line: &str) -> Option<FlowEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "skipping invalid flow event line");
            None
        }
    }
}

async fn tail(args: &TailArgs, settings: &FlowcastSettings) -> Result<()> {
    let config = args.subscriber_config(settings);
    let (subscriber, task) = spawn_subscriber(config).context("Invalid subscriber config")?;
    let mut status = subscriber.watch_status();
    let mut events = subscriber.watch_events();
    subscriber.enable()?;

    let mut seen: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            changed = events.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = events.borrow_and_update().clone();
                for event in fresh_events(&snapshot, &mut seen) {
                    println!("{}", serde_json::to_string(event)?);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    state = %current.state,
                    attempt = current.attempt_count,
                    coin = current.desired_coin.as_deref().unwrap_or("*"),
                    "connection state"
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = subscriber.shutdown();
    let _ = task.await;
    Ok(())
}

/// Events in `snapshot` (newest first) not printed before, oldest first.
///
/// `seen` is narrowed to the ids still in the snapshot so it stays bounded.
fn fresh_events<'a>(snapshot: &'a [FlowEvent], seen: &mut HashSet<String>) -> Vec<&'a FlowEvent> {
    let fresh: Vec<&FlowEvent> = snapshot
        .iter()
        .rev()
        .filter(|e| !seen.contains(&e.id))
        .collect();
    seen.clear();
    seen.extend(snapshot.iter().map(|e| e.id.clone()));
    fresh
}
