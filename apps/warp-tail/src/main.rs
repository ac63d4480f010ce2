use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{error, info, warn};
use warp_client::{
    Address, ClientObserver, DownlinkObserver, LinkOptions, ListObserver, MapObserver, Uri, Value,
    ValueObserver, WarpClient,
};
use warp_transport_websocket::WebSocketTransportFactory;

mod config;

use crate::config::TailConfig;

#[derive(Parser, Debug)]
#[command(name = "warp-tail", about = "Follow and command WARP lanes")]
struct Cli {
    /// Path to a TOML/YAML/JSON config file, or a `.env` file.
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a downlink and print everything it reports until interrupted.
    Tail {
        /// Host URI; falls back to the configured host, then to an absolute node URI.
        #[arg(long)]
        host: Option<String>,
        node: String,
        lane: String,
        #[arg(long, value_enum, default_value_t = TailKind::Value)]
        kind: TailKind,
        /// Link without requesting a state replay.
        #[arg(long)]
        no_sync: bool,
    },
    /// Send a single command and wait for it to leave the queue.
    Send {
        #[arg(long)]
        host: Option<String>,
        node: String,
        lane: String,
        /// JSON command body.
        body: String,
        #[arg(long, default_value = "10s", value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Duration,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TailKind {
    Event,
    Value,
    List,
    Map,
}

/// Logs host-level session changes.
struct SessionLogger;

impl ClientObserver for SessionLogger {
    fn did_connect(&self, host: &Uri) {
        info!(%host, "connected");
    }

    fn did_authenticate(&self, host: &Uri, body: &Value) {
        info!(%host, session = %body, "authenticated");
    }

    fn did_deauthenticate(&self, host: &Uri, body: &Value) {
        warn!(%host, reason = %body, "deauthenticated");
    }

    fn did_disconnect(&self, host: &Uri) {
        warn!(%host, "disconnected");
    }

    fn did_fail(&self, host: &Uri, error: &str) {
        error!(%host, error, "connection failed");
    }
}

/// Prints lane activity as one line per callback.
struct LanePrinter {
    address: Address,
}

impl DownlinkObserver for LanePrinter {
    fn did_link(&self) {
        info!(address = %self.address, "linked");
    }

    fn did_sync(&self) {
        info!(address = %self.address, "synced");
    }

    fn on_event(&self, body: &Value) {
        println!("{body}");
    }

    fn did_unlink(&self) {
        warn!(address = %self.address, "unlinked");
    }

    fn did_fail(&self, error: &str) {
        error!(address = %self.address, error, "downlink failed");
    }

    fn did_close(&self) {
        info!(address = %self.address, "closed");
    }
}

impl ValueObserver<Value> for LanePrinter {
    fn did_set(&self, new_value: &Value, _old_value: Option<&Value>) {
        info!(address = %self.address, value = %new_value, "set");
    }
}

impl ListObserver<Value> for LanePrinter {
    fn did_update(&self, index: usize, new_value: &Value, _old_value: Option<&Value>) {
        info!(address = %self.address, index, value = %new_value, "update");
    }

    fn did_insert(&self, index: usize, value: &Value) {
        info!(address = %self.address, index, %value, "insert");
    }

    fn did_remove(&self, index: usize, old_value: &Value) {
        info!(address = %self.address, index, value = %old_value, "remove");
    }

    fn did_move(&self, from: usize, to: usize, value: &Value) {
        info!(address = %self.address, from, to, %value, "move");
    }

    fn did_clear(&self) {
        info!(address = %self.address, "clear");
    }

    fn did_drop(&self, count: usize) {
        info!(address = %self.address, count, "drop");
    }

    fn did_take(&self, count: usize) {
        info!(address = %self.address, count, "take");
    }
}

impl MapObserver<Value, Value> for LanePrinter {
    fn did_update(&self, key: &Value, new_value: &Value, _old_value: Option<&Value>) {
        info!(address = %self.address, %key, value = %new_value, "update");
    }

    fn did_remove(&self, key: &Value, old_value: &Value) {
        info!(address = %self.address, %key, value = %old_value, "remove");
    }

    fn did_clear(&self) {
        info!(address = %self.address, "clear");
    }

    fn did_drop(&self, count: usize) {
        info!(address = %self.address, count, "drop");
    }

    fn did_take(&self, count: usize) {
        info!(address = %self.address, count, "take");
    }
}

/// Keeps whichever downlink kind was opened alive until shutdown.
enum OpenDownlink {
    Event(warp_client::EventDownlink),
    Value(warp_client::ValueDownlink<Value>),
    List(warp_client::ListDownlink<Value>),
    Map(warp_client::MapDownlink<Value, Value>),
}

impl OpenDownlink {
    fn close(&self) {
        match self {
            Self::Event(downlink) => downlink.close(),
            Self::Value(downlink) => downlink.close(),
            Self::List(downlink) => downlink.close(),
            Self::Map(downlink) => downlink.close(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let filter = std::env::var("WARP_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = TailConfig::new(cli.config).context("failed to load config")?;

    let client = WarpClient::new(
        cfg.client_config(),
        Arc::new(WebSocketTransportFactory::new(cfg.transport_config())),
    );
    client.observe(Arc::new(SessionLogger));

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("failed to register SIGTERM")?;
    flag::register(SIGINT, Arc::clone(&shutdown)).context("failed to register SIGINT")?;

    let result = match cli.command {
        Commands::Tail {
            host,
            node,
            lane,
            kind,
            no_sync,
        } => {
            let address = resolve(host.as_deref().or(cfg.host.as_deref()), &node, &lane)?;
            authenticate(&client, &cfg, &address)?;
            tail(&client, &cfg, address, kind, !no_sync, &shutdown)
        }
        Commands::Send {
            host,
            node,
            lane,
            body,
            timeout,
        } => {
            let address = resolve(host.as_deref().or(cfg.host.as_deref()), &node, &lane)?;
            let body: Value = serde_json::from_str(&body).context("command body is not JSON")?;
            authenticate(&client, &cfg, &address)?;
            send(&client, &cfg, &address, body, timeout, &shutdown)
        }
    };

    client.close();
    result
}

fn resolve(host: Option<&str>, node: &str, lane: &str) -> anyhow::Result<Address> {
    Address::resolve(host, node, lane)
        .with_context(|| format!("cannot resolve lane {lane} on node {node}"))
}

fn authenticate(client: &WarpClient, cfg: &TailConfig, address: &Address) -> anyhow::Result<()> {
    if let Some(token) = &cfg.auth_token {
        client
            .authenticate(address.host(), serde_json::json!({ "token": token }))
            .context("failed to queue credentials")?;
    }
    Ok(())
}

fn tail(
    client: &WarpClient,
    cfg: &TailConfig,
    address: Address,
    kind: TailKind,
    sync: bool,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let options = match kind {
        TailKind::Event => LinkOptions::event(),
        _ => LinkOptions::default(),
    }
    .with_keep_synced(sync);
    let printer = Arc::new(LanePrinter {
        address: address.clone(),
    });

    let downlink = match kind {
        TailKind::Event => {
            let downlink = client.open_event_downlink(address.clone(), options)?;
            downlink.observe(printer)?;
            OpenDownlink::Event(downlink)
        }
        TailKind::Value => {
            let downlink = client.open_value_downlink::<Value>(address.clone(), options)?;
            downlink.observe(printer)?;
            OpenDownlink::Value(downlink)
        }
        TailKind::List => {
            let downlink = client.open_list_downlink::<Value>(address.clone(), options)?;
            downlink.observe(printer)?;
            OpenDownlink::List(downlink)
        }
        TailKind::Map => {
            let downlink = client.open_map_downlink::<Value, Value>(address.clone(), options)?;
            downlink.observe(printer)?;
            OpenDownlink::Map(downlink)
        }
    };
    info!(%address, ?kind, "tailing lane");

    while !shutdown.load(Ordering::Relaxed) {
        client.tick();
        thread::sleep(cfg.tick_interval);
    }

    info!("shutdown requested");
    downlink.close();
    client.tick();
    Ok(())
}

fn send(
    client: &WarpClient,
    cfg: &TailConfig,
    address: &Address,
    body: Value,
    timeout: Duration,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    client.command(address, body)?;
    let deadline = Instant::now() + timeout;
    loop {
        client.tick();
        if client.is_connected(address.host()) && client.pending_outbound(address.host()) == 0 {
            info!(%address, "command sent");
            return Ok(());
        }
        if shutdown.load(Ordering::Relaxed) {
            bail!("interrupted before the command was sent");
        }
        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting to reach {}", address.host());
        }
        thread::sleep(cfg.tick_interval);
    }
}
