//! hnsd: HNS relay and peer daemon.
//!
//!   hnsd relay          run a relay service
//!   hnsd peer [host..]  run a switch; stdin lines `<host> <text>` are sent

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use hns_core::config::HnsConfig;
use hns_relay::{Authorizer, ClientPolicy, RelayService};
use hns_switch::{DeliveryMode, DeliveryPath, Switch, SwitchEvent};

/// How often the relay logs its session count.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Message id used for stdin text. 0 is reserved for control traffic.
const TEXT_MESSAGE_ID: u32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match HnsConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = HnsConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HnsConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(String::as_str).unwrap_or("peer");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match mode {
        "relay" => run_relay(config, shutdown_tx.subscribe()).await,
        "peer" => run_peer(config, args.get(1..).unwrap_or(&[]), shutdown_tx.subscribe()).await,
        other => bail!("unknown mode {other:?}, expected `relay` or `peer`"),
    }
}

async fn run_relay(config: HnsConfig, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let policy = ClientPolicy::from_config(&config.relay);
    if config.relay.auto_trust {
        tracing::warn!("auto-trust enabled, every client that knows the relay secret is admitted");
    }
    let authorizer: Arc<dyn Authorizer> = Arc::new(policy);
    let service = RelayService::start(&config.relay, authorizer)
        .await
        .context("failed to start relay")?;

    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let status = service.status().await;
                tracing::info!(addr = %status.local_addr, sessions = status.sessions, "relay status");
            }
        }
    }

    service.stop().await;
    Ok(())
}

async fn run_peer(
    mut config: HnsConfig,
    extra_hosts: &[String],
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    config.switch.hosts.extend(extra_hosts.iter().cloned());
    let (switch, mut events) = Switch::start(&config.switch)
        .await
        .context("failed to start switch")?;
    let core = switch.core().clone();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let Some((host, text)) = line.trim().split_once(' ') else {
                        tracing::warn!("expected `<host> <text>`");
                        continue;
                    };
                    core.add_host(host);
                    match core.send_message(host, TEXT_MESSAGE_ID, text.as_bytes(), DeliveryMode::DirectAndTurn) {
                        Ok(report) => tracing::info!(host, direct = report.direct, relayed = report.relayed, "sent"),
                        Err(e) => tracing::warn!(host, error = %e, "send failed"),
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
        }
    }

    switch.stop().await;
    Ok(())
}

fn log_event(event: SwitchEvent) {
    match event {
        SwitchEvent::Message {
            host_id,
            message_id,
            data,
            path,
        } => {
            let via = match &path {
                DeliveryPath::Direct => "direct".to_string(),
                DeliveryPath::Relay { relay_id } => format!("relay {relay_id}"),
                DeliveryPath::Broadcast { relay_id } => format!("broadcast via {relay_id}"),
            };
            match std::str::from_utf8(&data) {
                Ok(text) => tracing::info!(host_id = %host_id, message_id, via = %via, text, "message"),
                Err(_) => tracing::info!(
                    host_id = %host_id,
                    message_id,
                    via = %via,
                    data = hex::encode(&data),
                    "message"
                ),
            }
        }
        SwitchEvent::RelayConnected { relay_id, observed } => {
            tracing::info!(relay = %relay_id, observed = ?observed, "relay connected")
        }
        SwitchEvent::RelayLost { relay_id } => tracing::warn!(relay = %relay_id, "relay lost"),
    }
}
