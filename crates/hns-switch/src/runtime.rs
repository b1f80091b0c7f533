//! Switch runtime: owns the UDP socket and drives `SwitchCore`.
//!
//! Tasks:
//! - receive loop: every datagram on the switch socket goes to the core
//! - maintenance loop: ticks the core every `maintenance_interval`

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use hns_core::config::SwitchConfig;
use hns_core::wire::MAX_PACKET_SIZE;

use crate::events::SwitchEvent;
use crate::switch::SwitchCore;

pub struct Switch {
    core: Arc<SwitchCore>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Switch {
    /// Bind `0.0.0.0:bind_port` and start the switch.
    pub async fn start(config: &SwitchConfig) -> Result<(Self, mpsc::UnboundedReceiver<SwitchEvent>)> {
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.bind_port));
        Self::start_on(config, bind).await
    }

    /// Start the switch on an explicit local address.
    pub async fn start_on(
        config: &SwitchConfig,
        bind: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SwitchEvent>)> {
        config.validate().context("invalid switch configuration")?;
        let endpoints = config
            .relays
            .iter()
            .map(|r| r.validate())
            .collect::<Result<Vec<_>, _>>()
            .context("invalid relay entry")?;

        let socket = make_switch_socket(bind)
            .with_context(|| format!("failed to create switch socket on {bind}"))?;
        let socket = Arc::new(
            UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?,
        );
        let local_addr = socket.local_addr()?;

        let (core, events) = SwitchCore::new(config, local_addr, socket.clone())?;
        let core = Arc::new(core);
        for endpoint in endpoints {
            core.add_service(endpoint);
        }
        for host in &config.hosts {
            core.add_host(host);
        }

        let (shutdown, _) = broadcast::channel::<()>(1);
        let tasks = vec![
            tokio::spawn(receive_loop(socket, core.clone(), shutdown.subscribe())),
            tokio::spawn(maintenance_loop(
                core.clone(),
                config.maintenance_interval(),
                shutdown.subscribe(),
            )),
        ];

        tracing::info!(
            host_id = %config.host_id,
            addr = %local_addr,
            relays = config.relays.len(),
            "switch started"
        );

        Ok((
            Self {
                core,
                shutdown,
                tasks: Mutex::new(Some(tasks)),
            },
            events,
        ))
    }

    pub fn core(&self) -> &Arc<SwitchCore> {
        &self.core
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Stop both tasks and wait for them. Safe to call more than once.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        let _ = self.shutdown.send(());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "switch task ended abnormally");
            }
        }
        tracing::info!(host_id = %self.core.host_id(), "switch stopped");
    }
}

/// UDP socket with broadcast enabled, for subnet pings. No address reuse:
/// a second switch on the same port must fail to bind.
fn make_switch_socket(bind: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    if bind.is_ipv4() {
        socket.set_broadcast(true).context("SO_BROADCAST")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&bind.into()).context("bind()")?;

    Ok(socket.into())
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    core: Arc<SwitchCore>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("switch receive loop shutting down");
                return;
            }

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP unreachable from a dead punch target surfaces here.
                        tracing::trace!(error = %e, "recv_from failed");
                        continue;
                    }
                };
                core.handle_datagram(&buf[..len], from);
            }
        }
    }
}

async fn maintenance_loop(
    core: Arc<SwitchCore>,
    every: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => core.tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host_id: &str) -> SwitchConfig {
        SwitchConfig {
            host_id: host_id.into(),
            lan_broadcast: false,
            ..SwitchConfig::default()
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (switch, _events) = Switch::start_on(&config("alice"), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(switch.is_running().await);
        assert_ne!(switch.local_addr().port(), 0);
        switch.stop().await;
        switch.stop().await;
        assert!(!switch.is_running().await);
    }

    #[tokio::test]
    async fn port_in_use_is_refused() {
        let (first, _events) = Switch::start_on(&config("alice"), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr();
        assert!(Switch::start_on(&config("bob"), taken).await.is_err());
        first.stop().await;
    }

    #[tokio::test]
    async fn empty_host_id_is_rejected() {
        assert!(Switch::start_on(&config(""), "127.0.0.1:0".parse().unwrap())
            .await
            .is_err());
    }
}
