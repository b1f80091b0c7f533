//! RelayService: binds the UDP socket and drives `RelayHandler`.
//!
//! Tasks:
//! - receive loop: one per socket, hands InitializeSession authorization to
//!   `spawn_blocking` workers so a slow authorizer never stalls other clients
//! - expiry loop: removes sessions idle past the configured TTL
//!
//! `stop()` closes the handler, signals both loops through a broadcast
//! channel and waits for them. The receive loop joins its authorization
//! workers before it returns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use hns_core::config::RelayServiceConfig;
use hns_core::wire::MAX_PACKET_SIZE;

use crate::directory::SessionDirectory;
use crate::handler::RelayHandler;
use crate::policy::Authorizer;

/// How often the expiry loop runs.
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of a running relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServiceStatus {
    pub local_addr: SocketAddr,
    pub sessions: usize,
    pub running: bool,
}

pub struct RelayService {
    handler: Arc<RelayHandler>,
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl RelayService {
    /// Validate the config, bind, and spawn the service tasks.
    pub async fn start(config: &RelayServiceConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        config.validate().context("invalid relay configuration")?;

        let socket = Arc::new(
            UdpSocket::bind(config.bind)
                .await
                .with_context(|| format!("failed to bind relay socket on {}", config.bind))?,
        );
        let local_addr = socket.local_addr()?;

        let directory = Arc::new(SessionDirectory::new());
        let handler = Arc::new(RelayHandler::new(
            config.pre_shared_key(),
            directory.clone(),
            authorizer,
            socket.clone(),
            config.max_payload,
        ));

        let (shutdown, _) = broadcast::channel::<()>(1);
        let mut tasks = vec![tokio::spawn(receive_loop(
            socket,
            handler.clone(),
            shutdown.subscribe(),
        ))];
        if let Some(ttl) = config.session_ttl() {
            tasks.push(tokio::spawn(expiry_loop(directory, ttl, shutdown.subscribe())));
        }

        tracing::info!(addr = %local_addr, ttl_secs = config.session_ttl_secs, "relay service started");

        Ok(Self {
            handler,
            local_addr,
            shutdown,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        self.handler.directory()
    }

    pub async fn status(&self) -> RelayServiceStatus {
        RelayServiceStatus {
            local_addr: self.local_addr,
            sessions: self.handler.directory().len(),
            running: self.tasks.lock().await.is_some(),
        }
    }

    /// Stop all tasks and wait for them. Safe to call more than once.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        self.handler.close();
        let _ = self.shutdown.send(());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "relay task ended abnormally");
            }
        }
        tracing::info!(addr = %self.local_addr, "relay service stopped");
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<RelayHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(pending = workers.len(), "relay receive loop shutting down");
                break;
            }

            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "authorization worker ended abnormally");
                }
            }

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };
                tracing::trace!(peer = %from, len, "datagram received");

                if let Some(pending) = handler.handle_datagram(&buf[..len], from) {
                    let handler = handler.clone();
                    workers.spawn_blocking(move || {
                        let approved = handler.authorize(&pending);
                        handler.complete_initialize(pending, approved);
                    });
                }
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "authorization worker ended abnormally");
        }
    }
}

/// Remove sessions that have not sent a valid datagram within `ttl`.
async fn expiry_loop(
    directory: Arc<SessionDirectory>,
    ttl: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(EXPIRY_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = interval.tick() => {
                let removed = directory.expire(ttl);
                if removed > 0 {
                    tracing::debug!(removed, remaining = directory.len(), "expired relay sessions");
                }
            }
        }
    }
}
