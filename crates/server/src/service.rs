//! Server assembly
//!
//! Owns the pieces shared by both listeners (registry, session auth,
//! timeout limits), binds the USB/IP and management ports, and drives
//! graceful shutdown: listeners close first, then per-connection tasks
//! observe the shutdown signal and URB loops get the drain window to
//! answer outstanding submits.

use crate::config::ServerConfig;
use crate::plugin::PluginSet;
use crate::vbus::Registry;
use anyhow::{Context, Result, anyhow};
use common::{SecureReader, SecureWriter, SessionAuth, establish_server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Timeouts shared by the connection drivers
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Session handshake deadline
    pub handshake_timeout: Duration,
    /// Total deadline for one management request
    pub request_timeout: Duration,
    /// Window granted to URB loops on shutdown and forced detach
    pub drain_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared state handed to every connection driver
pub struct ServerCtx {
    pub registry: Arc<Registry>,
    pub auth: Option<SessionAuth>,
    pub limits: Limits,
}

impl ServerCtx {
    /// Apply the session layer to a freshly accepted connection.
    pub async fn establish(&self, stream: TcpStream) -> Result<(SecureReader, SecureWriter)> {
        match &self.auth {
            Some(auth) => {
                let halves =
                    tokio::time::timeout(self.limits.handshake_timeout, establish_server(stream, Some(auth)))
                        .await
                        .map_err(|_| anyhow!("session handshake timed out"))??;
                Ok(halves)
            }
            None => Ok(establish_server(stream, None).await?),
        }
    }
}

/// A running server: both listeners bound and accepting.
pub struct ServerHandle {
    pub usbip_addr: SocketAddr,
    pub control_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    usbip_task: JoinHandle<()>,
    mgmt_task: JoinHandle<()>,
    drain_timeout: Duration,
}

/// Bind both listeners and start accepting.
///
/// `auth` carries the password-derived session key material; `None`
/// disables the session layer entirely.
pub async fn bind(
    config: &ServerConfig,
    plugins: PluginSet,
    auth: Option<SessionAuth>,
) -> Result<ServerHandle> {
    let registry = Arc::new(Registry::new(
        plugins,
        config.claim_timeout(),
        config.limits.feedback_queue,
    ));
    let ctx = Arc::new(ServerCtx {
        registry,
        auth,
        limits: config.timeout_limits(),
    });

    let usbip_listener = TcpListener::bind(&config.server.usbip_addr)
        .await
        .with_context(|| format!("failed to bind USB/IP listener on {}", config.server.usbip_addr))?;
    let mgmt_listener = TcpListener::bind(&config.server.control_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind management listener on {}",
                config.server.control_addr
            )
        })?;

    let usbip_addr = usbip_listener.local_addr()?;
    let control_addr = mgmt_listener.local_addr()?;
    info!(%usbip_addr, "USB/IP listener ready");
    info!(%control_addr, "management listener ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let usbip_task = tokio::spawn(crate::usbip::run(
        ctx.clone(),
        usbip_listener,
        shutdown_rx.clone(),
    ));
    let mgmt_task = tokio::spawn(crate::mgmt::run(ctx.clone(), mgmt_listener, shutdown_rx));

    Ok(ServerHandle {
        usbip_addr,
        control_addr,
        shutdown_tx,
        usbip_task,
        mgmt_task,
        drain_timeout: config.timeout_limits().drain_timeout,
    })
}

impl ServerHandle {
    /// Close the listeners, then give connections the drain window.
    pub async fn shutdown(self) {
        info!("shutting down listeners");
        let _ = self.shutdown_tx.send(true);

        let drain = self.drain_timeout;
        for (name, task) in [("usbip", self.usbip_task), ("management", self.mgmt_task)] {
            match tokio::time::timeout(drain, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{name} listener task failed: {e}"),
                Err(_) => warn!("{name} listener did not stop within the drain window"),
            }
        }
        info!("shutdown complete");
    }
}
