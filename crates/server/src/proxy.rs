//! Pass-through TCP proxy
//!
//! A transparent byte-for-byte forwarder between a listen address and one
//! upstream, used to put a capture point in front of the USB/IP port when
//! debugging initiators. Honors the `VIIPER_PROXY_*` environment.

use anyhow::{Context, Result, anyhow};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: String,
    pub upstream: String,
    /// Cap on a proxied session; None forwards until either side closes
    pub timeout: Option<Duration>,
}

impl ProxyConfig {
    /// Resolve from CLI arguments with environment fallback:
    /// `VIIPER_PROXY_ADDR`, `VIIPER_PROXY_UPSTREAM`, `VIIPER_PROXY_TIMEOUT`
    /// (milliseconds, 0 disables).
    pub fn resolve(listen: Option<String>, upstream: Option<String>) -> Result<Self> {
        let listen = listen
            .or_else(|| std::env::var("VIIPER_PROXY_ADDR").ok())
            .unwrap_or_else(|| "127.0.0.1:3241".to_string());
        let upstream = upstream
            .or_else(|| std::env::var("VIIPER_PROXY_UPSTREAM").ok())
            .ok_or_else(|| anyhow!("no upstream: pass --upstream or set VIIPER_PROXY_UPSTREAM"))?;

        let timeout = match std::env::var("VIIPER_PROXY_TIMEOUT") {
            Ok(value) => {
                let ms: u64 = value
                    .parse()
                    .with_context(|| format!("invalid VIIPER_PROXY_TIMEOUT '{value}'"))?;
                (ms > 0).then(|| Duration::from_millis(ms))
            }
            Err(_) => None,
        };

        Ok(Self {
            listen,
            upstream,
            timeout,
        })
    }
}

/// Accept loop; runs until the listener fails or the task is dropped.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind proxy listener on {}", config.listen))?;
    info!(listen = %config.listen, upstream = %config.upstream, "proxy ready");

    loop {
        let (downstream, peer) = listener.accept().await.context("proxy accept failed")?;
        let config = config.clone();
        tokio::spawn(async move {
            debug!(%peer, "proxy session opened");
            if let Err(e) = forward(downstream, &config).await {
                warn!(%peer, "proxy session error: {:#}", e);
            }
            debug!(%peer, "proxy session closed");
        });
    }
}

async fn forward(mut downstream: TcpStream, config: &ProxyConfig) -> Result<()> {
    let mut upstream = TcpStream::connect(&config.upstream)
        .await
        .with_context(|| format!("failed to connect upstream {}", config.upstream))?;
    downstream.set_nodelay(true).ok();
    upstream.set_nodelay(true).ok();

    let copy = tokio::io::copy_bidirectional(&mut downstream, &mut upstream);
    let (to_upstream, to_downstream) = match config.timeout {
        Some(limit) => tokio::time::timeout(limit, copy)
            .await
            .map_err(|_| anyhow!("session exceeded {} ms", limit.as_millis()))??,
        None => copy.await?,
    };
    debug!(to_upstream, to_downstream, "proxy byte counts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_resolve_requires_upstream() {
        // No CLI args and (assumed) no env in the test environment.
        let result = ProxyConfig::resolve(Some("127.0.0.1:0".into()), None);
        if std::env::var("VIIPER_PROXY_UPSTREAM").is_err() {
            assert!(result.is_err());
        }
        let config =
            ProxyConfig::resolve(Some("127.0.0.1:0".into()), Some("127.0.0.1:9".into())).unwrap();
        assert_eq!(config.upstream, "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_forward_passes_bytes_both_ways() {
        // Upstream echo server
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        // Proxy in front of it
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let config = ProxyConfig {
            listen: proxy_addr.to_string(),
            upstream: upstream_addr.to_string(),
            timeout: Some(Duration::from_secs(5)),
        };
        tokio::spawn(async move {
            let (downstream, _) = proxy_listener.accept().await.unwrap();
            forward(downstream, &config).await.unwrap();
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
    }
}
