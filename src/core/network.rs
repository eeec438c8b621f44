//! Network reachability
//!
//! Installs and source operations refuse to start while the device is
//! offline, so that callers get `NotConnected` instead of a late transport
//! failure.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Answers "is the network reachable right now?"
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Probe that opens a TCP connection to a well-known host
#[derive(Debug)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
    cache_ttl: Duration,
    last: Mutex<Option<(Instant, bool)>>,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            timeout,
            cache_ttl,
            last: Mutex::new(None),
        }
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(address = %self.address, error = %e, "Connectivity probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(address = %self.address, "Connectivity probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl NetworkMonitor for TcpProbe {
    async fn is_connected(&self) -> bool {
        let mut last = self.last.lock().await;
        if let Some((checked_at, connected)) = *last {
            if checked_at.elapsed() < self.cache_ttl {
                return connected;
            }
        }

        let connected = self.probe().await;
        *last = Some((Instant::now(), connected));
        connected
    }
}

/// Fixed answer, switchable at runtime
#[derive(Debug)]
pub struct StaticNetwork {
    online: AtomicBool,
}

impl StaticNetwork {
    pub fn online() -> Self {
        Self { online: AtomicBool::new(true) }
    }

    pub fn offline() -> Self {
        Self { online: AtomicBool::new(false) }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkMonitor for StaticNetwork {
    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_network_toggle() {
        let network = StaticNetwork::online();
        assert!(network.is_connected().await);
        network.set_online(false);
        assert!(!network.is_connected().await);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(2), Duration::from_secs(30));
        assert!(probe.is_connected().await);

        // Cached answer survives the listener going away.
        drop(listener);
        assert!(probe.is_connected().await);
    }

    #[tokio::test]
    async fn test_tcp_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_millis(500), Duration::ZERO);
        assert!(!probe.is_connected().await);
    }
}
