// Proxy pool module
//
// Loads the proxy list, pins each account to one proxy on first use
// (sticky round-robin), and enforces a minimum inter-request spacing per
// proxy. Bindings never move for the lifetime of the process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use thiserror::Error;

use crate::models::{mask_username, Proxy};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read proxy list: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a spacing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Ready,
    Wait(Duration),
}

pub struct ProxyPool {
    path: PathBuf,
    proxies: RwLock<Vec<Proxy>>,
    /// username → pinned proxy; a binding is never reassigned
    assignments: DashMap<String, Proxy>,
    assigned_count: AtomicUsize,
    /// proxy id → earliest next dispatch instant
    next_ready: DashMap<String, Instant>,
    /// proxy id → cached HTTP client carrying that proxy
    clients: DashMap<String, Client>,
    spacing: Duration,
}

impl ProxyPool {
    pub fn new(path: PathBuf, spacing: Duration) -> Self {
        Self {
            path,
            proxies: RwLock::new(Vec::new()),
            assignments: DashMap::new(),
            assigned_count: AtomicUsize::new(0),
            next_ready: DashMap::new(),
            clients: DashMap::new(),
            spacing,
        }
    }

    /// Load `proxies.txt`. A missing file yields an empty pool (accounts
    /// then dispatch without a proxy); malformed lines are skipped.
    pub fn load(&self) -> Result<usize, PoolError> {
        if !self.path.exists() {
            tracing::warn!(
                "[ProxyPool] Proxy list {:?} not found, running without proxies",
                self.path
            );
            return Ok(0);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let mut proxies = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Proxy::parse_line(line) {
                Ok(proxy) => proxies.push(proxy),
                Err(e) => {
                    tracing::warn!(
                        "[ProxyPool] Skipping malformed line {}: {}",
                        line_no + 1,
                        e
                    );
                }
            }
        }

        let count = proxies.len();
        *self.proxies.write() = proxies;
        tracing::info!("[ProxyPool] Loaded {} proxies from {:?}", count, self.path);
        Ok(count)
    }

    /// Sticky round-robin assignment: `proxies[assigned_count % len]` on
    /// first request per username, pinned afterwards. Empty pool ⇒ `None`.
    pub fn assign(&self, username: &str) -> Option<Proxy> {
        if let Some(existing) = self.assignments.get(username) {
            return Some(existing.clone());
        }

        let proxies = self.proxies.read();
        if proxies.is_empty() {
            return None;
        }

        // entry() holds the shard lock, so a concurrent first request for
        // the same username observes a single binding.
        let entry = self.assignments.entry(username.to_string()).or_insert_with(|| {
            let index = self.assigned_count.fetch_add(1, Ordering::Relaxed);
            let proxy = proxies[index % proxies.len()].clone();
            tracing::info!(
                "[ProxyPool] Bound account {} to proxy {}",
                mask_username(username),
                proxy.id
            );
            proxy
        });
        Some(entry.clone())
    }

    /// Atomic check-and-set of the proxy's next-ready instant.
    pub fn reserve(&self, proxy_id: &str) -> Reservation {
        let now = Instant::now();
        let mut entry = self
            .next_ready
            .entry(proxy_id.to_string())
            .or_insert(now);
        if now >= *entry {
            *entry = now + self.spacing;
            Reservation::Ready
        } else {
            Reservation::Wait(*entry - now)
        }
    }

    /// HTTP client carrying the proxy, cached per proxy id.
    pub fn client_for(&self, proxy: &Proxy) -> Client {
        if let Some(client) = self.clients.get(&proxy.id) {
            return client.clone();
        }
        let client = Self::build_client(proxy);
        self.clients.insert(proxy.id.clone(), client.clone());
        client
    }

    fn build_client(proxy: &Proxy) -> Client {
        let built = reqwest::Proxy::all(proxy.url())
            .map(|p| {
                let p = if proxy.username.is_empty() {
                    p
                } else {
                    p.basic_auth(&proxy.username, &proxy.password)
                };
                Client::builder()
                    .connect_timeout(Duration::from_secs(20))
                    .pool_max_idle_per_host(16)
                    .tcp_keepalive(Duration::from_secs(60))
                    .proxy(p)
                    .build()
            })
            .and_then(|r| r);
        match built {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(
                    "[ProxyPool] Failed to build client for proxy {}: {}, using direct",
                    proxy.id,
                    e
                );
                Client::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    pub fn assigned(&self) -> usize {
        self.assignments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pool_with(lines: &str, spacing_ms: u64) -> (tempfile::TempDir, ProxyPool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{}", lines).unwrap();
        let pool = ProxyPool::new(path, Duration::from_millis(spacing_ms));
        pool.load().unwrap();
        (dir, pool)
    }

    #[test]
    fn test_load_skips_malformed_and_blank_lines() {
        let (_dir, pool) = pool_with("1.1.1.1:8000:u:p\n\nnot-a-proxy\n2.2.2.2:8001:u:p\n", 1000);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_missing_file_yields_empty_pool() {
        let pool = ProxyPool::new(PathBuf::from("/nonexistent/proxies.txt"), Duration::ZERO);
        assert_eq!(pool.load().unwrap(), 0);
        assert!(pool.assign("alice").is_none());
    }

    #[test]
    fn test_round_robin_first_use_then_pinned() {
        let (_dir, pool) = pool_with(
            "1.1.1.1:8000:u:p\n2.2.2.2:8001:u:p\n3.3.3.3:8002:u:p\n",
            1000,
        );

        let a = pool.assign("alice").unwrap();
        let b = pool.assign("bob").unwrap();
        let c = pool.assign("carol").unwrap();
        let d = pool.assign("dave").unwrap();

        assert_eq!(a.id, "1.1.1.1:8000");
        assert_eq!(b.id, "2.2.2.2:8001");
        assert_eq!(c.id, "3.3.3.3:8002");
        // wraps around
        assert_eq!(d.id, "1.1.1.1:8000");

        // Pinned on repeat
        assert_eq!(pool.assign("alice").unwrap().id, "1.1.1.1:8000");
        assert_eq!(pool.assign("bob").unwrap().id, "2.2.2.2:8001");
        assert_eq!(pool.assigned(), 4);
    }

    #[test]
    fn test_reserve_enforces_spacing() {
        let (_dir, pool) = pool_with("1.1.1.1:8000:u:p\n", 50);

        assert_eq!(pool.reserve("1.1.1.1:8000"), Reservation::Ready);
        match pool.reserve("1.1.1.1:8000") {
            Reservation::Wait(wait) => assert!(wait <= Duration::from_millis(50)),
            Reservation::Ready => panic!("second reserve inside the spacing must wait"),
        }

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.reserve("1.1.1.1:8000"), Reservation::Ready);
    }

    #[test]
    fn test_reserve_is_per_proxy() {
        let (_dir, pool) = pool_with("1.1.1.1:8000:u:p\n2.2.2.2:8001:u:p\n", 1000);
        assert_eq!(pool.reserve("1.1.1.1:8000"), Reservation::Ready);
        // A different proxy is unaffected
        assert_eq!(pool.reserve("2.2.2.2:8001"), Reservation::Ready);
    }

    #[test]
    fn test_client_is_cached_per_proxy() {
        let (_dir, pool) = pool_with("1.1.1.1:8000:u:p\n", 1000);
        let proxy = pool.assign("alice").unwrap();
        let _ = pool.client_for(&proxy);
        let _ = pool.client_for(&proxy);
        assert_eq!(pool.clients.len(), 1);
    }
}
