//! Priority-ordered working set of validated proxies with health-based
//! eviction. `get` lazily imports from the broker's output channel when the
//! pool is running low; `put` returns a used proxy, possibly evicting it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, RotaError};
use crate::proxy::Proxy;

pub struct PoolConfig {
    pub min_req_proxy: u64,
    pub max_error_rate: f64,
    pub max_resp_time: f64,
    pub min_queue: usize,
}

struct HeapEntry(Proxy);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority() == other.0.priority()
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the *lowest* priority
        // tuple first, matching the min-heap semantics of `heapq.heappush`.
        other.0.priority().cmp(&self.0.priority())
    }
}

pub struct ProxyPool {
    config: PoolConfig,
    heap: BinaryHeap<HeapEntry>,
    newcomers: VecDeque<Proxy>,
    incoming: mpsc::Receiver<Proxy>,
}

impl ProxyPool {
    pub fn new(config: PoolConfig, incoming: mpsc::Receiver<Proxy>) -> Self {
        ProxyPool {
            config,
            heap: BinaryHeap::new(),
            newcomers: VecDeque::new(),
            incoming,
        }
    }

    /// `scheme_https = false` requests an `HTTP`-capable proxy, `true`
    /// requests `HTTPS`-capable.
    pub async fn get(&mut self, scheme_https: bool) -> Result<Proxy> {
        if self.heap.len() + self.newcomers.len() < self.config.min_queue {
            return self.import_until_match(scheme_https).await;
        }

        if let Some(pos) = self
            .newcomers
            .iter()
            .position(|p| p.supports_scheme(scheme_https))
        {
            return Ok(self.newcomers.remove(pos).unwrap());
        }

        if let Some(proxy) = self.pop_matching(scheme_https) {
            return Ok(proxy);
        }

        self.import_until_match(scheme_https).await
    }

    fn pop_matching(&mut self, scheme_https: bool) -> Option<Proxy> {
        let mut held = Vec::new();
        let found = loop {
            match self.heap.pop() {
                Some(HeapEntry(p)) if p.supports_scheme(scheme_https) => break Some(p),
                Some(entry) => held.push(entry),
                None => break None,
            }
        };
        for entry in held {
            self.heap.push(entry);
        }
        found
    }

    async fn import_until_match(&mut self, scheme_https: bool) -> Result<Proxy> {
        loop {
            let proxy = self.incoming.recv().await.ok_or(RotaError::NoProxyError)?;
            if proxy.supports_scheme(scheme_https) {
                return Ok(proxy);
            }
            self.put(proxy);
        }
    }

    /// Returns a used proxy to the pool, evicting it if it has accumulated
    /// enough requests to be judged unhealthy.
    pub fn put(&mut self, proxy: Proxy) {
        if proxy.stat.requests < self.config.min_req_proxy {
            self.newcomers.push_back(proxy);
            return;
        }
        let error_rate = proxy.error_rate();
        let avg_resp_time = proxy.avg_resp_time();
        if error_rate > self.config.max_error_rate || avg_resp_time > self.config.max_resp_time {
            debug!(addr = %proxy.addr(), error_rate, avg_resp_time, "evicted from pool");
            return;
        }
        self.heap.push(HeapEntry(proxy));
    }

    /// Explicit removal used by the dispatch server's control API.
    pub fn remove(&mut self, host: std::net::Ipv4Addr, port: u16) -> bool {
        let before = self.heap.len() + self.newcomers.len();
        self.newcomers.retain(|p| !(p.host == host && p.port == port));
        let mut kept = BinaryHeap::new();
        while let Some(entry) = self.heap.pop() {
            if !(entry.0.host == host && entry.0.port == port) {
                kept.push(entry);
            }
        }
        self.heap = kept;
        before != self.heap.len() + self.newcomers.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len() + self.newcomers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{GeoData, ProtocolTag};
    use std::net::Ipv4Addr;

    fn proxy_with(requests: u64, errors: u64, https: bool) -> Proxy {
        let mut p = Proxy::new(Ipv4Addr::new(1, 1, 1, 1), 80, vec![], GeoData::unknown());
        p.stat.requests = requests;
        if errors > 0 {
            p.stat.errors.insert("connection_failed", errors);
        }
        p.types.insert(
            if https { ProtocolTag::Https } else { ProtocolTag::Http },
            None,
        );
        p
    }

    #[tokio::test]
    async fn put_evicts_over_threshold_error_rate() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let mut pool = ProxyPool::new(
            PoolConfig {
                min_req_proxy: 5,
                max_error_rate: 0.5,
                max_resp_time: 8.0,
                min_queue: 0,
            },
            rx,
        );
        pool.put(proxy_with(10, 6, false));
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn put_keeps_newcomers_regardless_of_error_rate() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let mut pool = ProxyPool::new(
            PoolConfig {
                min_req_proxy: 5,
                max_error_rate: 0.5,
                max_resp_time: 8.0,
                min_queue: 0,
            },
            rx,
        );
        pool.put(proxy_with(2, 2, false));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn get_raises_no_proxy_when_channel_closed_and_pool_empty() {
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let mut pool = ProxyPool::new(
            PoolConfig {
                min_req_proxy: 5,
                max_error_rate: 0.5,
                max_resp_time: 8.0,
                min_queue: 0,
            },
            rx,
        );
        let err = pool.get(false).await.unwrap_err();
        assert!(matches!(err, RotaError::NoProxyError));
    }
}
