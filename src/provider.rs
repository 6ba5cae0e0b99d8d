//! The generic provider contract (§4.6). Concrete site-specific scrapers are
//! out of scope; this module ships the contract plus a couple of
//! illustrative instances (a static list, and a single-page fetch) that
//! demonstrate it without being a scraper library.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::Result;
use crate::proxy::ProtocolTag;
use crate::utils::get_host_port_pairs;

/// One discovered candidate plus the protocol hints its provider attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawProxy {
    pub host: String,
    pub port: u16,
    pub hint: Vec<ProtocolTag>,
}

/// Common contract the broker drives providers through, letting it mix
/// crawled pages and static `--data` lists in the same provider list.
#[async_trait::async_trait]
pub trait ProxySource: Send + Sync {
    fn proto(&self) -> &[ProtocolTag];
    async fn get_proxies(&self) -> Result<HashSet<RawProxy>>;
}

pub struct Provider {
    pub url: String,
    pub domain: String,
    pub proto: Vec<ProtocolTag>,
    sem: Semaphore,
    client: reqwest::Client,
    timeout: Duration,
}

impl Provider {
    pub fn new(url: String, proto: Vec<ProtocolTag>, max_conn: usize, timeout: Duration) -> Self {
        let domain = url::parse_domain(&url);
        Provider {
            url,
            domain,
            proto,
            sem: Semaphore::new(max_conn.max(1)),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Fetches the provider's page(s) and extracts `(host, port, hint)`
    /// tuples via the shared IPv4:port regex. Providers are otherwise
    /// opaque: the broker consults only `url`, `domain`, `proto`, and this.
    pub async fn get_proxies(&self) -> Result<HashSet<RawProxy>> {
        let _permit = self.sem.acquire().await;
        let page = self.fetch(&self.url).await?;
        let pairs = get_host_port_pairs(&page);
        Ok(pairs
            .into_iter()
            .map(|(host, port)| RawProxy {
                host,
                port,
                hint: self.proto.clone(),
            })
            .collect())
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = tokio::time::timeout(self.timeout, self.client.get(url).send()).await??;
        if !resp.status().is_success() {
            warn!(url, status = %resp.status(), "provider page returned non-success status");
        }
        let text = resp.text().await?;
        debug!(url, bytes = text.len(), "fetched provider page");
        Ok(text)
    }
}

/// A provider backed by a fixed in-memory list, useful for tests and for
/// wiring `--data` (explicit `host:port` lists) through the same contract
/// the crawled providers use.
pub struct StaticProvider {
    pub url: String,
    pub domain: String,
    pub proto: Vec<ProtocolTag>,
    entries: Vec<RawProxy>,
}

impl StaticProvider {
    pub fn new(entries: Vec<RawProxy>) -> Self {
        StaticProvider {
            url: "static://list".to_string(),
            domain: "static".to_string(),
            proto: vec![],
            entries,
        }
    }

    pub async fn get_proxies(&self) -> Result<HashSet<RawProxy>> {
        Ok(self.entries.iter().cloned().collect())
    }
}

#[async_trait::async_trait]
impl ProxySource for Provider {
    fn proto(&self) -> &[ProtocolTag] {
        &self.proto
    }

    async fn get_proxies(&self) -> Result<HashSet<RawProxy>> {
        Provider::get_proxies(self).await
    }
}

#[async_trait::async_trait]
impl ProxySource for StaticProvider {
    fn proto(&self) -> &[ProtocolTag] {
        &self.proto
    }

    async fn get_proxies(&self) -> Result<HashSet<RawProxy>> {
        StaticProvider::get_proxies(self).await
    }
}

mod url {
    /// Extracts the registrable-ish domain portion of a provider URL for
    /// display/logging purposes only; not used for connectivity.
    pub fn parse_domain(raw: &str) -> String {
        raw.split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(raw)
            .split('/')
            .next()
            .unwrap_or(raw)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_domain_strips_scheme_and_path() {
        assert_eq!(url::parse_domain("http://example.com/list?x=1"), "example.com");
    }

    #[tokio::test]
    async fn static_provider_returns_fixed_entries() {
        let provider = StaticProvider::new(vec![RawProxy {
            host: "1.2.3.4".into(),
            port: 8080,
            hint: vec![ProtocolTag::Http],
        }]);
        let proxies = provider.get_proxies().await.unwrap();
        assert_eq!(proxies.len(), 1);
    }
}
