//! Oracle URLs used to detect whether a proxy is present and what the
//! request's apparent source IP is.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Result, RotaError};
use crate::proxy::JudgeScheme;
use crate::resolver::Resolver;

#[derive(Debug, Clone, Default)]
pub struct JudgeMarks {
    pub via: usize,
    pub proxy: usize,
}

#[derive(Debug, Clone)]
pub struct Judge {
    pub url: String,
    pub scheme: JudgeScheme,
    pub host: String,
    pub path: String,
    pub ip: Option<Ipv4Addr>,
    pub is_working: bool,
    pub marks: JudgeMarks,
}

impl Judge {
    pub fn new(url: &str, scheme: JudgeScheme) -> Result<Self> {
        let parsed = url::parse(url)?;
        Ok(Judge {
            url: url.to_string(),
            scheme,
            host: parsed.0,
            path: parsed.1,
            ip: None,
            is_working: false,
            marks: JudgeMarks::default(),
        })
    }

    /// Validates the judge: resolves its host; for `SMTP` that's sufficient
    /// (no fetch, since SMTP judges have no HTTP echo page); otherwise
    /// fetches the URL with a random 4-digit version tag embedded in the
    /// User-Agent and requires status 200 plus both `my_ip` and the tag to
    /// appear in the body.
    pub async fn check(
        &mut self,
        resolver: &Resolver,
        client: &reqwest::Client,
        my_ip: Ipv4Addr,
    ) -> Result<bool> {
        let ip = resolver.resolve(&self.host).await?;
        self.ip = Some(ip);

        if matches!(self.scheme, JudgeScheme::Smtp) {
            self.is_working = true;
            return Ok(true);
        }

        let rv: String = {
            let mut rng = rand::thread_rng();
            format!("{:04}", rng.gen_range(0..10000))
        };
        let headers = get_headers(Some(&rv));

        let mut req = client.get(&self.url);
        for (k, v) in &headers {
            req = req.header(*k, v.as_str());
        }
        let resp = req.send().await?;
        let status_ok = resp.status().as_u16() == 200;
        let body = resp.text().await.unwrap_or_default();
        let lower = body.to_lowercase();

        let my_ip_str = my_ip.to_string();
        let working = status_ok
            && lower.contains(&my_ip_str)
            && lower.contains(&rv.to_lowercase());

        if working {
            self.marks.via = lower.matches("via").count();
            self.marks.proxy = lower.matches("proxy").count();
        }
        self.is_working = working;
        Ok(working)
    }
}

/// A full-URI GET/POST User-Agent plus the fixed cookie/referer headers the
/// checker's anonymity classification looks for verbatim in judge bodies.
pub fn get_headers(rv: Option<&str>) -> Vec<(&'static str, String)> {
    let ua = match rv {
        Some(rv) => format!("Rota/{}/{}", env!("CARGO_PKG_VERSION"), rv),
        None => format!("Rota/{}", env!("CARGO_PKG_VERSION")),
    };
    vec![
        ("User-Agent", ua),
        ("Accept", "*/*".to_string()),
        ("Accept-Encoding", "gzip,deflate".to_string()),
        ("Cookie", "cookie=ok".to_string()),
        ("Referer", "http://www.google.com/".to_string()),
    ]
}

mod url {
    use crate::error::{Result, RotaError};

    /// Minimal `(host, path)` split, enough for the judges this crate deals
    /// with; anything fancier should go through `reqwest::Url` at the call
    /// site instead of duplicating a URL parser here.
    pub fn parse(raw: &str) -> Result<(String, String)> {
        let without_scheme = raw
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| RotaError::InvalidConfig(format!("judge url missing scheme: {raw}")))?;
        let (host, path) = match without_scheme.split_once('/') {
            Some((h, p)) => (h, format!("/{p}")),
            None => (without_scheme, "/".to_string()),
        };
        let host = host.split(':').next().unwrap_or(host).to_string();
        Ok((host, path))
    }
}

/// Per-`Checker` collaborator grouping validated judges by scheme and
/// exposing per-scheme readiness. Owned by the checker rather than kept as
/// process-wide state, so independent `find` runs don't leak into each other.
pub struct JudgeRegistry {
    judges: RwLock<HashMap<JudgeSchemeKey, Vec<Arc<Judge>>>>,
    ready: HashMap<JudgeSchemeKey, Arc<Notify>>,
    disabled: RwLock<HashMap<JudgeSchemeKey, bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct JudgeSchemeKey(&'static str);

fn key(scheme: JudgeScheme) -> JudgeSchemeKey {
    JudgeSchemeKey(scheme.as_str())
}

impl JudgeRegistry {
    pub fn new() -> Self {
        let mut ready = HashMap::new();
        for scheme in [JudgeScheme::Http, JudgeScheme::Https, JudgeScheme::Smtp] {
            ready.insert(key(scheme), Arc::new(Notify::new()));
        }
        JudgeRegistry {
            judges: RwLock::new(HashMap::new()),
            ready,
            disabled: RwLock::new(HashMap::new()),
        }
    }

    pub fn clear(&self) {
        self.judges.write().clear();
        self.disabled.write().clear();
    }

    pub fn register_working(&self, scheme: JudgeScheme, judge: Judge) {
        self.judges
            .write()
            .entry(key(scheme))
            .or_default()
            .push(Arc::new(judge));
        if let Some(notify) = self.ready.get(&key(scheme)) {
            notify.notify_waiters();
        }
    }

    /// Marks a scheme permanently unavailable (no working judge found),
    /// releasing anyone waiting on its readiness signal.
    pub fn disable(&self, scheme: JudgeScheme) {
        self.disabled.write().insert(key(scheme), true);
        if let Some(notify) = self.ready.get(&key(scheme)) {
            notify.notify_waiters();
        }
        warn!(scheme = scheme.as_str(), "no judges available, disabling dependent protocols");
    }

    pub fn is_disabled(&self, scheme: JudgeScheme) -> bool {
        *self.disabled.read().get(&key(scheme)).unwrap_or(&false)
    }

    pub async fn wait_ready(&self, scheme: JudgeScheme) {
        if self.is_disabled(scheme) || !self.judges_for(scheme).is_empty() {
            return;
        }
        if let Some(notify) = self.ready.get(&key(scheme)) {
            notify.notified().await;
        }
    }

    fn judges_for(&self, scheme: JudgeScheme) -> Vec<Arc<Judge>> {
        self.judges
            .read()
            .get(&key(scheme))
            .cloned()
            .unwrap_or_default()
    }

    pub fn random(&self, scheme: JudgeScheme) -> Option<Arc<Judge>> {
        let candidates = self.judges_for(scheme);
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn has_any(&self, scheme: JudgeScheme) -> bool {
        !self.judges_for(scheme).is_empty()
    }
}

impl Default for JudgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parse_splits_host_and_path() {
        let (host, path) = url::parse("http://httpheader.net/azenv.php").unwrap();
        assert_eq!(host, "httpheader.net");
        assert_eq!(path, "/azenv.php");
    }

    #[tokio::test]
    async fn registry_disable_releases_waiters() {
        let registry = JudgeRegistry::new();
        let wait = registry.wait_ready(JudgeScheme::Smtp);
        registry.disable(JudgeScheme::Smtp);
        wait.await;
        assert!(registry.is_disabled(JudgeScheme::Smtp));
    }
}
