//! Orchestrates probes across protocols against a candidate proxy, parses
//! the oracle response, and assigns the HTTP anonymity level.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, RotaError};
use crate::judge::{get_headers, Judge, JudgeRegistry};
use crate::proxy::{AnonymityLevel, JudgeScheme, NegotiatorKind, Proxy, ProtocolTag, Transport};
use crate::resolver::Resolver;
use crate::utils::{decompress_body, get_all_ip, parse_headers};

/// Requested protocol tags mapped to an optional set of acceptable
/// anonymity levels (`None` means "any level accepted for this tag").
pub type TypeFilter = HashMap<ProtocolTag, Option<HashSet<AnonymityLevel>>>;

pub struct CheckerConfig {
    pub max_tries: u32,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub strict: bool,
    pub dnsbl: Vec<String>,
    pub real_ext_ip: Ipv4Addr,
    pub types: TypeFilter,
    pub post: bool,
}

pub struct Checker {
    config: CheckerConfig,
    judge_urls: Vec<(String, JudgeScheme)>,
    registry: JudgeRegistry,
    resolver: Arc<Resolver>,
    client: reqwest::Client,
    active: parking_lot::RwLock<HashSet<ProtocolTag>>,
}

impl Checker {
    pub fn new(
        config: CheckerConfig,
        judge_urls: Vec<(String, JudgeScheme)>,
        resolver: Arc<Resolver>,
    ) -> Self {
        let active = config.types.keys().copied().collect();
        Checker {
            config,
            judge_urls,
            registry: JudgeRegistry::new(),
            resolver,
            client: reqwest::Client::new(),
            active: parking_lot::RwLock::new(active),
        }
    }

    /// Validates every configured judge concurrently, then prunes the
    /// active negotiator set for any scheme with zero working judges.
    pub async fn check_judges(&self) {
        self.registry.clear();

        let futures = self.judge_urls.iter().map(|(url, scheme)| {
            let url = url.clone();
            let scheme = *scheme;
            async move {
                let mut judge = match Judge::new(&url, scheme) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!(url, error = %e, "invalid judge url");
                        return None;
                    }
                };
                match judge.check(&self.resolver, &self.client, self.config.real_ext_ip).await {
                    Ok(true) => Some((scheme, judge)),
                    Ok(false) => None,
                    Err(e) => {
                        warn!(url, error = %e, "judge validation failed");
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(futures).await;
        for result in results.into_iter().flatten() {
            let (scheme, judge) = result;
            self.registry.register_working(scheme, judge);
        }

        for scheme in [JudgeScheme::Http, JudgeScheme::Https, JudgeScheme::Smtp] {
            if !self.registry.has_any(scheme) {
                self.registry.disable(scheme);
                self.disable_tags_for_scheme(scheme);
            }
        }
    }

    fn disable_tags_for_scheme(&self, scheme: JudgeScheme) {
        let mut active = self.active.write();
        active.retain(|tag| tag.judge_scheme() != scheme);
    }

    fn active_tags(&self) -> HashSet<ProtocolTag> {
        self.active.read().clone()
    }

    /// True once `check_judges` has pruned every requested protocol tag for
    /// lack of a working judge (the per-run "unrecoverable" condition in
    /// §7: nothing this checker tries can ever succeed).
    pub fn has_no_active_tags(&self) -> bool {
        self.active.read().is_empty()
    }

    /// Full per-proxy check: DNSBL gate, judge readiness wait, per-tag
    /// negotiation attempts, then the caller's type filter.
    pub async fn check(&self, proxy: &mut Proxy) -> bool {
        if !self.config.dnsbl.is_empty() && self.is_blacklisted(proxy.host).await {
            debug!(addr = %proxy.addr(), "proxy listed on dnsbl");
            return false;
        }

        let active = self.active_tags();
        let required_schemes: HashSet<JudgeScheme> =
            active.iter().map(|t| t.judge_scheme()).collect();
        for scheme in required_schemes {
            self.registry.wait_ready(scheme).await;
        }

        let to_try: Vec<ProtocolTag> = if proxy.expected_types.is_empty() {
            active.into_iter().collect()
        } else {
            proxy
                .expected_types
                .iter()
                .copied()
                .filter(|t| active.contains(t))
                .collect()
        };

        let mut any_supported = false;
        for tag in to_try {
            if self.check_one(proxy, tag).await {
                any_supported = true;
            }
        }

        proxy.is_working = any_supported;
        proxy.is_working && self.types_passed(proxy)
    }

    async fn is_blacklisted(&self, host: Ipv4Addr) -> bool {
        let octets = host.octets();
        for zone in &self.config.dnsbl {
            let query = format!(
                "{}.{}.{}.{}.{}",
                octets[3], octets[2], octets[1], octets[0], zone
            );
            if tokio::net::lookup_host((query.as_str(), 0)).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn check_one(&self, proxy: &mut Proxy, tag: ProtocolTag) -> bool {
        let negotiator = NegotiatorKind(tag);
        let Some(judge) = self.registry.random(tag.judge_scheme()) else {
            return false;
        };
        let Some(judge_ip) = judge.ip else {
            return false;
        };
        let judge_port = match judge.scheme {
            JudgeScheme::Https => 443,
            _ => 80,
        };

        for attempt in 0..self.config.max_tries {
            let start = Instant::now();
            let mut transport = Transport::new(proxy.host, proxy.port, self.config.timeout);
            proxy.stat.requests += 1;

            let outcome = self
                .attempt_once(&mut transport, &negotiator, &judge, judge_ip, judge_port)
                .await;
            transport.close().await;

            match outcome {
                Ok(level) => {
                    proxy.types.insert(tag, level);
                    proxy.log(
                        negotiator_name(tag),
                        format!("{tag} check passed"),
                        start,
                        None,
                    );
                    return true;
                }
                Err(RotaError::ProxyTimeoutError) => {
                    proxy.log(
                        negotiator_name(tag),
                        format!("attempt {attempt} timeout"),
                        start,
                        Some(&RotaError::ProxyTimeoutError),
                    );
                    continue;
                }
                Err(e) => {
                    proxy.log(negotiator_name(tag), e.to_string(), start, Some(&e));
                    return false;
                }
            }
        }
        false
    }

    async fn attempt_once(
        &self,
        transport: &mut Transport,
        negotiator: &NegotiatorKind,
        judge: &Judge,
        judge_ip: Ipv4Addr,
        judge_port: u16,
    ) -> Result<Option<AnonymityLevel>> {
        transport.connect(false, self.config.verify_ssl).await?;
        negotiator
            .negotiate(transport, &judge.host, judge_ip, judge_port, self.config.verify_ssl)
            .await?;

        if negotiator.tag() == ProtocolTag::Connect25 {
            return Ok(None);
        }

        let rv: String = format!("{:04}", rand::random::<u16>() % 10000);
        let request_headers = get_headers(Some(&rv));

        let request = build_request(
            negotiator.use_full_path(),
            self.config.post,
            judge,
            &request_headers,
        );
        transport.send(&request).await?;

        let raw = transport.recv_response().await?;
        let (header_block, body_start) = split_head_body(&raw);
        let headers = parse_headers(header_block);

        let status_line = header_block
            .split(|&b| b == b'\n')
            .next()
            .map(|l| String::from_utf8_lossy(l).trim().to_string())
            .unwrap_or_default();
        let status = crate::utils::parse_status_line(&status_line)?;
        if status.status != 200 {
            return Err(RotaError::BadStatusError(status.status.to_string()));
        }

        let body = decompress_body(&raw[body_start..], headers.get("Content-Encoding").map(|s| s.as_str()));
        let body_text = String::from_utf8_lossy(&body).to_lowercase();

        if !body_text.contains(&rv.to_lowercase()) {
            return Err(RotaError::BadResponseError);
        }
        if get_all_ip(&body_text).is_empty() {
            return Err(RotaError::BadResponseError);
        }
        if let Some(referer) = header_value(&request_headers, "Referer") {
            if !body_text.contains(&referer.to_lowercase()) {
                return Err(RotaError::BadResponseError);
            }
        }
        if let Some(cookie) = header_value(&request_headers, "Cookie") {
            if !body_text.contains(&cookie.to_lowercase()) {
                return Err(RotaError::BadResponseError);
            }
        }

        if !negotiator.check_anon_lvl() {
            return Ok(None);
        }

        let real_ip = self.config.real_ext_ip.to_string();
        let via_count = body_text.matches("via").count();
        let proxy_count = body_text.matches("proxy").count();

        let level = if body_text.contains(&real_ip) {
            AnonymityLevel::Transparent
        } else if via_count > judge.marks.via || proxy_count > judge.marks.proxy {
            AnonymityLevel::Anonymous
        } else {
            AnonymityLevel::High
        };
        Ok(Some(level))
    }

    /// Applies the caller's type filter. Non-strict: any single matching
    /// `(tag, level)` is enough. Strict: prunes every non-matching entry
    /// from `proxy.types`, keeping only entries that pass.
    fn types_passed(&self, proxy: &mut Proxy) -> bool {
        if self.config.types.is_empty() {
            return true;
        }

        if !self.config.strict {
            return proxy.types.iter().any(|(tag, level)| self.tag_passes(*tag, *level));
        }

        let keep: HashMap<ProtocolTag, Option<AnonymityLevel>> = proxy
            .types
            .iter()
            .filter(|(tag, level)| self.tag_passes(**tag, **level))
            .map(|(t, l)| (*t, *l))
            .collect();
        proxy.types = keep;
        !proxy.types.is_empty()
    }

    fn tag_passes(&self, tag: ProtocolTag, level: Option<AnonymityLevel>) -> bool {
        match self.config.types.get(&tag) {
            None => false,
            Some(None) => true,
            Some(Some(levels)) => match level {
                None => true,
                Some(lvl) => levels.contains(&lvl),
            },
        }
    }
}

fn negotiator_name(tag: ProtocolTag) -> &'static str {
    tag.as_str()
}

fn split_head_body(raw: &[u8]) -> (&[u8], usize) {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        (&raw[..pos], pos + 4)
    } else {
        (raw, raw.len())
    }
}

fn build_request(use_full_path: bool, post: bool, judge: &Judge, headers: &[(&'static str, String)]) -> Vec<u8> {
    let method = if post { "POST" } else { "GET" };
    let target = if use_full_path {
        judge.url.clone()
    } else {
        judge.path.clone()
    };
    let mut req = format!("{method} {target} HTTP/1.1\r\nHost: {}\r\n", judge.host);
    for (k, v) in headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if post {
        req.push_str("Content-Length: 0\r\n");
    }
    req.push_str("Connection: close\r\n\r\n");
    req.into_bytes()
}

/// The literal `Referer`/`Cookie` values `build_request` sends, which §4.5
/// requires to reappear verbatim in a working judge's echoed body.
fn header_value<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::GeoData;

    fn sample_proxy() -> Proxy {
        Proxy::new(Ipv4Addr::new(1, 2, 3, 4), 8080, vec![], GeoData::unknown())
    }

    #[tokio::test]
    async fn check_judges_with_no_urls_disables_every_active_tag() {
        let mut filter = TypeFilter::new();
        filter.insert(ProtocolTag::Http, None);
        filter.insert(ProtocolTag::Connect25, None);
        let config = CheckerConfig {
            max_tries: 1,
            timeout: Duration::from_millis(50),
            verify_ssl: false,
            strict: false,
            dnsbl: vec![],
            real_ext_ip: Ipv4Addr::new(9, 9, 9, 9),
            types: filter,
            post: false,
        };
        let checker = Checker::new(
            config,
            vec![],
            Arc::new(Resolver::new(None, Duration::from_millis(50)).unwrap()),
        );
        checker.check_judges().await;
        assert!(checker.has_no_active_tags());

        let mut proxy = sample_proxy();
        assert!(!checker.check(&mut proxy).await);
        assert!(!proxy.is_working);
    }

    #[test]
    fn types_passed_accepts_any_match_when_not_strict() {
        let mut filter = TypeFilter::new();
        filter.insert(ProtocolTag::Http, None);
        let config = CheckerConfig {
            max_tries: 1,
            timeout: Duration::from_secs(1),
            verify_ssl: false,
            strict: false,
            dnsbl: vec![],
            real_ext_ip: Ipv4Addr::new(9, 9, 9, 9),
            types: filter,
            post: false,
        };
        let checker = Checker::new(
            config,
            vec![],
            Arc::new(Resolver::new(None, Duration::from_secs(1)).unwrap()),
        );
        let mut proxy = sample_proxy();
        proxy.types.insert(ProtocolTag::Http, Some(AnonymityLevel::High));
        assert!(checker.types_passed(&mut proxy));
    }

    #[test]
    fn strict_mode_prunes_non_matching_entries() {
        let mut filter = TypeFilter::new();
        filter.insert(ProtocolTag::Http, Some([AnonymityLevel::High].into_iter().collect()));
        let config = CheckerConfig {
            max_tries: 1,
            timeout: Duration::from_secs(1),
            verify_ssl: false,
            strict: true,
            dnsbl: vec![],
            real_ext_ip: Ipv4Addr::new(9, 9, 9, 9),
            types: filter,
            post: false,
        };
        let checker = Checker::new(
            config,
            vec![],
            Arc::new(Resolver::new(None, Duration::from_secs(1)).unwrap()),
        );
        let mut proxy = sample_proxy();
        proxy.types.insert(ProtocolTag::Http, Some(AnonymityLevel::Anonymous));
        assert!(!checker.types_passed(&mut proxy));
        assert!(proxy.types.is_empty());
    }
}
