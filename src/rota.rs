//! Library-level facade: wires the resolver, providers, checker, broker,
//! pool, and dispatch server together into the three top-level operations a
//! consumer actually calls (`grab`, `find`, and `serve`), plus the `Handle`
//! used to stop a run and pull an aggregate report out of it.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::broker::{Broker, BrokerConfig};
use crate::checker::{Checker, CheckerConfig, TypeFilter};
use crate::error::{Result, RotaError};
use crate::pool::{PoolConfig, ProxyPool};
use crate::provider::{Provider, ProxySource, RawProxy, StaticProvider};
use crate::proxy::{JudgeScheme, Proxy, ProtocolTag};
use crate::resolver::Resolver;
use crate::server::{Server, ServerConfig};

/// Default judge URLs used when the caller supplies none: the well-known
/// public "what's my IP" echo pages this kind of check has historically
/// relied on. No built-in SMTP default; SMTP judges have no natural
/// "echo my IP" equivalent and must be supplied explicitly when CONNECT:25
/// checking is wanted.
pub const DEFAULT_JUDGES: &[(&str, JudgeScheme)] = &[
    ("http://httpheader.net/azenv.php", JudgeScheme::Http),
    ("https://www.proxy-listen.de/azenv.php", JudgeScheme::Https),
];

/// Everything shared by `grab`, `find`, and `serve` that concerns talking to
/// the network: concurrency caps, judges, providers, and TLS policy.
pub struct NetworkConfig {
    pub max_conn: usize,
    pub max_tries: u32,
    pub timeout: Duration,
    pub judges: Vec<(String, JudgeScheme)>,
    pub providers: Vec<(String, Vec<ProtocolTag>)>,
    pub verify_ssl: bool,
    pub geoip_db: Option<PathBuf>,
}

pub struct GrabConfig {
    pub network: NetworkConfig,
    pub countries: Vec<String>,
    pub limit: usize,
}

pub struct FindConfig {
    pub network: NetworkConfig,
    pub countries: Vec<String>,
    pub limit: usize,
    pub types: TypeFilter,
    pub data: Option<PathBuf>,
    pub dnsbl: Vec<String>,
    pub post: bool,
    pub strict: bool,
}

pub struct ServeConfig {
    pub find: FindConfig,
    pub host: String,
    pub port: u16,
    pub pool: PoolConfig,
    pub prefer_connect: bool,
    pub http_allowed_codes: Vec<u16>,
    pub backlog: u32,
}

/// A running `grab`/`find`/`serve` invocation. `stop()` cancels every
/// outstanding task and is idempotent (the second call is a no-op).
pub struct Handle {
    broker: Arc<Broker>,
    stopped: AtomicBool,
    server_task: Option<JoinHandle<()>>,
}

impl Handle {
    fn new(broker: Arc<Broker>, server_task: Option<JoinHandle<()>>) -> Self {
        Handle {
            broker,
            stopped: AtomicBool::new(false),
            server_task,
        }
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.stop();
        if let Some(task) = &self.server_task {
            task.abort();
        }
    }

    /// Aggregated report over every proxy seen so far this run.
    pub fn show_stats(&self, verbose: bool) {
        self.broker.show_stats(verbose);
    }
}

/// `scheme|url` or a bare `http(s)://` url (scheme inferred from the prefix).
pub fn parse_judge_spec(spec: &str) -> Result<(String, JudgeScheme)> {
    if let Some((scheme, url)) = spec.split_once('|') {
        let scheme = match scheme.to_ascii_uppercase().as_str() {
            "HTTP" => JudgeScheme::Http,
            "HTTPS" => JudgeScheme::Https,
            "SMTP" => JudgeScheme::Smtp,
            other => {
                return Err(RotaError::InvalidConfig(format!(
                    "unknown judge scheme '{other}'"
                )))
            }
        };
        return Ok((url.to_string(), scheme));
    }
    if spec.starts_with("https://") {
        Ok((spec.to_string(), JudgeScheme::Https))
    } else if spec.starts_with("http://") {
        Ok((spec.to_string(), JudgeScheme::Http))
    } else {
        Err(RotaError::InvalidConfig(format!(
            "judge url needs a scheme prefix (or 'scheme|url'): {spec}"
        )))
    }
}

/// `TAG,TAG|url` (protocol hints) or a bare url (no hint, try everything).
pub fn parse_provider_spec(spec: &str) -> Result<(String, Vec<ProtocolTag>)> {
    match spec.split_once('|') {
        Some((tags, url)) => {
            let tags = tags
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<ProtocolTag>>>()?;
            Ok((url.to_string(), tags))
        }
        None => Ok((spec.to_string(), vec![])),
    }
}

async fn build_resolver(network: &NetworkConfig) -> Result<Arc<Resolver>> {
    Ok(Arc::new(Resolver::new(
        network.geoip_db.as_deref(),
        network.timeout,
    )?))
}

fn build_providers(network: &NetworkConfig) -> Vec<Arc<dyn ProxySource>> {
    network
        .providers
        .iter()
        .cloned()
        .map(|(url, proto)| {
            Arc::new(Provider::new(url, proto, network.max_conn, network.timeout))
                as Arc<dyn ProxySource>
        })
        .collect()
}

/// Builds a `StaticProvider` from a newline-delimited `host:port` file, the
/// `--data` path for checking a fixed list instead of crawling providers.
async fn load_static_provider(path: &Path) -> Result<Arc<dyn ProxySource>> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.rsplit_once(':').and_then(|(h, p)| p.parse().ok().map(|p| (h, p))) {
            Some((host, port)) => entries.push(RawProxy {
                host: host.to_string(),
                port,
                hint: vec![],
            }),
            None => warn!(line, "skipping malformed --data line"),
        }
    }
    Ok(Arc::new(StaticProvider::new(entries)))
}

/// Shared setup for `find` and `serve`: resolves the broker's own external
/// IP (needed for the `Transparent` anonymity check), builds the provider
/// list (crawled + `--data`), and constructs the checker.
async fn setup_find(
    config: FindConfig,
) -> Result<(Arc<Resolver>, Arc<Broker>, Arc<Checker>, mpsc::Receiver<Proxy>)> {
    if config.types.is_empty() {
        return Err(RotaError::InvalidConfig(
            "find requires at least one entry in --types".into(),
        ));
    }

    let resolver = build_resolver(&config.network).await?;
    let real_ext_ip: Ipv4Addr = resolver.external_ip().await?;

    let mut providers = build_providers(&config.network);
    if let Some(path) = &config.data {
        providers.push(load_static_provider(path).await?);
    }
    if providers.is_empty() {
        warn!("find started with zero providers and no --data; the output channel will only close");
    }

    let judges = if config.network.judges.is_empty() {
        DEFAULT_JUDGES
            .iter()
            .map(|(url, scheme)| (url.to_string(), *scheme))
            .collect()
    } else {
        config.network.judges.clone()
    };

    let checker = Arc::new(Checker::new(
        CheckerConfig {
            max_tries: config.network.max_tries,
            timeout: config.network.timeout,
            verify_ssl: config.network.verify_ssl,
            strict: config.strict,
            dnsbl: config.dnsbl,
            real_ext_ip,
            types: config.types,
            post: config.post,
        },
        judges,
        resolver.clone(),
    ));

    // Validate judges up front (not inside the spawned sweep loop) so a run
    // with no working judge for any requested scheme fails immediately
    // instead of silently checking nothing forever.
    checker.check_judges().await;
    if checker.has_no_active_tags() {
        return Err(RotaError::NoJudgesAvailable);
    }

    let (tx, rx) = mpsc::channel(config.network.max_conn.max(1) * 2);
    let broker = Arc::new(Broker::new(
        resolver.clone(),
        providers,
        BrokerConfig {
            countries: config.countries,
            limit: config.limit,
            max_conn: config.network.max_conn,
        },
        tx,
    ));

    Ok((resolver, broker, checker, rx))
}

/// Gathers unchecked proxies only; streams them on the returned channel,
/// which closes once every provider has been swept (or `limit` is hit).
pub async fn grab(config: GrabConfig) -> Result<(Handle, mpsc::Receiver<Proxy>)> {
    let resolver = build_resolver(&config.network).await?;
    let providers = build_providers(&config.network);
    if providers.is_empty() {
        warn!("grab started with zero providers configured");
    }

    let (tx, rx) = mpsc::channel(config.network.max_conn.max(1) * 2);
    let broker = Arc::new(Broker::new(
        resolver,
        providers,
        BrokerConfig {
            countries: config.countries,
            limit: config.limit,
            max_conn: config.network.max_conn,
        },
        tx,
    ));

    let task_broker = broker.clone();
    tokio::spawn(async move {
        task_broker.grab().await;
    });

    Ok((Handle::new(broker, None), rx))
}

/// Gathers and checks proxies against `config.types`; streams accepted
/// proxies on the returned channel until every provider has been swept once
/// (or `limit` is hit), then closes it.
pub async fn find(config: FindConfig) -> Result<(Handle, mpsc::Receiver<Proxy>)> {
    let (_resolver, broker, checker, rx) = setup_find(config).await?;

    let task_broker = broker.clone();
    tokio::spawn(async move {
        task_broker.find(checker, false).await;
    });

    Ok((Handle::new(broker, None), rx))
}

/// Starts the dispatch server, fed continuously by a `find` that never stops
/// sweeping providers (`GRAB_PAUSE` between passes). Requires `limit > 0`.
pub async fn serve(config: ServeConfig) -> Result<Handle> {
    if config.find.limit == 0 {
        return Err(RotaError::InvalidConfig(
            "serve requires a non-zero --limit".into(),
        ));
    }

    let host = config.host;
    let port = config.port;
    let backlog = config.backlog;
    let prefer_connect = config.prefer_connect;
    let http_allowed_codes = config.http_allowed_codes;
    let timeout = config.find.network.timeout;
    let max_tries = config.find.network.max_tries;
    let pool_config = config.pool;

    let (resolver, broker, checker, rx) = setup_find(config.find).await?;

    let task_broker = broker.clone();
    tokio::spawn(async move {
        task_broker.find(checker, true).await;
    });

    let pool = ProxyPool::new(pool_config, rx);
    let server = Arc::new(Server::new(
        ServerConfig {
            host,
            port,
            timeout,
            max_tries,
            prefer_connect,
            http_allowed_codes,
            backlog,
        },
        pool,
        resolver,
    ));

    let server_for_task = server.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server_for_task.run().await {
            tracing::error!(error = %e, "dispatch server stopped");
        }
    });

    Ok(Handle::new(broker, Some(server_task)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_judge_spec_infers_scheme_from_prefix() {
        let (url, scheme) = parse_judge_spec("https://example.com/ip").unwrap();
        assert_eq!(url, "https://example.com/ip");
        assert!(matches!(scheme, JudgeScheme::Https));
    }

    #[test]
    fn parse_judge_spec_honors_explicit_scheme() {
        let (url, scheme) = parse_judge_spec("smtp|smtp://mail.example.com").unwrap();
        assert_eq!(url, "smtp://mail.example.com");
        assert!(matches!(scheme, JudgeScheme::Smtp));
    }

    #[test]
    fn parse_judge_spec_rejects_schemeless_bare_url() {
        assert!(parse_judge_spec("example.com/ip").is_err());
    }

    #[test]
    fn parse_provider_spec_parses_hint_list() {
        let (url, tags) = parse_provider_spec("HTTP,SOCKS5|http://example.com/list").unwrap();
        assert_eq!(url, "http://example.com/list");
        assert_eq!(tags, vec![ProtocolTag::Http, ProtocolTag::Socks5]);
    }

    #[test]
    fn parse_provider_spec_bare_url_has_no_hint() {
        let (url, tags) = parse_provider_spec("http://example.com/list").unwrap();
        assert_eq!(url, "http://example.com/list");
        assert!(tags.is_empty());
    }
}
