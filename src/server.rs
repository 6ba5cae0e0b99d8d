//! The local dispatch proxy: accepts standard HTTP/CONNECT requests and
//! relays each through a proxy pulled from the pool, retrying with a
//! different proxy on failure. Also answers a small in-band control API.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, RotaError};
use crate::pool::ProxyPool;
use crate::proxy::{NegotiatorKind, Proxy, ProtocolTag, Transport};
use crate::resolver::Resolver;
use crate::utils::parse_headers;

const CONNECTED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const HISTORY_CAPACITY: usize = 10_000;
const HISTORY_TTL: Duration = Duration::from_secs(600);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub max_tries: u32,
    pub prefer_connect: bool,
    pub http_allowed_codes: Vec<u16>,
    pub backlog: u32,
}

struct HistoryEntry {
    proxy: String,
    inserted: Instant,
}

impl HistoryEntry {
    fn expired(&self) -> bool {
        self.inserted.elapsed() > HISTORY_TTL
    }
}

pub struct Server {
    config: ServerConfig,
    pool: Mutex<ProxyPool>,
    resolver: Arc<Resolver>,
    history: DashMap<(IpAddr, String), HistoryEntry>,
}

impl Server {
    pub fn new(config: ServerConfig, pool: ProxyPool, resolver: Arc<Resolver>) -> Self {
        Server {
            config,
            pool: Mutex::new(pool),
            resolver,
            history: DashMap::new(),
        }
    }

    /// Binds the listener and accepts connections until cancelled. Every
    /// accepted connection is handled on its own task; a per-connection
    /// failure is logged, never fatal to the listener.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(
            addr = %listener.local_addr()?,
            backlog = self.config.backlog,
            "dispatch server listening",
        );

        loop {
            let (socket, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle(socket, peer).await {
                    debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    async fn handle(self: Arc<Self>, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!(%peer, "accepted connection");
        let request = parse_request(&mut client, self.config.timeout).await?;

        if is_control_request(&request) {
            return self.handle_control(&request, peer, &mut client).await;
        }

        let https = request.method.eq_ignore_ascii_case("CONNECT");
        let mut last_err = RotaError::NoProxyError;

        for attempt in 0..self.config.max_tries.max(1) {
            let mut proxy = self.pool.lock().await.get(https).await?;
            let Some(tag) = choice_proto(&proxy, https, self.config.prefer_connect) else {
                self.pool.lock().await.put(proxy);
                continue;
            };

            debug!(%peer, attempt, proxy = %proxy.addr(), proto = tag.as_str(), "dispatch attempt");
            let start = Instant::now();
            proxy.stat.requests += 1;
            let result = self.attempt(&proxy, tag, https, &request, &mut client).await;
            let addr = proxy.addr();

            match &result {
                Ok(()) => proxy.log(tag.as_str(), "dispatch: success", start, None),
                Err(e) => proxy.log(tag.as_str(), format!("dispatch: {e}"), start, Some(e)),
            }
            self.pool.lock().await.put(proxy);

            match result {
                Ok(()) => {
                    self.remember_history(peer.ip(), &request.target, addr);
                    return Ok(());
                }
                Err(e) => {
                    last_err = e;
                    continue;
                }
            }
        }
        Err(last_err)
    }

    async fn attempt(
        &self,
        proxy: &Proxy,
        tag: ProtocolTag,
        https: bool,
        request: &ParsedRequest,
        client: &mut TcpStream,
    ) -> Result<()> {
        let mut transport = Transport::new(proxy.host, proxy.port, self.config.timeout);
        transport.connect(false, false).await?;

        match tag {
            ProtocolTag::Http | ProtocolTag::Https => {
                transport.send(&request.raw).await?;
            }
            ProtocolTag::Connect80 | ProtocolTag::Socks4 | ProtocolTag::Socks5 => {
                let ip = self.resolver.resolve(&request.host).await?;
                NegotiatorKind(tag)
                    .negotiate(&mut transport, &request.host, ip, request.port, false)
                    .await?;
                if https {
                    client
                        .write_all(CONNECTED)
                        .await
                        .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
                } else {
                    transport.send(&request.raw).await?;
                }
            }
            ProtocolTag::Connect25 => {
                return Err(RotaError::Internal(
                    "CONNECT:25 is an SMTP judge-only protocol, not dispatch-capable".into(),
                ));
            }
        }

        let (proxy_read, proxy_write) = transport.into_split()?;
        let (client_read, client_write) = client.split();

        let proxy_info = proxy.addr();
        let check_status = !https && !self.config.http_allowed_codes.is_empty();

        tokio::try_join!(
            stream_client_to_proxy(client_read, proxy_write, self.config.timeout),
            stream_proxy_to_client(
                proxy_read,
                client_write,
                self.config.timeout,
                &self.config.http_allowed_codes,
                check_status,
                &proxy_info,
            ),
        )?;
        Ok(())
    }

    async fn handle_control(
        &self,
        request: &ParsedRequest,
        peer: SocketAddr,
        client: &mut TcpStream,
    ) -> Result<()> {
        if let Some(rest) = request.target.strip_prefix("/api/remove/") {
            let (host, port) = rest
                .split_once(':')
                .ok_or_else(|| RotaError::InvalidRequest("malformed remove target".into()))?;
            let ip: Ipv4Addr = host
                .parse()
                .map_err(|_| RotaError::InvalidRequest("bad host in remove target".into()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| RotaError::InvalidRequest("bad port in remove target".into()))?;
            self.pool.lock().await.remove(ip, port);
            respond(client, 204, "").await
        } else if let Some(url) = request.target.strip_prefix("/api/history/url:") {
            match self.lookup_history(peer.ip(), url) {
                Some(proxy) => respond_json(client, &serde_json::json!({ "proxy": proxy }).to_string()).await,
                None => respond(client, 204, "").await,
            }
        } else {
            respond(client, 404, "").await
        }
    }

    fn remember_history(&self, ip: IpAddr, url: &str, proxy: String) {
        self.history.retain(|_, v| !v.expired());
        if self.history.len() >= HISTORY_CAPACITY {
            warn!("history cache at capacity, dropping new entry");
            return;
        }
        self.history.insert(
            (ip, url.to_string()),
            HistoryEntry {
                proxy,
                inserted: Instant::now(),
            },
        );
    }

    fn lookup_history(&self, ip: IpAddr, url: &str) -> Option<String> {
        self.history
            .get(&(ip, url.to_string()))
            .filter(|e| !e.expired())
            .map(|e| e.proxy.clone())
    }
}

fn choice_proto(proxy: &Proxy, https: bool, prefer_connect: bool) -> Option<ProtocolTag> {
    if https {
        [ProtocolTag::Https, ProtocolTag::Socks4, ProtocolTag::Socks5]
            .into_iter()
            .find(|tag| proxy.types.contains_key(tag))
    } else {
        if prefer_connect && proxy.types.contains_key(&ProtocolTag::Connect80) {
            return Some(ProtocolTag::Connect80);
        }
        [
            ProtocolTag::Http,
            ProtocolTag::Connect80,
            ProtocolTag::Socks4,
            ProtocolTag::Socks5,
        ]
        .into_iter()
        .find(|tag| proxy.types.contains_key(tag))
    }
}

struct ParsedRequest {
    raw: Vec<u8>,
    method: String,
    target: String,
    host: String,
    port: u16,
    headers: HashMap<String, String>,
}

fn is_control_request(request: &ParsedRequest) -> bool {
    request
        .headers
        .get("Host")
        .map(|h| h.eq_ignore_ascii_case("proxycontrol"))
        .unwrap_or(false)
}

async fn parse_request(client: &mut TcpStream, timeout_dur: Duration) -> Result<ParsedRequest> {
    let mut buf = vec![0u8; 65536];
    let n = tokio::time::timeout(timeout_dur, client.read(&mut buf))
        .await
        .map_err(|_| RotaError::ProxyTimeoutError)?
        .map_err(|e| RotaError::ProxyRecvError(e.to_string()))?;
    if n == 0 {
        return Err(RotaError::ProxyEmptyRecvError);
    }
    buf.truncate(n);

    let line_end = find_subslice(&buf, b"\r\n")
        .ok_or_else(|| RotaError::InvalidRequest("missing request line".into()))?;
    let request_line = String::from_utf8_lossy(&buf[..line_end]).to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RotaError::InvalidRequest("empty request line".into()))?
        .to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let headers = parse_headers(&buf);

    let (host, port) = if method.eq_ignore_ascii_case("CONNECT") {
        match target.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(443)),
            None => (target.clone(), 443),
        }
    } else {
        let host_header = headers.get("Host").cloned().unwrap_or_default();
        match host_header.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
            None => (host_header, 80),
        }
    };
    if host.is_empty() {
        return Err(RotaError::InvalidRequest("request carries no Host".into()));
    }

    // aiohttp-style clients sometimes send POST headers and body in two
    // separate reads; pull the rest through if the first read stopped
    // right at the header terminator.
    if method.eq_ignore_ascii_case("POST") && buf.ends_with(b"\r\n\r\n") {
        let mut more = vec![0u8; 65536];
        if let Ok(Ok(n2)) = tokio::time::timeout(timeout_dur, client.read(&mut more)).await {
            more.truncate(n2);
            buf.extend_from_slice(&more);
        }
    }

    Ok(ParsedRequest {
        raw: buf,
        method,
        target,
        host,
        port,
        headers,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn stream_client_to_proxy<R, W>(mut reader: R, mut writer: W, timeout_dur: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 65536];
    loop {
        let n = tokio::time::timeout(timeout_dur, reader.read(&mut buf))
            .await
            .map_err(|_| RotaError::ErrorOnStream("timeout".into()))?
            .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
    }
    Ok(())
}

/// Mirrors `stream_client_to_proxy` but inspects the first chunk: enforces
/// `http_allowed_codes` when checking is requested, then stamps
/// `X-Proxy-Info` onto it before relaying.
async fn stream_proxy_to_client<R, W>(
    mut reader: R,
    mut writer: W,
    timeout_dur: Duration,
    http_allowed_codes: &[u16],
    check_status: bool,
    proxy_info: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 65536];
    let mut first = true;
    loop {
        let n = tokio::time::timeout(timeout_dur, reader.read(&mut buf))
            .await
            .map_err(|_| RotaError::ErrorOnStream("timeout".into()))?
            .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
        if n == 0 {
            break;
        }

        if first {
            first = false;
            if check_status {
                check_response(&buf[..n], http_allowed_codes)?;
            }
            let chunk = inject_proxy_info_header(&buf[..n], proxy_info);
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
            continue;
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| RotaError::ErrorOnStream(e.to_string()))?;
    }
    Ok(())
}

fn check_response(data: &[u8], allowed: &[u16]) -> Result<()> {
    let line_end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    let line = String::from_utf8_lossy(&data[..line_end]);
    let status = crate::utils::parse_status_line(line.trim())?;
    if !allowed.contains(&status.status) {
        return Err(RotaError::BadStatusError(format!(
            "{} not in {allowed:?}",
            status.status
        )));
    }
    Ok(())
}

fn inject_proxy_info_header(data: &[u8], info: &str) -> Vec<u8> {
    match find_subslice(data, b"\r\n") {
        Some(pos) => {
            let mut out = Vec::with_capacity(data.len() + info.len() + 20);
            out.extend_from_slice(&data[..pos]);
            out.extend_from_slice(format!("\r\nX-Proxy-Info: {info}").as_bytes());
            out.extend_from_slice(&data[pos..]);
            out
        }
        None => data.to_vec(),
    }
}

async fn respond(client: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let reason = match status {
        204 => "No Content",
        404 => "Not Found",
        _ => "OK",
    };
    let resp = format!(
        "HTTP/1.1 {status} {reason}\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    client
        .write_all(resp.as_bytes())
        .await
        .map_err(|e| RotaError::ErrorOnStream(e.to_string()))
}

async fn respond_json(client: &mut TcpStream, json: &str) -> Result<()> {
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{json}",
        json.len()
    );
    client
        .write_all(resp.as_bytes())
        .await
        .map_err(|e| RotaError::ErrorOnStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::GeoData;

    fn sample_proxy(tags: &[ProtocolTag]) -> Proxy {
        let mut p = Proxy::new(Ipv4Addr::new(1, 2, 3, 4), 8080, vec![], GeoData::unknown());
        for tag in tags {
            p.types.insert(*tag, None);
        }
        p
    }

    #[test]
    fn choice_proto_prefers_connect80_when_requested() {
        let proxy = sample_proxy(&[ProtocolTag::Http, ProtocolTag::Connect80]);
        assert_eq!(choice_proto(&proxy, false, true), Some(ProtocolTag::Connect80));
        assert_eq!(choice_proto(&proxy, false, false), Some(ProtocolTag::Http));
    }

    #[test]
    fn choice_proto_picks_https_compatible_tag() {
        let proxy = sample_proxy(&[ProtocolTag::Socks5]);
        assert_eq!(choice_proto(&proxy, true, false), Some(ProtocolTag::Socks5));
    }

    #[test]
    fn inject_proxy_info_header_inserts_after_status_line() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let out = inject_proxy_info_header(data, "1.2.3.4:80");
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nX-Proxy-Info: 1.2.3.4:80\r\n"));
    }

    #[test]
    fn check_response_rejects_disallowed_status() {
        let data = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let err = check_response(data, &[200, 301]).unwrap_err();
        assert!(matches!(err, RotaError::BadStatusError(_)));
    }
}
