use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RotaError};

/// Protocol tag a negotiator can attempt against a candidate proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolTag {
    Http,
    Https,
    Socks4,
    Socks5,
    Connect80,
    Connect25,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "HTTP",
            ProtocolTag::Https => "HTTPS",
            ProtocolTag::Socks4 => "SOCKS4",
            ProtocolTag::Socks5 => "SOCKS5",
            ProtocolTag::Connect80 => "CONNECT:80",
            ProtocolTag::Connect25 => "CONNECT:25",
        }
    }

    pub const ALL: [ProtocolTag; 6] = [
        ProtocolTag::Http,
        ProtocolTag::Https,
        ProtocolTag::Socks4,
        ProtocolTag::Socks5,
        ProtocolTag::Connect80,
        ProtocolTag::Connect25,
    ];

    /// The judge scheme a checker needs validated before trying this tag.
    pub fn judge_scheme(&self) -> JudgeScheme {
        match self {
            ProtocolTag::Https => JudgeScheme::Https,
            ProtocolTag::Connect25 => JudgeScheme::Smtp,
            _ => JudgeScheme::Http,
        }
    }
}

impl FromStr for ProtocolTag {
    type Err = RotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProtocolTag::Http),
            "HTTPS" => Ok(ProtocolTag::Https),
            "SOCKS4" => Ok(ProtocolTag::Socks4),
            "SOCKS5" => Ok(ProtocolTag::Socks5),
            "CONNECT:80" => Ok(ProtocolTag::Connect80),
            "CONNECT:25" => Ok(ProtocolTag::Connect25),
            other => Err(RotaError::InvalidConfig(format!(
                "unknown protocol tag '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Oracle scheme a `Judge` validates against; distinct from `ProtocolTag`
/// because several tags share the same judge (e.g. SOCKS4/5 ride HTTP judges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JudgeScheme {
    Http,
    Https,
    Smtp,
}

impl JudgeScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeScheme::Http => "HTTP",
            JudgeScheme::Https => "HTTPS",
            JudgeScheme::Smtp => "SMTP",
        }
    }
}

/// HTTP anonymity classification; meaningful only for `HTTP`/`HTTPS` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnonymityLevel {
    Transparent,
    Anonymous,
    High,
}

impl AnonymityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityLevel::Transparent => "Transparent",
            AnonymityLevel::Anonymous => "Anonymous",
            AnonymityLevel::High => "High",
        }
    }
}

impl FromStr for AnonymityLevel {
    type Err = RotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "transparent" => Ok(AnonymityLevel::Transparent),
            "anonymous" => Ok(AnonymityLevel::Anonymous),
            "high" => Ok(AnonymityLevel::High),
            other => Err(RotaError::InvalidConfig(format!(
                "unknown anonymity level '{other}'"
            ))),
        }
    }
}

/// GeoIP record for a resolved proxy host. Missing fields are represented by
/// the `Resolver::geo` fallback rather than `Option`, matching the source's
/// "Unknown" sentinel convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoData {
    pub code: String,
    pub name: String,
    pub region_code: String,
    pub region_name: String,
    pub city_name: String,
}

impl GeoData {
    pub fn unknown() -> Self {
        GeoData {
            code: "--".into(),
            name: "Unknown".into(),
            region_code: "Unknown".into(),
            region_name: "Unknown".into(),
            city_name: "Unknown".into(),
        }
    }
}

/// Accumulated request/error counters for a proxy.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    pub requests: u64,
    pub errors: HashMap<&'static str, u64>,
}

impl Stat {
    pub fn errors_sum(&self) -> u64 {
        self.errors.values().sum()
    }
}

/// One entry in a proxy's event log: which negotiator ran, what happened,
/// and how long it took.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub negotiator: &'static str,
    pub message: String,
    pub runtime: Duration,
}

/// The primary entity: a candidate `host:port` and everything learned about
/// it during checking and dispatch.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub host: Ipv4Addr,
    pub port: u16,
    pub types: HashMap<ProtocolTag, Option<AnonymityLevel>>,
    pub expected_types: Vec<ProtocolTag>,
    pub geo: GeoData,
    pub stat: Stat,
    pub runtimes: Vec<Duration>,
    pub log: Vec<LogEntry>,
    pub is_working: bool,
}

const HTTP_PROTOS: [ProtocolTag; 4] = [
    ProtocolTag::Http,
    ProtocolTag::Connect80,
    ProtocolTag::Socks4,
    ProtocolTag::Socks5,
];
const HTTPS_PROTOS: [ProtocolTag; 3] = [ProtocolTag::Https, ProtocolTag::Socks4, ProtocolTag::Socks5];

impl Proxy {
    pub fn new(host: Ipv4Addr, port: u16, expected_types: Vec<ProtocolTag>, geo: GeoData) -> Self {
        Proxy {
            host,
            port,
            types: HashMap::new(),
            expected_types,
            geo,
            stat: Stat::default(),
            runtimes: Vec::new(),
            log: Vec::new(),
            is_working: false,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `HTTP`/`HTTPS` membership derived from the negotiated `types`, used by
    /// the pool to match a proxy against a client request's scheme.
    pub fn schemes(&self) -> (bool, bool) {
        let http = self.types.keys().any(|t| HTTP_PROTOS.contains(t));
        let https = self.types.keys().any(|t| HTTPS_PROTOS.contains(t));
        (http, https)
    }

    pub fn supports_scheme(&self, https: bool) -> bool {
        let (http, https_ok) = self.schemes();
        if https {
            https_ok
        } else {
            http
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.stat.requests == 0 {
            0.0
        } else {
            self.stat.errors_sum() as f64 / self.stat.requests as f64
        }
    }

    pub fn avg_resp_time(&self) -> f64 {
        if self.runtimes.is_empty() {
            0.0
        } else {
            let total: f64 = self.runtimes.iter().map(|d| d.as_secs_f64()).sum();
            total / self.runtimes.len() as f64
        }
    }

    /// `(error_rate, avg_resp_time)` lexicographic ordering, lower is better.
    pub fn priority(&self) -> (ordered_float::NotNan, ordered_float::NotNan) {
        (
            ordered_float::NotNan::new(self.error_rate()).unwrap_or_default(),
            ordered_float::NotNan::new(self.avg_resp_time()).unwrap_or_default(),
        )
    }

    /// Appends a log entry, bumping the error counter for `err.errmsg()` and
    /// recording the runtime unless the message mentions a timeout (timeouts
    /// would otherwise skew `avg_resp_time` toward the full deadline).
    pub fn log(&mut self, negotiator: &'static str, message: impl Into<String>, start: std::time::Instant, err: Option<&RotaError>) {
        let message = message.into();
        let runtime = start.elapsed();
        if let Some(err) = err {
            *self.stat.errors.entry(err.errmsg()).or_insert(0) += 1;
        }
        if !message.to_ascii_lowercase().contains("timeout") {
            self.runtimes.push(runtime);
        }
        let truncated: String = message.chars().take(60).collect();
        self.log.push(LogEntry {
            negotiator,
            message: truncated,
            runtime,
        });
    }
}

/// Minimal dependency-free `NotNan` so `Proxy::priority` can live in a
/// `BinaryHeap` without pulling in a comparison-by-bits crate for floats.
pub mod ordered_float {
    use std::cmp::Ordering;

    #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
    pub struct NotNan(f64);

    impl NotNan {
        pub fn new(v: f64) -> Option<Self> {
            if v.is_nan() {
                None
            } else {
                Some(NotNan(v))
            }
        }

        pub fn into_inner(self) -> f64 {
            self.0
        }
    }

    impl Eq for NotNan {}

    impl Ord for NotNan {
        fn cmp(&self, other: &Self) -> Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Proxy {
        Proxy::new(Ipv4Addr::new(1, 2, 3, 4), 8080, vec![], GeoData::unknown())
    }

    #[test]
    fn error_rate_is_zero_with_no_requests() {
        assert_eq!(sample().error_rate(), 0.0);
    }

    #[test]
    fn schemes_derive_from_types() {
        let mut p = sample();
        p.types.insert(ProtocolTag::Socks5, None);
        let (http, https) = p.schemes();
        assert!(http);
        assert!(https);
    }

    #[test]
    fn priority_orders_lower_error_rate_first() {
        let mut a = sample();
        a.stat.requests = 10;
        *a.stat.errors.entry("connection_failed").or_insert(0) = 5;
        let mut b = sample();
        b.stat.requests = 10;
        *b.stat.errors.entry("connection_failed").or_insert(0) = 1;
        assert!(b.priority() < a.priority());
    }

    #[test]
    fn log_skips_runtime_on_timeout_message() {
        let mut p = sample();
        p.log("HTTP", "request timeout waiting for judge", std::time::Instant::now(), Some(&RotaError::ProxyTimeoutError));
        assert!(p.runtimes.is_empty());
        assert_eq!(p.stat.errors_sum(), 1);
    }
}
