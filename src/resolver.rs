//! Hostname resolution, literal-IP detection, GeoIP lookup, and external-IP
//! discovery (the broker's only window onto the outside world that isn't
//! mediated by a candidate proxy).

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{Result, RotaError};
use crate::proxy::GeoData;

/// Public "echo my IP" endpoints, each tried at most once per
/// `external_ip()` call, in random order.
const IP_ECHO_HOSTS: &[&str] = &[
    "https://ifconfig.co/ip",
    "https://wtfismyip.com/text",
    "https://api.ipify.org",
    "https://ipinfo.io/ip",
    "https://ipv4.icanhazip.com",
    "https://myexternalip.com/raw",
    "https://ifconfig.io/ip",
];

pub struct Resolver {
    client: reqwest::Client,
    geoip: Option<maxminddb::Reader<Vec<u8>>>,
    cache: DashMap<String, Ipv4Addr>,
    dns_timeout: Duration,
}

impl Resolver {
    pub fn new(geoip_db: Option<&Path>, dns_timeout: Duration) -> Result<Self> {
        let geoip = match geoip_db {
            Some(path) => Some(
                maxminddb::Reader::open_readfile(path)
                    .map_err(|e| RotaError::InvalidConfig(format!("geoip db: {e}")))?,
            ),
            None => None,
        };
        Ok(Resolver {
            client: reqwest::Client::new(),
            geoip,
            cache: DashMap::new(),
            dns_timeout,
        })
    }

    pub fn is_ip(s: &str) -> bool {
        Ipv4Addr::from_str(s).is_ok()
    }

    /// Returns `host` unchanged if already an IPv4 literal; otherwise
    /// performs an A-record lookup with a deadline, caching the first
    /// answer per host for the resolver's lifetime.
    pub async fn resolve(&self, host: &str) -> Result<Ipv4Addr> {
        if let Ok(ip) = Ipv4Addr::from_str(host) {
            return Ok(ip);
        }
        if let Some(ip) = self.cache.get(host) {
            return Ok(*ip);
        }

        let lookup_host = format!("{host}:0");
        let resolved = timeout(self.dns_timeout, tokio::net::lookup_host(lookup_host))
            .await
            .map_err(|_| RotaError::ResolveError {
                host: host.to_string(),
            })?
            .map_err(|_| RotaError::ResolveError {
                host: host.to_string(),
            })?;

        let ip = resolved
            .filter_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| RotaError::ResolveError {
                host: host.to_string(),
            })?;

        self.cache.insert(host.to_string(), ip);
        Ok(ip)
    }

    /// Synchronous GeoIP lookup; missing entries (or no database configured)
    /// yield the `Unknown` fallback record rather than failing the caller.
    pub fn geo(&self, ip: Ipv4Addr) -> GeoData {
        let Some(reader) = &self.geoip else {
            return GeoData::unknown();
        };
        let Ok(city) = reader.lookup::<maxminddb::geoip2::City>(ip.into()) else {
            return GeoData::unknown();
        };
        let Some(city) = city else {
            return GeoData::unknown();
        };

        let code = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(str::to_string)
            .unwrap_or_else(|| "--".to_string());
        let name = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let region = city.subdivisions.as_ref().and_then(|s| s.first());
        let region_code = region
            .and_then(|r| r.iso_code)
            .map(str::to_string)
            .unwrap_or_else(|| "Unknown".to_string());
        let region_name = region
            .and_then(|r| r.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|n| n.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        GeoData {
            code,
            name,
            region_code,
            region_name,
            city_name,
        }
    }

    /// Probes a randomized subset of public echo endpoints until one
    /// returns a body that parses as an IPv4 literal.
    pub async fn external_ip(&self) -> Result<Ipv4Addr> {
        let mut hosts: Vec<&str> = IP_ECHO_HOSTS.to_vec();
        hosts.shuffle(&mut rand::thread_rng());

        for url in hosts {
            match self.try_echo(url).await {
                Ok(ip) => return Ok(ip),
                Err(e) => warn!(url, error = %e, "external ip echo host failed"),
            }
        }
        Err(RotaError::Internal(
            "exhausted all external-ip echo endpoints".into(),
        ))
    }

    async fn try_echo(&self, url: &str) -> Result<Ipv4Addr> {
        let resp = timeout(self.dns_timeout, self.client.get(url).send()).await??;
        let body = resp.text().await?;
        Ipv4Addr::from_str(body.trim())
            .map_err(|_| RotaError::Internal(format!("non-IP body from {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ip_accepts_dotted_quad() {
        assert!(Resolver::is_ip("127.0.0.1"));
        assert!(!Resolver::is_ip("not-an-ip"));
        assert!(!Resolver::is_ip("256.0.0.1"));
    }

    #[tokio::test]
    async fn resolve_passes_through_literal_ip() {
        let resolver = Resolver::new(None, Duration::from_secs(1)).unwrap();
        let ip = resolver.resolve("10.0.0.1").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn geo_falls_back_without_database() {
        let resolver = Resolver::new(None, Duration::from_secs(1)).unwrap();
        assert_eq!(resolver.geo(Ipv4Addr::new(8, 8, 8, 8)), GeoData::unknown());
    }
}
