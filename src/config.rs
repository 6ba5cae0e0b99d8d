use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::error::{Result, RotaError};
use crate::proxy::record::{AnonymityLevel, ProtocolTag};

/// Command-line surface for the broker binary. Mirrors the `find | grab | serve`
/// shape of the library's three top-level operations.
#[derive(Debug, Parser)]
#[command(name = "rota", about = "Discover, check, and dispatch through free public proxies")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a MaxMind-format GeoIP database; omitted means every geo
    /// lookup falls back to the "Unknown" record.
    #[arg(long, global = true)]
    pub geoip_db: Option<PathBuf>,

    /// Log level/filter passed through to `RUST_LOG` when set.
    #[arg(long, global = true)]
    pub log: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gather unchecked proxies only.
    Grab(GrabArgs),
    /// Gather and check proxies against the requested protocol/level filter.
    Find(FindArgs),
    /// Run the dispatch server, feeding it from a continuous `find`.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
pub struct GrabArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// ISO country codes to keep; empty means no filtering.
    #[arg(short = 'c', long = "countries", value_delimiter = ',')]
    pub countries: Vec<String>,

    /// Stop after this many proxies; 0 means unbounded.
    #[arg(short, long, default_value_t = 0)]
    pub limit: usize,

    /// Write discovered `host:port` pairs to this file instead of stdout.
    #[arg(short, long)]
    pub outfile: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct FindArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Protocol tags to check for, e.g. `HTTP,HTTPS,SOCKS5`.
    #[arg(long, value_delimiter = ',', required = true)]
    pub types: Vec<ProtocolTag>,

    /// Anonymity levels accepted for `HTTP`/`HTTPS`; empty means any level.
    #[arg(long = "lvl", value_delimiter = ',')]
    pub levels: Vec<AnonymityLevel>,

    #[arg(short = 'c', long = "countries", value_delimiter = ',')]
    pub countries: Vec<String>,

    /// Newline-delimited `host:port` list to check instead of crawling providers.
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// DNSBL zones to check each candidate against before probing it.
    #[arg(long, value_delimiter = ',')]
    pub dnsbl: Vec<String>,

    /// Use POST instead of GET against judges.
    #[arg(long, default_value_t = false)]
    pub post: bool,

    /// Prune types whose anonymity level doesn't match `--lvl` instead of
    /// accepting the proxy on any single match.
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    #[arg(short, long, default_value_t = 0)]
    pub limit: usize,

    #[arg(short, long)]
    pub outfile: Option<PathBuf>,

    /// Print an aggregate report after the run completes.
    #[arg(long, default_value_t = false)]
    pub show_stats: bool,
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    #[command(flatten)]
    pub find: FindArgs,

    /// Address to bind the dispatch listener to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the dispatch listener to.
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Proxies with fewer completed requests than this are treated as
    /// "newcomers" and exempted from eviction/priority ordering.
    #[arg(long, default_value_t = 5)]
    pub min_req_proxy: u32,

    /// Evict a proxy once its error rate exceeds this fraction.
    #[arg(long, default_value_t = 0.5)]
    pub max_error_rate: f64,

    /// Evict a proxy once its average response time exceeds this many seconds.
    #[arg(long, default_value_t = 8.0)]
    pub max_resp_time: f64,

    /// Prefer `CONNECT:80` over plain `HTTP` relaying when both are available.
    #[arg(long, default_value_t = false)]
    pub prefer_connect: bool,

    /// HTTP status codes the dispatch server accepts from the upstream
    /// proxy; empty means accept anything.
    #[arg(long, value_delimiter = ',')]
    pub http_allowed_codes: Vec<u16>,

    /// TCP listen backlog.
    #[arg(long, default_value_t = 100)]
    pub backlog: u32,
}

#[derive(Debug, Clone, Parser)]
pub struct CommonArgs {
    /// Maximum proxies being checked concurrently.
    #[arg(long, default_value_t = 200)]
    pub max_conn: usize,

    /// Retries per negotiator attempt before giving up on a protocol tag.
    #[arg(long, default_value_t = 3)]
    pub max_tries: u32,

    /// Per-operation network timeout, in seconds.
    #[arg(short, long, default_value_t = 8)]
    pub timeout: u64,

    /// Judge URLs, `scheme|url` or bare URL (scheme inferred). Repeatable.
    #[arg(long = "judge")]
    pub judges: Vec<String>,

    /// Provider URLs, `proto|url` or bare URL. Repeatable.
    #[arg(long = "provider")]
    pub providers: Vec<String>,

    /// Verify TLS certificates on the HTTPS negotiator's CONNECT+TLS upgrade.
    #[arg(long, default_value_t = false)]
    pub verify_ssl: bool,
}

impl CommonArgs {
    pub fn validate(&self) -> Result<()> {
        if self.max_conn == 0 {
            return Err(RotaError::InvalidConfig("max-conn must be non-zero".into()));
        }
        if self.timeout == 0 {
            return Err(RotaError::InvalidConfig("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl ServeArgs {
    pub fn validate(&self) -> Result<()> {
        self.find.common.validate()?;
        if self.find.limit == 0 {
            return Err(RotaError::InvalidConfig(
                "serve requires a non-zero --limit".into(),
            ));
        }
        Ok(())
    }
}

/// Resolve the `ValueEnum`-derived CLI value enums used above. Kept here
/// rather than on the domain types so `proxy::record` stays framework-free.
impl ValueEnum for ProtocolTag {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            ProtocolTag::Http,
            ProtocolTag::Https,
            ProtocolTag::Socks4,
            ProtocolTag::Socks5,
            ProtocolTag::Connect80,
            ProtocolTag::Connect25,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

impl ValueEnum for AnonymityLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            AnonymityLevel::Transparent,
            AnonymityLevel::Anonymous,
            AnonymityLevel::High,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_find_with_types() {
        let cli = Cli::parse_from([
            "rota",
            "find",
            "--types",
            "HTTP,SOCKS5",
            "--limit",
            "10",
        ]);
        match cli.command {
            Command::Find(args) => {
                assert_eq!(args.types, vec![ProtocolTag::Http, ProtocolTag::Socks5]);
                assert_eq!(args.limit, 10);
            }
            _ => panic!("expected Find"),
        }
    }

    #[test]
    fn serve_rejects_zero_limit() {
        let cli = Cli::parse_from(["rota", "serve", "--types", "HTTP"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected Serve");
        };
        assert!(args.validate().is_err());
    }
}
