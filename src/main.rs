//! Thin CLI front-end over the `rota` library: parses the `find | grab |
//! serve` subcommands and drives the corresponding library entry point.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota::checker::TypeFilter;
use rota::config::{Cli, Command, CommonArgs, FindArgs, GrabArgs, ServeArgs};
use rota::pool::PoolConfig;
use rota::proxy::{AnonymityLevel, Proxy, ProtocolTag};
use rota::rota::{parse_judge_spec, parse_provider_spec, FindConfig, GrabConfig, NetworkConfig, ServeConfig};
use rota::{find, grab, serve, Result, RotaError};

/// Proxies with fewer newcomers than this in the pool trigger an eager
/// import from the broker's output channel; not part of the CLI surface,
/// kept as a sane constant like the other pool internals.
const DEFAULT_MIN_QUEUE: usize = 10;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let outcome: anyhow::Result<()> = match cli.command {
        Command::Grab(args) => run_grab(args, cli.geoip_db).await.map_err(Into::into),
        Command::Find(args) => run_find(args, cli.geoip_db).await.map_err(Into::into),
        Command::Serve(args) => run_serve(args, cli.geoip_db).await.map_err(Into::into),
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, "rota exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing(log: Option<&str>) {
    let filter = log
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "rota=info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_network(common: &CommonArgs, geoip_db: Option<PathBuf>) -> Result<NetworkConfig> {
    let judges = common
        .judges
        .iter()
        .map(|s| parse_judge_spec(s))
        .collect::<Result<Vec<_>>>()?;
    let providers = common
        .providers
        .iter()
        .map(|s| parse_provider_spec(s))
        .collect::<Result<Vec<_>>>()?;
    Ok(NetworkConfig {
        max_conn: common.max_conn,
        max_tries: common.max_tries,
        timeout: std::time::Duration::from_secs(common.timeout),
        judges,
        providers,
        verify_ssl: common.verify_ssl,
        geoip_db,
    })
}

fn build_type_filter(types: &[ProtocolTag], levels: &[AnonymityLevel]) -> TypeFilter {
    let level_set: Option<HashSet<AnonymityLevel>> = if levels.is_empty() {
        None
    } else {
        Some(levels.iter().copied().collect())
    };
    types.iter().map(|t| (*t, level_set.clone())).collect()
}

fn open_outfile(path: Option<&std::path::Path>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) => Ok(Box::new(std::fs::File::create(p)?)),
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn write_proxy_line(out: &mut dyn Write, proxy: &Proxy) -> Result<()> {
    writeln!(out, "{}", proxy.addr())?;
    Ok(())
}

async fn run_grab(args: GrabArgs, geoip_db: Option<PathBuf>) -> Result<()> {
    args.common.validate()?;
    let network = build_network(&args.common, geoip_db)?;
    let (handle, mut rx) = grab(GrabConfig {
        network,
        countries: args.countries,
        limit: args.limit,
    })
    .await?;

    let mut out = open_outfile(args.outfile.as_deref())?;
    while let Some(proxy) = rx.recv().await {
        write_proxy_line(out.as_mut(), &proxy)?;
    }
    handle.stop();
    Ok(())
}

async fn run_find(args: FindArgs, geoip_db: Option<PathBuf>) -> Result<()> {
    args.common.validate()?;
    let network = build_network(&args.common, geoip_db)?;
    let types = build_type_filter(&args.types, &args.levels);
    let show_stats = args.show_stats;
    let (handle, mut rx) = find(FindConfig {
        network,
        countries: args.countries,
        limit: args.limit,
        types,
        data: args.data,
        dnsbl: args.dnsbl,
        post: args.post,
        strict: args.strict,
    })
    .await?;

    let mut out = open_outfile(args.outfile.as_deref())?;
    while let Some(proxy) = rx.recv().await {
        write_proxy_line(out.as_mut(), &proxy)?;
    }
    if show_stats {
        handle.show_stats(false);
    }
    handle.stop();
    Ok(())
}

async fn run_serve(args: ServeArgs, geoip_db: Option<PathBuf>) -> Result<()> {
    args.validate()?;
    let network = build_network(&args.find.common, geoip_db)?;
    let types = build_type_filter(&args.find.types, &args.find.levels);

    let handle = serve(ServeConfig {
        find: FindConfig {
            network,
            countries: args.find.countries,
            limit: args.find.limit,
            types,
            data: args.find.data,
            dnsbl: args.find.dnsbl,
            post: args.find.post,
            strict: args.find.strict,
        },
        host: args.host,
        port: args.port,
        pool: PoolConfig {
            min_req_proxy: args.min_req_proxy as u64,
            max_error_rate: args.max_error_rate,
            max_resp_time: args.max_resp_time,
            min_queue: DEFAULT_MIN_QUEUE,
        },
        prefer_connect: args.prefer_connect,
        http_allowed_codes: args.http_allowed_codes,
        backlog: args.backlog,
    })
    .await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| RotaError::Internal(format!("failed to install ctrl-c handler: {e}")))?;
    tracing::info!("shutdown signal received");
    handle.stop();
    Ok(())
}
