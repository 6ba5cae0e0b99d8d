//! The pipeline controller: fans candidates out from providers, through the
//! checker, and into the result channel the pool/CLI consumes from.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checker::Checker;
use crate::provider::ProxySource;
use crate::proxy::{Proxy, ProtocolTag};

/// Pause between grab cycles while `serve` keeps feeding its pool.
const GRAB_PAUSE: Duration = Duration::from_secs(180);

pub struct BrokerConfig {
    pub countries: Vec<String>,
    pub limit: usize,
    pub max_conn: usize,
}

pub struct Broker {
    providers: Vec<Arc<dyn ProxySource>>,
    resolver: Arc<crate::resolver::Resolver>,
    unique: DashMap<(Ipv4Addr, u16), Proxy>,
    countries: Vec<String>,
    remaining: AtomicI64,
    on_check: Arc<Semaphore>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    out_tx: mpsc::Sender<Proxy>,
}

impl Broker {
    pub fn new(
        resolver: Arc<crate::resolver::Resolver>,
        providers: Vec<Arc<dyn ProxySource>>,
        config: BrokerConfig,
        out_tx: mpsc::Sender<Proxy>,
    ) -> Self {
        let remaining = if config.limit == 0 {
            i64::MAX
        } else {
            config.limit as i64
        };
        Broker {
            providers,
            resolver,
            unique: DashMap::new(),
            countries: config.countries,
            remaining: AtomicI64::new(remaining),
            on_check: Arc::new(Semaphore::new(config.max_conn.max(1))),
            tasks: parking_lot::Mutex::new(Vec::new()),
            out_tx,
        }
    }

    /// Gathers unchecked proxies from every provider once and pushes each
    /// unique, in-country candidate straight to the result channel.
    pub async fn grab(self: &Arc<Self>) {
        self.grab_cycle(None).await;
        info!(total = self.unique.len(), "grab complete");
    }

    /// Repeatedly sweeps the providers, running each candidate through
    /// `checker`. Assumes `checker.check_judges()` has already run (the
    /// caller validates judges up front so an all-schemes-dead run can be
    /// rejected before this ever starts). `continuous = true` keeps sweeping
    /// (pausing `GRAB_PAUSE` between passes) until `stop` is called, which is
    /// how `serve` keeps a pool topped up; otherwise it stops after the
    /// in-flight checks from a single pass drain.
    pub async fn find(self: &Arc<Self>, checker: Arc<Checker>, continuous: bool) {
        loop {
            self.grab_cycle(Some(&checker)).await;
            if !continuous {
                break;
            }
            tokio::time::sleep(GRAB_PAUSE).await;
        }
        self.join_checks().await;
        info!(total = self.unique.len(), "find complete");
    }

    async fn grab_cycle(self: &Arc<Self>, checker: Option<&Arc<Checker>>) {
        for provider in self.providers.clone() {
            let proxies = match provider.get_proxies().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "provider fetch failed");
                    continue;
                }
            };
            for raw in proxies {
                if self.limit_reached() {
                    return;
                }
                self.handle(raw, checker).await;
            }
        }
        debug!("grab cycle complete");
    }

    async fn handle(self: &Arc<Self>, raw: crate::provider::RawProxy, checker: Option<&Arc<Checker>>) {
        let Ok(ip) = self.resolver.resolve(&raw.host).await else {
            return;
        };
        if self.unique.contains_key(&(ip, raw.port)) {
            return;
        }
        let geo = self.resolver.geo(ip);
        let mut proxy = Proxy::new(ip, raw.port, raw.hint, geo);
        if !self.geo_passed(&mut proxy) {
            return;
        }
        self.unique.insert((ip, raw.port), proxy.clone());

        match checker {
            Some(checker) => self.push_to_check(proxy, checker.clone()).await,
            None => self.push_to_result(proxy).await,
        }
    }

    fn geo_passed(&self, proxy: &mut Proxy) -> bool {
        if self.countries.is_empty() {
            return true;
        }
        if self.countries.contains(&proxy.geo.code) {
            true
        } else {
            proxy.log(
                "broker",
                "proxy location is outside the given countries list",
                std::time::Instant::now(),
                None,
            );
            false
        }
    }

    async fn push_to_check(self: &Arc<Self>, mut proxy: Proxy, checker: Arc<Checker>) {
        let Ok(permit) = self.on_check.clone().acquire_owned().await else {
            return;
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let passed = checker.check(&mut proxy).await;
            drop(permit);
            this.unique.insert((proxy.host, proxy.port), proxy.clone());
            if passed {
                this.push_to_result(proxy).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn push_to_result(self: &Arc<Self>, proxy: Proxy) {
        debug!(addr = %proxy.addr(), "push to result");
        if self.out_tx.send(proxy).await.is_ok() {
            self.update_limit();
        }
    }

    fn update_limit(&self) {
        if self.remaining.load(Ordering::SeqCst) > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn limit_reached(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }

    async fn join_checks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Cancels every in-flight check task. Used to tear down a `serve` run.
    pub fn stop(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!("broker stopped");
    }

    /// Prints an aggregate report of everything seen this run: per-protocol
    /// counts, working total, and accumulated error counts. `verbose` also
    /// dumps each working proxy's negotiation log.
    pub fn show_stats(&self, verbose: bool) {
        let found: Vec<Proxy> = self.unique.iter().map(|e| e.value().clone()).collect();
        if found.is_empty() {
            println!("Proxy not found");
            return;
        }

        let num_working = found.iter().filter(|p| p.is_working).count();

        let mut errors: HashMap<&'static str, u64> = HashMap::new();
        for p in &found {
            for (k, v) in &p.stat.errors {
                *errors.entry(k).or_insert(0) += v;
            }
        }

        let mut by_type: HashMap<ProtocolTag, Vec<String>> = HashMap::new();
        for tag in ProtocolTag::ALL {
            by_type.insert(tag, Vec::new());
        }
        for p in &found {
            for tag in p.types.keys() {
                by_type.entry(*tag).or_default().push(p.addr());
            }
        }

        if verbose {
            println!("Stats:");
            for p in found.iter().filter(|p| p.is_working) {
                println!("{}", p.addr());
                for entry in &p.log {
                    println!(
                        "\t{:<12} {:<60} runtime={:.2?}",
                        entry.negotiator, entry.message, entry.runtime
                    );
                }
            }
        }

        println!("The number of working proxies: {num_working}");
        for tag in ProtocolTag::ALL {
            let addrs = &by_type[&tag];
            println!("{} ({}): {:?}", tag.as_str(), addrs.len(), addrs);
        }
        println!("Errors: {errors:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::GeoData;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn grab_cycle_respects_limit() {
        let (tx, mut rx) = mpsc::channel(8);
        let resolver = Arc::new(crate::resolver::Resolver::new(None, Duration::from_secs(1)).unwrap());
        let broker = Arc::new(Broker::new(
            resolver,
            vec![],
            BrokerConfig {
                countries: vec![],
                limit: 1,
                max_conn: 10,
            },
            tx,
        ));
        broker.push_to_result(Proxy::new(Ipv4Addr::new(1, 1, 1, 1), 80, vec![], GeoData::unknown())).await;
        assert!(broker.limit_reached());
        drop(broker);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn geo_passed_accepts_when_no_country_filter() {
        let resolver = Arc::new(crate::resolver::Resolver::new(None, Duration::from_secs(1)).unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let broker = Broker::new(
            resolver,
            vec![],
            BrokerConfig {
                countries: vec![],
                limit: 0,
                max_conn: 10,
            },
            tx,
        );
        let mut p = Proxy::new(Ipv4Addr::new(1, 1, 1, 1), 80, vec![], GeoData::unknown());
        assert!(broker.geo_passed(&mut p));
    }
}
