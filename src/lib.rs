//! Rota: a broker for free public proxy servers.
//!
//! Discovers candidate `host:port` endpoints from pluggable providers,
//! probes each one to determine which proxy protocols it speaks and how
//! much of the client's identity it leaks, and either streams the working
//! proxies to a consumer (`find`/`grab`) or dispatches inbound HTTP/HTTPS
//! traffic through the pool of discovered proxies (`serve`).

pub mod broker;
pub mod checker;
pub mod config;
pub mod error;
pub mod judge;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod resolver;
pub mod rota;
pub mod server;
pub mod utils;

pub use error::{Result, RotaError};
pub use rota::{
    find, grab, serve, FindConfig, GrabConfig, Handle, NetworkConfig, ServeConfig,
};
