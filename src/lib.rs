pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod dedup;
pub mod interface;
pub mod logging;
pub mod options;
pub mod overrides;
pub mod pool;
pub mod probe;
pub mod rawlink;
pub mod relay;
pub mod sched;
pub mod scope;
pub mod server;
pub mod signal;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod tests;

pub use cache::{Clock, ManualClock, SystemClock, TimedCache};
pub use config::{Config, ConfigError};
pub use context::ServerContext;
pub use interface::{Answer, Interface, InterfaceKind};
pub use pool::{Algorithm, DhcpPool, PoolError, EVICTED_MAC, FREE_MAC};
pub use scope::NetworkScope;
