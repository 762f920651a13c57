mod config;
mod conn;
mod error;
mod handler;
mod mitm;
mod server;
mod tunnel;

pub use config::{
    ListenConfig, LimitsConfig, MitmConfig, ProxyConfig, TimeoutConfig, TunnelConfig,
};
pub use conn::{ClientConn, Rewind, read_request};
pub use error::ProxyError;
pub use handler::{HandlerOptions, ProxyHandler, TUNNEL_ESTABLISHED};
pub use server::{ProxyServer, ServerConn};
pub use tunnel::{TunnelStats, normalize_target, splice};
