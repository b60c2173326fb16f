//! A rewriting forward proxy for HTTP and HTTPS traffic.
//!
//! The proxy terminates client TLS via CONNECT interception, applies
//! per-client rewrite rules to URLs, headers, bodies, and status lines, and
//! can throttle or delay traffic. Rules are managed at runtime through an
//! admin API, reachable both on a dedicated listener and through the proxy
//! itself at the magic host.

pub mod admin;
pub mod client_session;
pub mod conn_set;
pub mod hook;
pub mod http1;
pub mod message;
pub mod proxy;
pub mod rewrite_hook;
pub mod server_session;

pub use admin::{run_admin_listener, AdminApi};
pub use hook::{ModifyHook, PassthroughHook, RequestDecision};
pub use message::{Body, Request, Response, Version};
pub use proxy::{Proxy, ProxyConfig, ProxyError};
pub use rewrite_hook::{
    spawn_table_sweeper, RewriteHook, SharedTables, ADMIN_HOST, DEFAULT_CLIENT_EXPIRY,
    SWEEP_PERIOD,
};
pub use server_session::ServerSession;
