use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tamper_proxy::{
    run_admin_listener, spawn_table_sweeper, AdminApi, Proxy, ProxyConfig, ProxyError,
    RewriteHook, SharedTables, DEFAULT_CLIENT_EXPIRY, SWEEP_PERIOD,
};
use tamper_tls::{build_upstream_client_config, CertSigner};

/// Rewriting forward proxy for HTTP and HTTPS traffic.
#[derive(Debug, Parser)]
#[command(name = "tamper", version)]
struct Args {
    /// Proxy listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "TAMPER_LISTEN")]
    listen: SocketAddr,

    /// Admin API listen address.
    #[arg(long, default_value = "127.0.0.1:8081", env = "TAMPER_ADMIN_LISTEN")]
    admin_listen: SocketAddr,

    /// Path to the CA certificate (PEM).
    #[arg(long, default_value = "ca.pem", env = "TAMPER_CA_CERT")]
    ca_cert: String,

    /// Path to the CA private key (PEM, RSA).
    #[arg(long, default_value = "key.pem", env = "TAMPER_CA_KEY")]
    ca_key: String,

    /// CONNECT requests to this port are TLS-intercepted.
    #[arg(long, default_value_t = 443)]
    mitm_port: u16,

    /// Seconds a client connection may sit idle before it is closed.
    #[arg(long, default_value_t = 100)]
    idle_timeout_secs: u64,

    /// Seconds to wait for upstream response headers.
    #[arg(long, default_value_t = 30)]
    response_header_timeout_secs: u64,

    /// Largest accepted HTTP head, in bytes.
    #[arg(long, default_value_t = 20000)]
    max_header_bytes: usize,

    /// Live sessions beyond this count are served one request and closed.
    #[arg(long, default_value_t = 30)]
    max_conns_kept_alive: i64,

    /// Hours of inactivity after which a client's rules and throttles expire.
    #[arg(long, default_value_t = DEFAULT_CLIENT_EXPIRY.as_secs() / 3600)]
    client_expiry_hours: u64,

    /// Log response bodies at debug level.
    #[arg(long)]
    log_bodies: bool,

    /// Verify upstream certificates against the webpki roots instead of
    /// accepting anything.
    #[arg(long)]
    verify_upstream: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(error) = run(args).await {
        tracing::error!(%error, "proxy failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ProxyError> {
    let signer = Arc::new(CertSigner::from_pem_files(&args.ca_cert, &args.ca_key)?);
    let upstream_tls = build_upstream_client_config(!args.verify_upstream)?;

    let tables = SharedTables::new();
    spawn_table_sweeper(
        Arc::clone(&tables),
        SWEEP_PERIOD,
        Duration::from_secs(args.client_expiry_hours * 3600),
    );

    let ca_pem = signer.ca_cert_pem().to_string();
    let hook = Arc::new(RewriteHook::new(
        Arc::clone(&tables),
        AdminApi::new(Arc::clone(&tables), ca_pem.clone()),
        args.log_bodies,
    ));

    let admin_listener = TcpListener::bind(args.admin_listen).await?;
    tracing::info!(listen = %args.admin_listen, "admin API listening");
    let admin_api = Arc::new(AdminApi::new(Arc::clone(&tables), ca_pem));
    let max_header_bytes = args.max_header_bytes;
    tokio::spawn(async move {
        if let Err(error) = run_admin_listener(admin_listener, admin_api, max_header_bytes).await {
            tracing::error!(%error, "admin listener failed");
        }
    });

    let config = ProxyConfig {
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        max_header_bytes: args.max_header_bytes,
        max_conns_kept_alive: args.max_conns_kept_alive,
        response_header_timeout: Duration::from_secs(args.response_header_timeout_secs),
        mitm_port: args.mitm_port,
    };
    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, "proxy listening");
    Proxy::new(config, signer, hook, upstream_tls)
        .listen(listener)
        .await?;
    Ok(())
}
