use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tamper_tls::CertSigner;
use thiserror::Error;

use crate::client_session::{run_session, SessionContext};
use crate::conn_set::ConnSet;
use crate::hook::ModifyHook;

/// Startup and listener failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Tls(#[from] tamper_tls::SignError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct ProxyConfig {
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
    /// Once this many sessions are live, new connections are served one
    /// request and closed.
    pub max_conns_kept_alive: i64,
    pub response_header_timeout: Duration,
    /// CONNECT requests to this port are TLS-intercepted; every other port
    /// gets an opaque tunnel.
    pub mitm_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(100),
            max_header_bytes: 20000,
            max_conns_kept_alive: 30,
            response_header_timeout: Duration::from_secs(30),
            mitm_port: 443,
        }
    }
}

/// Accept loop plus session bookkeeping. The hook decides what happens to
/// each request.
pub struct Proxy<H> {
    config: ProxyConfig,
    context: Arc<SessionContext<H>>,
    conns: Arc<ConnSet>,
}

impl<H: ModifyHook> Proxy<H> {
    pub fn new(
        config: ProxyConfig,
        signer: Arc<CertSigner>,
        hook: Arc<H>,
        upstream_tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        let context = Arc::new(SessionContext {
            hook,
            signer,
            upstream_tls,
            max_header_bytes: config.max_header_bytes,
            response_header_timeout: config.response_header_timeout,
            mitm_port: config.mitm_port,
        });
        Self {
            config,
            context,
            conns: Arc::new(ConnSet::new()),
        }
    }

    pub async fn listen(self, listener: TcpListener) -> io::Result<()> {
        let reaper = {
            let conns = Arc::clone(&self.conns);
            let idle_secs = self.config.idle_timeout.as_secs();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    conns.cancel_idle(idle_secs);
                }
            })
        };

        let result = self.accept_loop(listener).await;
        reaper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let close_after_request = self.conns.len() >= self.config.max_conns_kept_alive;
            let cancel = CancellationToken::new();
            let (id, last_active) = self.conns.insert(cancel.clone());

            let context = Arc::clone(&self.context);
            let conns = Arc::clone(&self.conns);
            tokio::spawn(async move {
                let result = run_session(
                    stream,
                    remote_addr,
                    context,
                    cancel,
                    last_active,
                    close_after_request,
                )
                .await;
                if let Err(error) = result {
                    tracing::debug!(client = %remote_addr, %error, "session ended with error");
                }
                conns.remove(id);
            });
        }
    }
}
