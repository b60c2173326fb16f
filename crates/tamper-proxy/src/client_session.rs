use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use url::Url;

use tamper_tls::CertSigner;

use crate::conn_set::epoch_seconds;
use crate::hook::{ModifyHook, RequestDecision};
use crate::http1::{
    self, return_slot, take_returned, BodyMode, BoxedIo, BufferedConn, MessageBodyReader,
};
use crate::message::{Body, Request};
use crate::server_session::ServerSession;

/// Sentinel for `last_active` while a request is in flight, so the idle
/// reaper never counts processing time as idleness.
const BUSY: u64 = u64::MAX;

const PROXY_HEADERS: [&str; 5] = [
    "accept-encoding",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "connection",
];

/// Shared pieces every client session needs.
pub struct SessionContext<H> {
    pub hook: Arc<H>,
    pub signer: Arc<CertSigner>,
    pub upstream_tls: Arc<rustls::ClientConfig>,
    pub max_header_bytes: usize,
    pub response_header_timeout: Duration,
    pub mitm_port: u16,
}

/// Replays bytes read past a parsed boundary before touching the stream
/// again, so a TLS handshake or tunnel sees everything the client sent.
struct PrefixedIo {
    prefix: Vec<u8>,
    offset: usize,
    inner: BoxedIo,
}

impl PrefixedIo {
    fn new(prefix: Vec<u8>, inner: BoxedIo) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let n = out.remaining().min(this.prefix.len() - this.offset);
            out.put_slice(&this.prefix[this.offset..this.offset + n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Serves one accepted client connection until it closes, is cancelled, or
/// errors out.
pub async fn run_session<H: ModifyHook>(
    stream: TcpStream,
    remote_addr: SocketAddr,
    context: Arc<SessionContext<H>>,
    cancel: CancellationToken,
    last_active: Arc<AtomicU64>,
    close_after_request: bool,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let stream: BoxedIo = Box::new(stream);
    let (read_half, write_half) = tokio::io::split(stream);

    let mut session = Session {
        read: Some(BufferedConn::new(read_half)),
        write: write_half,
        upstream: ServerSession::new(
            Arc::clone(&context.upstream_tls),
            context.response_header_timeout,
            context.max_header_bytes,
        ),
        context,
        remote_addr,
        cancel,
        last_active,
        close_after_request,
        tls_terminated: false,
        tunnel_host: None,
    };
    session.run().await
}

struct Session<H> {
    read: Option<BufferedConn<ReadHalf<BoxedIo>>>,
    write: WriteHalf<BoxedIo>,
    upstream: ServerSession,
    context: Arc<SessionContext<H>>,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
    last_active: Arc<AtomicU64>,
    close_after_request: bool,
    tls_terminated: bool,
    /// CONNECT authority, used as the default host for origin-form requests
    /// after TLS interception.
    tunnel_host: Option<String>,
}

enum Step {
    Continue,
    Close,
}

impl<H: ModifyHook> Session<H> {
    async fn run(&mut self) -> io::Result<()> {
        loop {
            let mut conn = match self.read.take() {
                Some(conn) => conn,
                None => return Ok(()),
            };

            let head = tokio::select! {
                head = http1::read_request_head(&mut conn, self.context.max_header_bytes) => head?,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            let head = match head {
                Some(head) => head,
                None => return Ok(()),
            };
            self.last_active.store(BUSY, Ordering::Relaxed);

            let step = if head.method.eq_ignore_ascii_case("CONNECT") {
                self.handle_connect(conn, head).await?
            } else {
                self.handle_request(conn, head).await?
            };
            self.last_active.store(epoch_seconds(), Ordering::Relaxed);

            if matches!(step, Step::Close) {
                return Ok(());
            }
        }
    }

    async fn handle_connect(
        &mut self,
        conn: BufferedConn<ReadHalf<BoxedIo>>,
        head: http1::RequestHead,
    ) -> io::Result<Step> {
        let (host, port) = split_authority(&head.target)?;

        if port == self.context.mitm_port && !self.tls_terminated {
            // A host we cannot mint a leaf for degrades to an opaque tunnel.
            match self.context.signer.server_config_for_host(&host) {
                Ok(config) => {
                    self.write
                        .write_all(format!("{} 200 OK\r\n\r\n", head.version.as_str()).as_bytes())
                        .await?;
                    let plain = reunite(conn, &mut self.write);
                    let tls = TlsAcceptor::from(config).accept(plain).await?;

                    let boxed: BoxedIo = Box::new(tls);
                    let (read_half, write_half) = tokio::io::split(boxed);
                    self.read = Some(BufferedConn::new(read_half));
                    self.write = write_half;
                    self.tls_terminated = true;
                    self.tunnel_host = Some(head.target.clone());
                    return Ok(Step::Continue);
                }
                Err(error) => {
                    tracing::warn!(%host, %error, "leaf minting failed, tunneling instead");
                }
            }
        }

        // Opaque tunnel for everything we do not intercept.
        let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
        self.write
            .write_all(format!("{} 200 OK\r\n\r\n", head.version.as_str()).as_bytes())
            .await?;
        let mut client = reunite(conn, &mut self.write);
        tokio::select! {
            _ = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {}
            _ = self.cancel.cancelled() => {}
        }
        Ok(Step::Close)
    }

    async fn handle_request(
        &mut self,
        conn: BufferedConn<ReadHalf<BoxedIo>>,
        head: http1::RequestHead,
    ) -> io::Result<Step> {
        let url = self.resolve_url(&head)?;
        let original_url = url.to_string();
        let client_ip = self.remote_addr.ip().to_string();
        let request_closes = head.close || self.close_after_request;

        let mut headers = head.headers;
        for name in PROXY_HEADERS {
            headers.remove(name);
        }

        let slot = return_slot();
        let body_reader = MessageBodyReader::new(conn, head.body_mode, Arc::clone(&slot));
        let content_length = match head.body_mode {
            BodyMode::None => Some(0),
            BodyMode::ContentLength(length) => Some(length),
            BodyMode::Chunked | BodyMode::CloseDelimited => None,
        };

        let mut request = Request {
            method: head.method,
            url,
            version: head.version,
            headers,
            body: Body::from_reader(Box::new(body_reader), content_length),
            close: request_closes,
            remote_addr: self.remote_addr,
        };

        // A hook-supplied response is final; the client's own rewrite rules
        // must not touch it.
        let (mut response, from_hook) = match self.context.hook.modify_request(&mut request).await {
            RequestDecision::Drop => return Ok(Step::Close),
            RequestDecision::Respond(response) => {
                request.body.drain().await?;
                (response, true)
            }
            RequestDecision::Forward => match self.upstream.round_trip(&mut request).await {
                Ok(response) => (response, false),
                Err(error) => {
                    tracing::warn!(url = %original_url, %error, "upstream round trip failed");
                    return Ok(Step::Close);
                }
            },
        };

        if !from_hook {
            let hook = Arc::clone(&self.context.hook);
            hook.modify_response(&original_url, &client_ip, &mut response)
                .await;
        }
        if request_closes {
            response.close = true;
        }

        let mut close = response.close;
        let body = response.body;
        let (mut reader, framing) =
            http1::derive_wire_framing(body.reader, body.content_length, response.version, &mut close)
                .await?;
        http1::write_response(
            &mut self.write,
            response.status,
            response.reason.as_str(),
            response.version,
            &response.headers,
            close,
            &mut reader,
            &framing,
        )
        .await?;

        if close {
            return Ok(Step::Close);
        }
        match take_returned(&slot) {
            Some(conn) => {
                self.read = Some(conn);
                Ok(Step::Continue)
            }
            // The request body was never fully consumed; the connection is
            // not at a message boundary, so it cannot be reused.
            None => Ok(Step::Close),
        }
    }

    fn resolve_url(&self, head: &http1::RequestHead) -> io::Result<Url> {
        if head.target.starts_with("http://") || head.target.starts_with("https://") {
            return Url::parse(&head.target)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid request URL"));
        }

        let host = head
            .headers
            .get("host")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.tunnel_host.clone())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request has no Host header and no tunnel authority",
                )
            })?;
        let scheme = if self.tls_terminated { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{host}{}", head.target))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid request URL"))
    }
}

/// Rejoins the buffered read half with the write half, replaying any bytes
/// already pulled off the socket.
fn reunite(conn: BufferedConn<ReadHalf<BoxedIo>>, write: &mut WriteHalf<BoxedIo>) -> PrefixedIo {
    let placeholder: BoxedIo = Box::new(std::io::Cursor::new(Vec::new()));
    let (_, placeholder_write) = tokio::io::split(placeholder);
    let write = std::mem::replace(write, placeholder_write);
    let inner = conn.stream.unsplit(write);
    PrefixedIo::new(conn.read_buf, inner)
}

fn split_authority(target: &str) -> io::Result<(String, u16)> {
    let (host, port) = target.rsplit_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "CONNECT target is missing a port",
        )
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "CONNECT target port is invalid")
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
