use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::HeaderValue;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http1::{
    self, return_slot, take_returned, BodyMode, BoxedIo, BufferedConn, MessageBodyReader,
    ReturnSlot, WireFraming,
};
use crate::message::{Body, BoxedReader, Request, Response};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream connections kept alive per destination. Zero keeps one
/// destination's connection at a time; dialing a new destination closes the
/// rest first.
const MAX_POOLED_DESTINATIONS: usize = 0;

/// Marks whether any body bytes have been pulled, which decides if a failed
/// round trip may be retried on a fresh connection.
struct TrackingReader {
    inner: BoxedReader,
    used: Arc<AtomicBool>,
}

impl AsyncRead for TrackingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.used.store(true, Ordering::Relaxed);
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

struct PooledConn {
    write: WriteHalf<BoxedIo>,
    reclaim: ReturnSlot<ReadHalf<BoxedIo>>,
}

enum TripError {
    /// Dial or request-write failure; nothing of the response was consumed.
    Send(io::Error),
    /// The response side failed; the exchange cannot be replayed blindly.
    Receive(io::Error),
}

impl TripError {
    fn into_io(self) -> io::Error {
        match self {
            Self::Send(error) | Self::Receive(error) => error,
        }
    }
}

/// One client's private view of the upstream side: a per-destination
/// connection pool plus the round-trip logic. Owned exclusively by its
/// client session, so no internal locking is needed.
pub struct ServerSession {
    conns: HashMap<String, PooledConn>,
    client_config: Arc<rustls::ClientConfig>,
    response_header_timeout: Duration,
    max_header_bytes: usize,
}

impl ServerSession {
    pub fn new(
        client_config: Arc<rustls::ClientConfig>,
        response_header_timeout: Duration,
        max_header_bytes: usize,
    ) -> Self {
        Self {
            conns: HashMap::new(),
            client_config,
            response_header_timeout,
            max_header_bytes,
        }
    }

    /// Sends the request upstream and reads the response. A send-side failure
    /// with an untouched body is retried once on a fresh connection; any
    /// failure closes the whole pool.
    pub async fn round_trip(&mut self, request: &mut Request) -> io::Result<Response> {
        request.headers.insert(
            "accept-encoding",
            HeaderValue::from_static("identity, gzip, deflate, br"),
        );
        request.headers.remove("connection");
        request.headers.remove("content-length");
        request.headers.remove("transfer-encoding");

        let body = std::mem::replace(&mut request.body, Body::empty());
        let mut close = false;
        let (reader, framing) = http1::derive_wire_framing(
            body.reader,
            body.content_length,
            request.version,
            &mut close,
        )
        .await?;

        let used = Arc::new(AtomicBool::new(false));
        let mut reader: BoxedReader = Box::new(TrackingReader {
            inner: reader,
            used: Arc::clone(&used),
        });

        for attempt in 0..2 {
            match self
                .try_round_trip(request, &mut reader, &framing, close)
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) => {
                    self.conns.clear();
                    let retryable =
                        matches!(error, TripError::Send(_)) && !used.load(Ordering::Relaxed);
                    if attempt == 0 && retryable {
                        continue;
                    }
                    return Err(error.into_io());
                }
            }
        }
        unreachable!("round trip loop always returns within two attempts")
    }

    async fn try_round_trip(
        &mut self,
        request: &mut Request,
        reader: &mut BoxedReader,
        framing: &WireFraming,
        close: bool,
    ) -> Result<Response, TripError> {
        let key = destination_key(&request.url).map_err(TripError::Send)?;
        let mut read_conn = self.open(&key, &request.url).await?;
        let reclaim = self
            .conns
            .get(&key)
            .map(|entry| Arc::clone(&entry.reclaim))
            .ok_or_else(|| {
                TripError::Send(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "upstream connection missing from pool",
                ))
            })?;

        let cancel = CancellationToken::new();
        let header_timeout = self.response_header_timeout;
        let max_header_bytes = self.max_header_bytes;
        let write_half = &mut self
            .conns
            .get_mut(&key)
            .expect("pool entry present after open")
            .write;

        let write_side = async {
            tokio::select! {
                result = http1::write_request(
                    write_half,
                    &request.method,
                    &request.url,
                    request.version,
                    &request.headers,
                    close,
                    reader,
                    framing,
                ) => result,
                _ = cancel.cancelled() => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request write abandoned after response side failed",
                )),
            }
        };
        let read_side = async {
            let head = tokio::time::timeout(
                header_timeout,
                http1::read_response_head(&mut read_conn, &request.method, max_header_bytes),
            )
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for response headers",
                )
            })
            .and_then(|result| result);
            if head.is_err() {
                cancel.cancel();
            }
            head
        };

        let (write_result, head) = tokio::join!(write_side, read_side);
        let head = head.map_err(TripError::Receive)?;
        write_result.map_err(TripError::Send)?;

        if head.close {
            self.conns.remove(&key);
        }
        let body_reader = MessageBodyReader::new(read_conn, head.body_mode, reclaim);
        let content_length = match head.body_mode {
            BodyMode::None => Some(0),
            BodyMode::ContentLength(length) => Some(length),
            BodyMode::Chunked | BodyMode::CloseDelimited => None,
        };

        let mut response = Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            body: Body::from_reader(Box::new(body_reader), content_length),
            close: head.close,
        };
        decode_content_encoding(&mut response);
        Ok(response)
    }

    /// Reuses the pooled connection for `key` when its read half has been
    /// handed back, otherwise dials a fresh one.
    async fn open(
        &mut self,
        key: &str,
        url: &Url,
    ) -> Result<BufferedConn<ReadHalf<BoxedIo>>, TripError> {
        if let Some(entry) = self.conns.get(key) {
            if let Some(conn) = take_returned(&entry.reclaim) {
                return Ok(conn);
            }
            self.conns.remove(key);
        }
        if self.conns.len() > MAX_POOLED_DESTINATIONS {
            self.conns.clear();
        }

        let stream = self.dial(url).await.map_err(TripError::Send)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let reclaim = return_slot();
        self.conns.insert(
            key.to_string(),
            PooledConn {
                write: write_half,
                reclaim,
            },
        );
        Ok(BufferedConn::new(read_half))
    }

    async fn dial(&mut self, url: &Url) -> io::Result<BoxedIo> {
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?
            .to_string();
        let port = url.port_or_known_default().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "URL has no usable port")
        })?;

        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "timed out dialing upstream")
            })??;
        tcp.set_nodelay(true)?;

        if url.scheme() == "https" {
            let server_name = ServerName::try_from(host.clone()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream server name")
            })?;
            let connector = TlsConnector::from(Arc::clone(&self.client_config));
            let tls = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls))
        } else {
            Ok(Box::new(tcp))
        }
    }
}

fn destination_key(url: &Url) -> io::Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no usable port"))?;
    Ok(format!("{}://{host}:{port}", url.scheme()))
}

/// Decodes a compressed response body so rewrite rules see plain text. The
/// body reader is wrapped in a streaming decoder, the encoding header is
/// dropped, and the length becomes unknown. Unrecognized encodings pass
/// through untouched.
fn decode_content_encoding(response: &mut Response) {
    let encoding = match response.headers.get("content-encoding") {
        Some(value) => match value.to_str() {
            Ok(text) => text.trim().to_ascii_lowercase(),
            Err(_) => return,
        },
        None => return,
    };
    let decoder = match encoding.as_str() {
        "gzip" => Decoder::Gzip(flate2::write::GzDecoder::new(Vec::new())),
        "deflate" => Decoder::Deflate(flate2::write::DeflateDecoder::new(Vec::new())),
        "br" => Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(Vec::new(), 4096))),
        _ => return,
    };

    response.headers.remove("content-encoding");
    let body = std::mem::replace(&mut response.body, Body::empty());
    response.body = Body::from_reader(Box::new(DecodedBody::new(body.reader, decoder)), None);
}

enum Decoder {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::DeflateDecoder<Vec<u8>>),
    Brotli(Box<brotli::DecompressorWriter<Vec<u8>>>),
}

impl Decoder {
    fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        match self {
            Self::Gzip(decoder) => decoder.write_all(data),
            Self::Deflate(decoder) => decoder.write_all(data),
            Self::Brotli(decoder) => decoder.write_all(data),
        }
    }

    /// Flushes trailing state at end of the compressed stream. A truncated
    /// gzip or deflate stream surfaces here as an error.
    fn finish(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(decoder) => decoder.try_finish(),
            Self::Deflate(decoder) => decoder.try_finish(),
            Self::Brotli(_) => Ok(()),
        }
    }

    fn take_output(&mut self) -> Vec<u8> {
        match self {
            Self::Gzip(decoder) => std::mem::take(decoder.get_mut()),
            Self::Deflate(decoder) => std::mem::take(decoder.get_mut()),
            Self::Brotli(decoder) => std::mem::take(decoder.get_mut()),
        }
    }
}

/// Streams a compressed body through a [`Decoder`], pulling compressed input
/// one chunk at a time so a large download is never buffered whole.
struct DecodedBody {
    inner: BoxedReader,
    decoder: Decoder,
    pending: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl DecodedBody {
    fn new(inner: BoxedReader, decoder: Decoder) -> Self {
        Self {
            inner,
            decoder,
            pending: Vec::new(),
            pos: 0,
            finished: false,
        }
    }
}

impl AsyncRead for DecodedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = out.remaining().min(this.pending.len() - this.pos);
                out.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0_u8; 8192];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.decoder.finish()?;
                this.finished = true;
            } else {
                this.decoder.feed(chunk_buf.filled())?;
            }
            this.pending = this.decoder.take_output();
            this.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_content_encoding, destination_key};
    use crate::message::{Body, Response};
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use url::Url;

    #[test]
    fn destination_keys_carry_scheme_host_and_port() {
        let http = Url::parse("http://example.com/path").expect("url");
        assert_eq!(destination_key(&http).expect("key"), "http://example.com:80");

        let https = Url::parse("https://example.com:8443/").expect("url");
        assert_eq!(
            destination_key(&https).expect("key"),
            "https://example.com:8443"
        );
    }

    #[tokio::test]
    async fn gzip_responses_are_decoded_and_the_header_dropped() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello gzip").expect("encode");
        let compressed = encoder.finish().expect("finish");

        let mut response = Response::new(200, "OK");
        response
            .headers
            .insert("content-encoding", "gzip".parse().expect("value"));
        response.body = Body::from_bytes(compressed);

        decode_content_encoding(&mut response);
        assert!(response.headers.get("content-encoding").is_none());
        assert_eq!(response.body.content_length, None);

        let mut out = Vec::new();
        response
            .body
            .reader
            .read_to_end(&mut out)
            .await
            .expect("read");
        assert_eq!(out, b"hello gzip");
    }

    #[tokio::test]
    async fn unknown_encodings_pass_through_untouched() {
        let mut response = Response::new(200, "OK");
        response
            .headers
            .insert("content-encoding", "zstd".parse().expect("value"));
        response.body = Body::from_bytes(b"opaque".to_vec());

        decode_content_encoding(&mut response);
        assert!(response.headers.get("content-encoding").is_some());
        assert_eq!(response.body.content_length, Some(6));
    }

    #[tokio::test]
    async fn decoding_streams_without_buffering_the_whole_body() {
        // Pseudo-random input keeps the compressed stream larger than one
        // input chunk, so decoding spans several feeds.
        let mut seed = 0x2545_f491_4f6c_dd1d_u64;
        let plain: Vec<u8> = (0..100_000)
            .map(|_| {
                seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (seed >> 56) as u8
            })
            .collect();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).expect("encode");
        let compressed = encoder.finish().expect("finish");
        assert!(compressed.len() > 8192);

        let mut response = Response::new(200, "OK");
        response
            .headers
            .insert("content-encoding", "gzip".parse().expect("value"));
        response.body = Body::from_bytes(compressed);
        decode_content_encoding(&mut response);

        // The first read yields decoded bytes from the first compressed
        // chunk alone, before the rest of the stream is consumed.
        let mut first = [0_u8; 4096];
        let read = response.body.reader.read(&mut first).await.expect("read");
        assert!(read > 0);
        assert_eq!(&first[..read], &plain[..read]);

        let mut rest = Vec::new();
        response
            .body
            .reader
            .read_to_end(&mut rest)
            .await
            .expect("rest");
        assert_eq!(read + rest.len(), plain.len());
        assert_eq!(rest, &plain[read..]);
    }
}
