use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::{Position, Url};

use crate::message::{BoxedReader, Version};

pub const IO_CHUNK_SIZE: usize = 8192;
pub const CHUNK_LINE_LIMIT: usize = 1024;

/// Window used when re-deriving framing for a body of unknown length: if the
/// body ends within one window the message is written with Content-Length,
/// otherwise it is chunk-encoded (HTTP/1.1) or close-delimited (HTTP/1.0).
pub const FRAMING_PEEK_WINDOW: usize = 8192;

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// A stream plus bytes already read past the last parsed boundary.
pub struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP header exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub close: bool,
}

pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub close: bool,
}

/// Reads and parses one request head. `Ok(None)` means the client closed the
/// connection cleanly between requests.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_head_bytes: usize,
) -> io::Result<Option<RequestHead>> {
    let raw = match read_until_pattern(conn, b"\r\n\r\n", max_head_bytes).await? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    parse_request_head(&raw).map(Some)
}

pub async fn read_response_head<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    request_method: &str,
    max_head_bytes: usize,
) -> io::Result<ResponseHead> {
    let raw = read_until_pattern(conn, b"\r\n\r\n", max_head_bytes)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response headers arrived",
            )
        })?;
    parse_response_head(&raw, request_method)
}

fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = parse_version(version_text)?;
    let headers = parse_headers(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        close,
    })
}

fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response status line is missing",
        )
    })?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;

    let headers = parse_headers(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut close = is_connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        close = true;
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        close,
    })
}

fn parse_version(text: &str) -> io::Result<Version> {
    match text {
        "HTTP/1.0" => Ok(Version::Http10),
        "HTTP/1.1" => Ok(Version::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported",
        )),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "folded HTTP headers are not supported",
            ));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid HTTP header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid HTTP header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: Version, headers: &HeaderMap) -> bool {
    if header_has_token(headers, "connection", "close") {
        return true;
    }
    if version == Version::Http10 && !header_has_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

fn parse_content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    match headers.get("content-length") {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")),
    }
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    let chunked = header_has_token(headers, "transfer-encoding", "chunked");
    let content_length = parse_content_length(headers)?;
    if chunked && content_length.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "conflicting Transfer-Encoding and Content-Length",
        ));
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    Ok(match content_length {
        Some(0) | None => BodyMode::None,
        Some(length) => BodyMode::ContentLength(length),
    })
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }

    let chunked = header_has_token(headers, "transfer-encoding", "chunked");
    let content_length = parse_content_length(headers)?;
    if chunked && content_length.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "conflicting Transfer-Encoding and Content-Length",
        ));
    }
    if chunked {
        return Ok(BodyMode::Chunked);
    }
    Ok(match content_length {
        Some(0) => BodyMode::None,
        Some(length) => BodyMode::ContentLength(length),
        None => BodyMode::CloseDelimited,
    })
}

/// Hand-off slot through which a body reader returns the connection once the
/// body's framing completes, so the owner can read the next message.
pub type ReturnSlot<S> = Arc<Mutex<Option<BufferedConn<S>>>>;

pub fn return_slot<S>() -> ReturnSlot<S> {
    Arc::new(Mutex::new(None))
}

pub fn take_returned<S>(slot: &ReturnSlot<S>) -> Option<BufferedConn<S>> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

enum FrameState {
    Length { remaining: u64 },
    ChunkLine,
    ChunkData { remaining: u64 },
    ChunkTerminator,
    Trailers,
    CloseDelimited,
    Done,
}

/// Decodes one message body off a connection according to its framing, and
/// returns the connection through the slot when the framing ends. A
/// close-delimited body consumes the connection instead.
pub struct MessageBodyReader<S> {
    conn: Option<BufferedConn<S>>,
    slot: ReturnSlot<S>,
    state: FrameState,
}

impl<S> MessageBodyReader<S> {
    pub fn new(conn: BufferedConn<S>, mode: BodyMode, slot: ReturnSlot<S>) -> Self {
        let state = match mode {
            BodyMode::None => FrameState::Done,
            BodyMode::ContentLength(length) => FrameState::Length { remaining: length },
            BodyMode::Chunked => FrameState::ChunkLine,
            BodyMode::CloseDelimited => FrameState::CloseDelimited,
        };
        let mut reader = Self {
            conn: Some(conn),
            slot,
            state,
        };
        if matches!(reader.state, FrameState::Done) {
            reader.return_conn();
        }
        reader
    }

    fn return_conn(&mut self) {
        self.state = FrameState::Done;
        if let Some(conn) = self.conn.take() {
            if let Ok(mut guard) = self.slot.lock() {
                *guard = Some(conn);
            }
        }
    }

    fn drop_conn(&mut self) {
        self.state = FrameState::Done;
        self.conn = None;
    }
}

impl<S: AsyncRead + Unpin> MessageBodyReader<S> {
    /// Reads more bytes into the connection's buffer. Ready(0) is EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Poll::Ready(Ok(0)),
        };
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let mut read_buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut conn.stream).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                conn.read_buf.extend_from_slice(filled);
                Poll::Ready(Ok(filled.len()))
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MessageBodyReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                FrameState::Done => return Poll::Ready(Ok(())),

                FrameState::Length { remaining } | FrameState::ChunkData { remaining } => {
                    if remaining == 0 {
                        match this.state {
                            FrameState::Length { .. } => this.return_conn(),
                            _ => this.state = FrameState::ChunkTerminator,
                        }
                        continue;
                    }
                    let buffered = this.conn.as_ref().map_or(0, |conn| conn.read_buf.len());
                    if buffered == 0 {
                        match this.poll_fill(cx) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed before body completed",
                                )));
                            }
                            Poll::Ready(Ok(_)) => continue,
                        }
                    }
                    let conn = this.conn.as_mut().expect("conn present while framing");
                    let n = out
                        .remaining()
                        .min(conn.read_buf.len())
                        .min(remaining as usize);
                    out.put_slice(&conn.read_buf[..n]);
                    conn.read_buf.drain(..n);
                    let remaining = remaining - n as u64;
                    match this.state {
                        FrameState::Length { .. } => {
                            if remaining == 0 {
                                this.return_conn();
                            } else {
                                this.state = FrameState::Length { remaining };
                            }
                        }
                        _ => {
                            if remaining == 0 {
                                this.state = FrameState::ChunkTerminator;
                            } else {
                                this.state = FrameState::ChunkData { remaining };
                            }
                        }
                    }
                    return Poll::Ready(Ok(()));
                }

                FrameState::ChunkLine => {
                    let conn = this.conn.as_mut().expect("conn present while framing");
                    if let Some(end) = find_subsequence(&conn.read_buf, b"\r\n") {
                        let size = parse_chunk_size(&conn.read_buf[..end])?;
                        conn.read_buf.drain(..end + 2);
                        this.state = if size == 0 {
                            FrameState::Trailers
                        } else {
                            FrameState::ChunkData { remaining: size }
                        };
                        continue;
                    }
                    if conn.read_buf.len() > CHUNK_LINE_LIMIT {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunk size line exceeded limit",
                        )));
                    }
                    match this.poll_fill(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside chunked body",
                            )));
                        }
                        Poll::Ready(Ok(_)) => continue,
                    }
                }

                FrameState::ChunkTerminator => {
                    let conn = this.conn.as_mut().expect("conn present while framing");
                    if conn.read_buf.len() < 2 {
                        match this.poll_fill(cx) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed inside chunked body",
                                )));
                            }
                            Poll::Ready(Ok(_)) => continue,
                        }
                    }
                    if &conn.read_buf[..2] != b"\r\n" {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid chunk terminator",
                        )));
                    }
                    conn.read_buf.drain(..2);
                    this.state = FrameState::ChunkLine;
                }

                FrameState::Trailers => {
                    let conn = this.conn.as_mut().expect("conn present while framing");
                    if let Some(end) = find_subsequence(&conn.read_buf, b"\r\n") {
                        conn.read_buf.drain(..end + 2);
                        if end == 0 {
                            this.return_conn();
                        }
                        continue;
                    }
                    if conn.read_buf.len() > CHUNK_LINE_LIMIT {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "chunked trailer line exceeded limit",
                        )));
                    }
                    match this.poll_fill(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside chunked trailers",
                            )));
                        }
                        Poll::Ready(Ok(_)) => continue,
                    }
                }

                FrameState::CloseDelimited => {
                    let buffered = this.conn.as_ref().map_or(0, |conn| conn.read_buf.len());
                    if buffered == 0 {
                        match this.poll_fill(cx) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                            Poll::Ready(Ok(0)) => {
                                this.drop_conn();
                                continue;
                            }
                            Poll::Ready(Ok(_)) => continue,
                        }
                    }
                    let conn = this.conn.as_mut().expect("conn present while framing");
                    let n = out.remaining().min(conn.read_buf.len());
                    out.put_slice(&conn.read_buf[..n]);
                    conn.read_buf.drain(..n);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid UTF-8",
        )
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

/// How a body will be framed on the wire.
pub enum WireFraming {
    Empty,
    Length(u64),
    Chunked,
    CloseDelimited,
}

/// Decides wire framing for a body whose length may be unknown, peeking up to
/// one window so short bodies still go out with Content-Length. A body of
/// unknown length on HTTP/1.0 forces the connection closed.
pub async fn derive_wire_framing(
    mut reader: BoxedReader,
    content_length: Option<u64>,
    version: Version,
    close: &mut bool,
) -> io::Result<(BoxedReader, WireFraming)> {
    match content_length {
        Some(0) => return Ok((reader, WireFraming::Empty)),
        Some(length) => return Ok((reader, WireFraming::Length(length))),
        None => {}
    }

    let mut prefix = vec![0_u8; FRAMING_PEEK_WINDOW];
    let mut filled = 0;
    let mut eof = false;
    while filled < prefix.len() {
        let read = reader.read(&mut prefix[filled..]).await?;
        if read == 0 {
            eof = true;
            break;
        }
        filled += read;
    }
    prefix.truncate(filled);

    if eof {
        let length = prefix.len() as u64;
        let framing = if length == 0 {
            WireFraming::Empty
        } else {
            WireFraming::Length(length)
        };
        return Ok((Box::new(std::io::Cursor::new(prefix)), framing));
    }

    let reader: BoxedReader = Box::new(std::io::Cursor::new(prefix).chain(reader));
    match version {
        Version::Http11 => Ok((reader, WireFraming::Chunked)),
        Version::Http10 => {
            *close = true;
            Ok((reader, WireFraming::CloseDelimited))
        }
    }
}

fn is_generated_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "content-length" | "transfer-encoding"
    )
}

async fn write_headers<W: AsyncWrite + Unpin>(
    sink: &mut W,
    headers: &HeaderMap,
    framing: &WireFraming,
    close: bool,
) -> io::Result<()> {
    let mut head = Vec::new();
    for (name, value) in headers {
        if is_generated_header(name) {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    match framing {
        WireFraming::Empty => head.extend_from_slice(b"Content-Length: 0\r\n"),
        WireFraming::Length(length) => {
            head.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        WireFraming::Chunked => head.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        WireFraming::CloseDelimited => {}
    }
    if close {
        head.extend_from_slice(b"Connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");
    sink.write_all(&head).await
}

/// Writes a request head in origin form with a Host header derived from the
/// URL, then the body under the chosen framing.
pub async fn write_request<W: AsyncWrite + Unpin>(
    sink: &mut W,
    method: &str,
    url: &Url,
    version: Version,
    headers: &HeaderMap,
    close: bool,
    reader: &mut BoxedReader,
    framing: &WireFraming,
) -> io::Result<()> {
    let path = &url[Position::BeforePath..Position::AfterQuery];
    let host = host_header_value(url)?;
    let request_line = format!("{method} {path} {}\r\nHost: {host}\r\n", version.as_str());
    sink.write_all(request_line.as_bytes()).await?;
    let mut headers = headers.clone();
    headers.remove("host");
    write_headers_and_body(sink, &headers, close, reader, framing).await
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    sink: &mut W,
    status: u16,
    reason: &str,
    version: Version,
    headers: &HeaderMap,
    close: bool,
    reader: &mut BoxedReader,
    framing: &WireFraming,
) -> io::Result<()> {
    let status_line = if reason.is_empty() {
        format!("{} {status}\r\n", version.as_str())
    } else {
        format!("{} {status} {reason}\r\n", version.as_str())
    };
    sink.write_all(status_line.as_bytes()).await?;
    write_headers_and_body(sink, headers, close, reader, framing).await
}

async fn write_headers_and_body<W: AsyncWrite + Unpin>(
    sink: &mut W,
    headers: &HeaderMap,
    close: bool,
    reader: &mut BoxedReader,
    framing: &WireFraming,
) -> io::Result<()> {
    write_headers(sink, headers, framing, close).await?;
    match framing {
        WireFraming::Empty => {}
        WireFraming::Length(_) | WireFraming::CloseDelimited => {
            tokio::io::copy(reader, sink).await?;
        }
        WireFraming::Chunked => {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            loop {
                let read = reader.read(&mut chunk).await?;
                if read == 0 {
                    sink.write_all(b"0\r\n\r\n").await?;
                    break;
                }
                sink.write_all(format!("{read:x}\r\n").as_bytes()).await?;
                sink.write_all(&chunk[..read]).await?;
                sink.write_all(b"\r\n").await?;
            }
        }
    }
    sink.flush().await
}

pub fn host_header_value(url: &Url) -> io::Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{
        derive_wire_framing, read_request_head, read_response_head, return_slot, take_returned,
        write_response, BodyMode, BufferedConn, MessageBodyReader, WireFraming,
    };
    use crate::message::Version;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn parses_a_proxy_request_head() {
        let raw = b"GET http://example.com/path?q=1 HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    Content-Length: 5\r\n\r\nhello";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_request_head(&mut conn, 20000)
            .await
            .expect("read head")
            .expect("head present");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/path?q=1");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.body_mode, BodyMode::ContentLength(5));
        assert!(!head.close);
        assert_eq!(conn.read_buf, b"hello");
    }

    #[tokio::test]
    async fn clean_eof_between_requests_reads_as_none() {
        let mut conn = BufferedConn::new(std::io::Cursor::new(Vec::new()));
        assert!(read_request_head(&mut conn, 20000)
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn http10_without_keep_alive_closes() {
        let raw = b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_request_head(&mut conn, 20000)
            .await
            .expect("read head")
            .expect("head present");
        assert!(head.close);
    }

    #[tokio::test]
    async fn content_length_body_returns_the_connection_with_pipelined_bytes() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloNEXT";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut conn, "GET", 20000)
            .await
            .expect("head");
        assert_eq!(head.body_mode, BodyMode::ContentLength(5));

        let slot = return_slot();
        let mut body = MessageBodyReader::new(conn, head.body_mode, slot.clone());
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("body");
        assert_eq!(out, b"hello");

        let conn = take_returned(&slot).expect("connection returned");
        assert_eq!(conn.read_buf, b"NEXT");
    }

    #[tokio::test]
    async fn chunked_body_decodes_and_discards_trailers() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut conn, "GET", 20000)
            .await
            .expect("head");
        assert_eq!(head.body_mode, BodyMode::Chunked);

        let slot = return_slot();
        let mut body = MessageBodyReader::new(conn, head.body_mode, slot.clone());
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("body");
        assert_eq!(out, b"hello world");

        let conn = take_returned(&slot).expect("connection returned");
        assert_eq!(conn.read_buf, b"NEXT");
    }

    #[tokio::test]
    async fn close_delimited_body_consumes_the_connection() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\neverything until eof";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut conn, "GET", 20000)
            .await
            .expect("head");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
        assert!(head.close);

        let slot = return_slot();
        let mut body = MessageBodyReader::new(conn, head.body_mode, slot.clone());
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("body");
        assert_eq!(out, b"everything until eof");
        assert!(take_returned(&slot).is_none());
    }

    #[tokio::test]
    async fn truncated_content_length_body_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let mut conn = BufferedConn::new(std::io::Cursor::new(raw.to_vec()));
        let head = read_response_head(&mut conn, "GET", 20000)
            .await
            .expect("head");
        let slot = return_slot();
        let mut body = MessageBodyReader::new(conn, head.body_mode, slot);
        let mut out = Vec::new();
        let error = body.read_to_end(&mut out).await.expect_err("truncated");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn short_unknown_length_bodies_become_content_length() {
        let reader = Box::new(std::io::Cursor::new(b"short body".to_vec()));
        let mut close = false;
        let (mut reader, framing) = derive_wire_framing(reader, None, Version::Http11, &mut close)
            .await
            .expect("framing");
        assert!(matches!(framing, WireFraming::Length(10)));
        assert!(!close);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"short body");
    }

    #[tokio::test]
    async fn long_unknown_length_bodies_become_chunked_on_http11() {
        let payload = vec![b'x'; super::FRAMING_PEEK_WINDOW + 100];
        let reader = Box::new(std::io::Cursor::new(payload.clone()));
        let mut close = false;
        let (mut reader, framing) = derive_wire_framing(reader, None, Version::Http11, &mut close)
            .await
            .expect("framing");
        assert!(matches!(framing, WireFraming::Chunked));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn long_unknown_length_bodies_close_on_http10() {
        let payload = vec![b'x'; super::FRAMING_PEEK_WINDOW + 1];
        let reader = Box::new(std::io::Cursor::new(payload));
        let mut close = false;
        let (_, framing) = derive_wire_framing(reader, None, Version::Http10, &mut close)
            .await
            .expect("framing");
        assert!(matches!(framing, WireFraming::CloseDelimited));
        assert!(close);
    }

    #[tokio::test]
    async fn chunk_encoded_output_round_trips_through_the_decoder() {
        let mut wire = Vec::new();
        let mut reader: crate::message::BoxedReader =
            Box::new(std::io::Cursor::new(b"hello world".to_vec()));
        write_response(
            &mut wire,
            200,
            "OK",
            Version::Http11,
            &http::HeaderMap::new(),
            false,
            &mut reader,
            &WireFraming::Chunked,
        )
        .await
        .expect("write");

        let mut conn = BufferedConn::new(std::io::Cursor::new(wire));
        let head = read_response_head(&mut conn, "GET", 20000)
            .await
            .expect("head");
        assert_eq!(head.body_mode, BodyMode::Chunked);
        let slot = return_slot();
        let mut body = MessageBodyReader::new(conn, head.body_mode, slot);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("body");
        assert_eq!(out, b"hello world");
    }
}
