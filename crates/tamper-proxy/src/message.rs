use std::net::SocketAddr;

use http::header::HeaderMap;
use tokio::io::AsyncRead;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A message body as a streaming reader. `content_length` is `None` when the
/// length is unknown, which happens after any body rewrite and for
/// close-delimited upstream responses.
pub struct Body {
    pub reader: BoxedReader,
    pub content_length: Option<u64>,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            reader: Box::new(std::io::Cursor::new(Vec::new())),
            content_length: Some(0),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let content_length = Some(bytes.len() as u64);
        Self {
            reader: Box::new(std::io::Cursor::new(bytes)),
            content_length,
        }
    }

    pub fn from_reader(reader: BoxedReader, content_length: Option<u64>) -> Self {
        Self {
            reader,
            content_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_length == Some(0)
    }

    /// Swaps the reader out for a transformed one, losing the known length.
    pub fn replace_reader(&mut self, wrap: impl FnOnce(BoxedReader) -> BoxedReader) {
        let reader = std::mem::replace(&mut self.reader, Box::new(std::io::Cursor::new(Vec::new())));
        self.reader = wrap(reader);
        self.content_length = None;
    }

    /// Swaps the reader without invalidating the known length, for wrappers
    /// that pace the stream but do not change its bytes.
    pub fn wrap_reader(&mut self, wrap: impl FnOnce(BoxedReader) -> BoxedReader) {
        let reader = std::mem::replace(&mut self.reader, Box::new(std::io::Cursor::new(Vec::new())));
        self.reader = wrap(reader);
    }

    /// Reads the body to its end and discards it, so the underlying
    /// connection reaches its next message boundary.
    pub async fn drain(&mut self) -> std::io::Result<()> {
        use tokio::io::AsyncReadExt;
        let mut sink = [0_u8; 8192];
        loop {
            let read = self.reader.read(&mut sink).await?;
            if read == 0 {
                return Ok(());
            }
        }
    }
}

pub struct Request {
    pub method: String,
    pub url: Url,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub close: bool,
    pub remote_addr: SocketAddr,
}

pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub close: bool,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Body::empty(),
            close: false,
        }
    }

    pub fn with_text(status: u16, reason: &str, body: &str) -> Self {
        let mut response = Self::new(status, reason);
        response.body = Body::from_bytes(body.as_bytes().to_vec());
        response
    }
}
