use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::HeaderValue;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use tamper_rules::{compile, ConfigJson};

use crate::http1::{
    self, return_slot, take_returned, BodyMode, BoxedIo, BufferedConn, MessageBodyReader,
};
use crate::message::{Body, Request, Response};
use crate::rewrite_hook::SharedTables;

/// Control-plane endpoints. The same handler answers both the magic admin
/// host inside the proxy and the dedicated admin listener.
pub struct AdminApi {
    tables: Arc<SharedTables>,
    ca_pem: String,
}

impl AdminApi {
    pub fn new(tables: Arc<SharedTables>, ca_pem: String) -> Self {
        Self { tables, ca_pem }
    }

    pub async fn handle(&self, request: &mut Request) -> Response {
        match request.url.path() {
            "/api/rules/set" => self.set_rules(request).await,
            "/api/rules/clear" => self.clear_rules(request).await,
            "/ca.pem" => {
                let mut response = Response::new(200, "OK");
                response.headers.insert(
                    "content-type",
                    HeaderValue::from_static("application/x-pem-file"),
                );
                response.body = Body::from_bytes(self.ca_pem.clone().into_bytes());
                response
            }
            _ => Response::new(404, "Not Found"),
        }
    }

    async fn set_rules(&self, request: &mut Request) -> Response {
        let body = match read_body(request).await {
            Ok(body) => body,
            Err(error) => return Response::with_text(404, "Not Found", &error.to_string()),
        };
        let config: ConfigJson = match serde_json::from_slice(&body) {
            Ok(config) => config,
            Err(error) => return Response::with_text(404, "Not Found", &error.to_string()),
        };
        let ip = target_ip(&config, request.remote_addr);
        match compile(&config) {
            Ok(rules) => {
                tracing::info!(client = %ip, entries = rules.len(), "installing rewrite rules");
                self.tables.set_rules(&ip, rules);
                Response::with_text(200, "OK", "setting rules")
            }
            Err(error) => Response::with_text(404, "Not Found", &error.to_string()),
        }
    }

    async fn clear_rules(&self, request: &mut Request) -> Response {
        let ip = match read_body(request).await {
            Ok(body) => serde_json::from_slice::<ConfigJson>(&body)
                .ok()
                .and_then(|config| config.ip)
                .unwrap_or_else(|| request.remote_addr.ip().to_string()),
            Err(_) => request.remote_addr.ip().to_string(),
        };
        tracing::info!(client = %ip, "clearing rewrite rules");
        self.tables.clear(&ip);
        Response::with_text(200, "OK", "clearing rules")
    }
}

/// The configuration may name the client it applies to; otherwise the rules
/// bind to the caller's own address.
fn target_ip(config: &ConfigJson, remote_addr: SocketAddr) -> String {
    config
        .ip
        .clone()
        .unwrap_or_else(|| remote_addr.ip().to_string())
}

async fn read_body(request: &mut Request) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    request.body.reader.read_to_end(&mut body).await?;
    Ok(body)
}

/// Serves the admin API on its own listener, outside the proxy data path.
pub async fn run_admin_listener(
    listener: TcpListener,
    api: Arc<AdminApi>,
    max_header_bytes: usize,
) -> io::Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let api = Arc::clone(&api);
        tokio::spawn(async move {
            if let Err(error) = serve_conn(stream, remote_addr, api, max_header_bytes).await {
                tracing::debug!(client = %remote_addr, %error, "admin connection error");
            }
        });
    }
}

async fn serve_conn(
    stream: TcpStream,
    remote_addr: SocketAddr,
    api: Arc<AdminApi>,
    max_header_bytes: usize,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let stream: BoxedIo = Box::new(stream);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut conn = Some(BufferedConn::new(read_half));

    while let Some(mut buffered) = conn.take() {
        let head = match http1::read_request_head(&mut buffered, max_header_bytes).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        let host = head
            .headers
            .get("host")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("admin.invalid");
        let url = Url::parse(&format!("http://{host}{}", head.target))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid request URL"))?;

        let slot = return_slot();
        let body_reader = MessageBodyReader::new(buffered, head.body_mode, Arc::clone(&slot));
        let content_length = match head.body_mode {
            BodyMode::None => Some(0),
            BodyMode::ContentLength(length) => Some(length),
            BodyMode::Chunked | BodyMode::CloseDelimited => None,
        };

        let mut request = Request {
            method: head.method,
            url,
            version: head.version,
            headers: head.headers,
            body: Body::from_reader(Box::new(body_reader), content_length),
            close: head.close,
            remote_addr,
        };

        let mut response = api.handle(&mut request).await;
        request.body.drain().await?;
        if head.close {
            response.close = true;
        }

        let mut close = response.close;
        let body = response.body;
        let (mut reader, framing) = http1::derive_wire_framing(
            body.reader,
            body.content_length,
            response.version,
            &mut close,
        )
        .await?;
        http1::write_response(
            &mut write_half,
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
            return Ok(());
        }
        conn = take_returned(&slot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::AdminApi;
    use crate::message::{Body, Request, Response, Version};
    use crate::rewrite_hook::SharedTables;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn request(path: &str, body: &str) -> Request {
        Request {
            method: "POST".to_string(),
            url: url::Url::parse(&format!("http://a.proxi{path}")).expect("url"),
            version: Version::Http11,
            headers: http::HeaderMap::new(),
            body: Body::from_bytes(body.as_bytes().to_vec()),
            close: false,
            remote_addr: "10.1.2.3:5555".parse().expect("addr"),
        }
    }

    async fn text(response: &mut Response) -> String {
        let mut out = Vec::new();
        response
            .body
            .reader
            .read_to_end(&mut out)
            .await
            .expect("body");
        String::from_utf8(out).expect("utf8")
    }

    #[tokio::test]
    async fn set_installs_rules_for_the_calling_ip_by_default() {
        let tables = SharedTables::new();
        let api = AdminApi::new(Arc::clone(&tables), String::new());

        let mut request = request("/api/rules/set", r#"{"rules":[{"url":"example"}]}"#);
        let mut response = api.handle(&mut request).await;
        assert_eq!(response.status, 200);
        assert_eq!(text(&mut response).await, "setting rules");
        assert!(tables.rules_for("10.1.2.3").is_some());
    }

    #[tokio::test]
    async fn set_honors_an_explicit_target_ip() {
        let tables = SharedTables::new();
        let api = AdminApi::new(Arc::clone(&tables), String::new());

        let mut request = request(
            "/api/rules/set",
            r#"{"ip":"192.168.0.9","rules":[{"url":"example"}]}"#,
        );
        let response = api.handle(&mut request).await;
        assert_eq!(response.status, 200);
        assert!(tables.rules_for("192.168.0.9").is_some());
        assert!(tables.rules_for("10.1.2.3").is_none());
    }

    #[tokio::test]
    async fn an_unreadable_rule_body_is_rejected_like_other_set_failures() {
        use std::pin::Pin;
        use std::task::{Context, Poll};
        use tokio::io::{AsyncRead, ReadBuf};

        struct FailingReader;
        impl AsyncRead for FailingReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "body gone",
                )))
            }
        }

        let tables = SharedTables::new();
        let api = AdminApi::new(Arc::clone(&tables), String::new());
        let mut request = request("/api/rules/set", "");
        request.body = Body::from_reader(Box::new(FailingReader), None);

        let response = api.handle(&mut request).await;
        assert_eq!(response.status, 404);
        assert!(tables.rules_for("10.1.2.3").is_none());
    }

    #[tokio::test]
    async fn a_bad_rule_set_is_rejected_with_the_compile_error() {
        let tables = SharedTables::new();
        let api = AdminApi::new(Arc::clone(&tables), String::new());

        let mut request = request("/api/rules/set", r#"{"rules":[{"url":"[unclosed"}]}"#);
        let mut response = api.handle(&mut request).await;
        assert_eq!(response.status, 404);
        assert!(text(&mut response).await.contains("[unclosed"));
        assert!(tables.rules_for("10.1.2.3").is_none());
    }

    #[tokio::test]
    async fn clear_drops_the_callers_rules() {
        let tables = SharedTables::new();
        let api = AdminApi::new(Arc::clone(&tables), String::new());

        let mut set = request("/api/rules/set", r#"{"rules":[{"url":"example"}]}"#);
        api.handle(&mut set).await;
        assert!(tables.rules_for("10.1.2.3").is_some());

        let mut clear = request("/api/rules/clear", "");
        let mut response = api.handle(&mut clear).await;
        assert_eq!(response.status, 200);
        assert_eq!(text(&mut response).await, "clearing rules");
        assert!(tables.rules_for("10.1.2.3").is_none());
    }

    #[tokio::test]
    async fn ca_pem_is_served_with_the_pem_content_type() {
        let tables = SharedTables::new();
        let api = AdminApi::new(tables, "-----BEGIN CERTIFICATE-----".to_string());

        let mut request = request("/ca.pem", "");
        let mut response = api.handle(&mut request).await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get("content-type").expect("content type"),
            "application/x-pem-file"
        );
        assert_eq!(text(&mut response).await, "-----BEGIN CERTIFICATE-----");
    }

    #[tokio::test]
    async fn unknown_admin_paths_are_not_found() {
        let tables = SharedTables::new();
        let api = AdminApi::new(tables, String::new());
        let mut request = request("/api/unknown", "");
        let response = api.handle(&mut request).await;
        assert_eq!(response.status, 404);
        assert!(response.body.is_empty());
    }
}
