use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncReadExt;

use tamper_rules::{alter_body, alter_header, alter_status, alter_url, RewriteRules};
use tamper_stream::{buffered_split, ThrottleController};

use crate::admin::AdminApi;
use crate::hook::{ModifyHook, RequestDecision};
use crate::message::{Body, Request, Response};

/// Requests for this host never leave the proxy; they are answered by the
/// admin API instead.
pub const ADMIN_HOST: &str = "a.proxi";

const UPLOAD_KEY_PREFIX: &str = "rq\n";

pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_CLIENT_EXPIRY: Duration = Duration::from_secs(48 * 60 * 60);

/// Per-client-IP state shared between the proxy hook, the admin API, and the
/// expiry sweeper.
pub struct SharedTables {
    rules: DashMap<String, Arc<RewriteRules>>,
    throttles: DashMap<String, Arc<DashMap<String, Arc<ThrottleController>>>>,
    last_seen: DashMap<String, Instant>,
}

impl SharedTables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: DashMap::new(),
            throttles: DashMap::new(),
            last_seen: DashMap::new(),
        })
    }

    pub fn touch(&self, ip: &str) {
        self.last_seen.insert(ip.to_string(), Instant::now());
    }

    pub fn rules_for(&self, ip: &str) -> Option<Arc<RewriteRules>> {
        self.rules.get(ip).map(|entry| Arc::clone(entry.value()))
    }

    /// Installs a client's rule set. An empty set removes the entry. Either
    /// way the client's throttle controllers are discarded, so new rates
    /// take effect on the next matching request.
    pub fn set_rules(&self, ip: &str, rules: RewriteRules) {
        self.throttles.remove(ip);
        if rules.is_empty() {
            self.rules.remove(ip);
        } else {
            self.rules.insert(ip.to_string(), Arc::new(rules));
        }
    }

    pub fn clear(&self, ip: &str) {
        self.rules.remove(ip);
        self.throttles.remove(ip);
    }

    /// Fetches or creates the shared throttle controller for one
    /// (client, key) pair. An existing controller keeps its original rate.
    pub fn throttle(&self, ip: &str, key: &str, rate_bits_per_second: u64) -> Arc<ThrottleController> {
        let per_client = Arc::clone(
            self.throttles
                .entry(ip.to_string())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value(),
        );
        let controller = per_client
            .entry(key.to_string())
            .or_insert_with(|| ThrottleController::new(rate_bits_per_second));
        Arc::clone(controller.value())
    }

    /// Drops every client not seen within `expiry`.
    pub fn sweep(&self, expiry: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > expiry)
            .map(|entry| entry.key().clone())
            .collect();
        for ip in expired {
            tracing::info!(client = %ip, "expiring idle client state");
            self.last_seen.remove(&ip);
            self.rules.remove(&ip);
            self.throttles.remove(&ip);
        }
    }
}

pub fn spawn_table_sweeper(
    tables: Arc<SharedTables>,
    period: Duration,
    expiry: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            tables.sweep(expiry);
        }
    })
}

/// The production hook: looks up the client's rule set, applies request and
/// response rewrites, attaches throttles, and serves the admin host.
pub struct RewriteHook {
    tables: Arc<SharedTables>,
    admin: AdminApi,
    log_bodies: bool,
}

impl RewriteHook {
    pub fn new(tables: Arc<SharedTables>, admin: AdminApi, log_bodies: bool) -> Self {
        Self {
            tables,
            admin,
            log_bodies,
        }
    }
}

impl ModifyHook for RewriteHook {
    async fn modify_request(&self, request: &mut Request) -> RequestDecision {
        let client_ip = request.remote_addr.ip().to_string();
        self.tables.touch(&client_ip);
        tracing::info!(client = %client_ip, method = %request.method, url = %request.url, "request");

        if request.url.host_str() == Some(ADMIN_HOST) {
            return RequestDecision::Respond(self.admin.handle(request).await);
        }

        let rules = match self.tables.rules_for(&client_ip) {
            Some(rules) => rules,
            None => return RequestDecision::Forward,
        };
        // Entries match against the URL the client sent; an earlier entry's
        // URL rewrite must not hide the request from later entries.
        let requested_url = request.url.to_string();
        for entry in rules.iter() {
            if !entry.url.is_match(&requested_url) {
                continue;
            }
            if let Err(error) = alter_url(&mut request.url, &entry.request.url) {
                tracing::warn!(client = %client_ip, %error, "URL rewrite failed, dropping request");
                return RequestDecision::Drop;
            }
            if let Err(error) = alter_header(&mut request.headers, &entry.request.header) {
                tracing::warn!(client = %client_ip, %error, "header rewrite failed, forwarding as-is");
                return RequestDecision::Forward;
            }
            if !entry.request.body.is_empty() {
                let body = std::mem::replace(&mut request.body, Body::empty());
                if let Some(reader) = alter_body(body.reader, &entry.request.body) {
                    request.body = Body::from_reader(reader, None);
                }
            }
            if let Some(rate) = entry.upload_speed {
                let key = format!("{UPLOAD_KEY_PREFIX}{}", entry.url.as_str());
                let controller = self.tables.throttle(&client_ip, &key, rate);
                request
                    .body
                    .wrap_reader(|reader| Box::new(controller.wrap(reader)));
            }
        }
        RequestDecision::Forward
    }

    async fn modify_response(&self, original_url: &str, client_ip: &str, response: &mut Response) {
        if let Some(rules) = self.tables.rules_for(client_ip) {
            let mut delay_micros = 0_u64;
            for entry in rules.iter() {
                if !entry.url.is_match(original_url) {
                    continue;
                }
                if let Err(error) = alter_header(&mut response.headers, &entry.response.header) {
                    tracing::warn!(client = %client_ip, %error, "response header rewrite failed");
                }
                if let Some((status, reason)) =
                    alter_status(response.status, &response.reason, &entry.response.status)
                {
                    response.status = status;
                    response.reason = reason;
                }
                if !entry.response.body.is_empty() {
                    let body = std::mem::replace(&mut response.body, Body::empty());
                    if let Some(reader) = alter_body(body.reader, &entry.response.body) {
                        response.body = Body::from_reader(reader, None);
                    }
                }
                if let Some(rate) = entry.download_speed {
                    let controller = self.tables.throttle(client_ip, entry.url.as_str(), rate);
                    response
                        .body
                        .wrap_reader(|reader| Box::new(controller.wrap(reader)));
                }
                if let Some(micros) = entry.response_delay {
                    delay_micros = delay_micros.max(micros);
                }
            }
            if delay_micros > 0 {
                tokio::time::sleep(Duration::from_micros(delay_micros)).await;
            }
        }

        if self.log_bodies {
            tap_response_body(original_url, response);
        }
    }
}

/// Tees the response body so a copy can be logged without delaying delivery.
fn tap_response_body(url: &str, response: &mut Response) {
    let url = url.to_string();
    let body = std::mem::replace(&mut response.body, Body::empty());
    let content_length = body.content_length;
    let mut handles = buffered_split(body.reader, 2);
    let mut tap = handles.pop().expect("tap handle");
    let forwarded = handles.pop().expect("forward handle");
    response.body = Body::from_reader(Box::new(forwarded), content_length);

    tokio::spawn(async move {
        let mut bytes = Vec::new();
        if let Err(error) = tap.read_to_end(&mut bytes).await {
            tracing::debug!(%url, %error, "body tap ended early");
            return;
        }
        let preview_len = bytes.len().min(1024);
        tracing::debug!(
            %url,
            bytes = bytes.len(),
            preview = %String::from_utf8_lossy(&bytes[..preview_len]),
            "response body"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::{RewriteHook, SharedTables};
    use crate::admin::AdminApi;
    use crate::hook::ModifyHook;
    use crate::message::{Body, Request, Version};
    use std::sync::Arc;
    use std::time::Duration;

    fn compiled(json: &str) -> tamper_rules::RewriteRules {
        let config: tamper_rules::ConfigJson = serde_json::from_str(json).expect("config json");
        tamper_rules::compile(&config).expect("compile")
    }

    fn request(url: &str) -> Request {
        Request {
            method: "GET".to_string(),
            url: url::Url::parse(url).expect("url"),
            version: Version::Http11,
            headers: http::HeaderMap::new(),
            body: Body::empty(),
            close: false,
            remote_addr: "10.1.2.3:5555".parse().expect("addr"),
        }
    }

    #[test]
    fn installing_an_empty_rule_set_removes_the_entry() {
        let tables = SharedTables::new();
        tables.set_rules("10.0.0.1", compiled(r#"{"rules":[{"url":"example"}]}"#));
        assert!(tables.rules_for("10.0.0.1").is_some());

        tables.set_rules("10.0.0.1", compiled(r#"{"rules":[]}"#));
        assert!(tables.rules_for("10.0.0.1").is_none());
    }

    #[test]
    fn an_existing_throttle_controller_keeps_its_rate() {
        let tables = SharedTables::new();
        let first = tables.throttle("10.0.0.1", "pattern", 1000);
        let second = tables.throttle("10.0.0.1", "pattern", 9999);
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(second.rate(), 1000);
    }

    #[test]
    fn setting_rules_discards_old_throttles() {
        let tables = SharedTables::new();
        let stale = tables.throttle("10.0.0.1", "pattern", 1000);
        tables.set_rules("10.0.0.1", compiled(r#"{"rules":[{"url":"example"}]}"#));
        let fresh = tables.throttle("10.0.0.1", "pattern", 2000);
        assert!(!std::sync::Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.rate(), 2000);
    }

    #[tokio::test]
    async fn later_entries_match_the_url_the_client_sent() {
        let tables = SharedTables::new();
        let admin = AdminApi::new(Arc::clone(&tables), String::new());
        let hook = RewriteHook::new(Arc::clone(&tables), admin, false);

        // Entry one redirects the host; entry two filters on the original
        // host and must still fire after the redirect.
        tables.set_rules(
            "10.1.2.3",
            compiled(
                r#"{"rules":[
                    {"url":"one\\.example","rewrite":{"request":{"url":[{"find":"one\\.example","replace":"two.example"}]}}},
                    {"url":"one\\.example","rewrite":{"request":{"header":[{"append":"x-marker: hit\n"}]}}}
                ]}"#,
            ),
        );

        let mut request = request("http://one.example/path");
        hook.modify_request(&mut request).await;
        assert_eq!(request.url.as_str(), "http://two.example/path");
        assert_eq!(
            request.headers.get("x-marker").expect("second entry fired"),
            "hit"
        );
    }

    #[test]
    fn sweep_only_drops_expired_clients() {
        let tables = SharedTables::new();
        tables.touch("10.0.0.1");
        tables.set_rules("10.0.0.1", compiled(r#"{"rules":[{"url":"example"}]}"#));
        tables.sweep(Duration::from_secs(3600));
        assert!(tables.rules_for("10.0.0.1").is_some());

        tables.sweep(Duration::ZERO);
        assert!(tables.rules_for("10.0.0.1").is_none());
    }
}
