use std::io::Cursor;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use tamper_stream::ChunkedRegexReader;

use crate::compile::{Rule, RuleError};

/// Window size for streaming body rewrites. A body match longer than this is
/// not guaranteed to be found.
pub const BODY_REWRITE_WINDOW: usize = 4096 * 4;

pub type BoxedBody = Box<dyn AsyncRead + Send + Unpin>;

fn apply_text_rule(input: String, rule: &Rule) -> String {
    match rule {
        Rule::Replace {
            find: Some(pattern),
            text,
        } => pattern.text.replace_all(&input, text.as_str()).into_owned(),
        Rule::Replace { find: None, text } => text.clone(),
        Rule::Prepend(text) => format!("{text}{input}"),
        Rule::Append(text) => format!("{input}{text}"),
    }
}

/// Rewrites a URL in place. The rewritten text must still parse as a URL;
/// otherwise the original is left untouched and the error is returned, and
/// the caller treats the request as unroutable.
pub fn alter_url(url: &mut Url, rules: &[Rule]) -> Result<(), RuleError> {
    if rules.is_empty() {
        return Ok(());
    }
    let mut text = url.to_string();
    for rule in rules {
        text = apply_text_rule(text, rule);
    }
    let rewritten = Url::parse(&text).map_err(|_| RuleError::InvalidUrl(text))?;
    *url = rewritten;
    Ok(())
}

/// Rewrites a status line of the form "200 OK". Returns the new code and
/// reason, or `None` when the rewritten text no longer starts with an
/// integer code, in which case the status is left unchanged.
pub fn alter_status(code: u16, reason: &str, rules: &[Rule]) -> Option<(u16, String)> {
    if rules.is_empty() {
        return None;
    }
    let mut text = if reason.is_empty() {
        code.to_string()
    } else {
        format!("{code} {reason}")
    };
    for rule in rules {
        text = apply_text_rule(text, rule);
    }
    let first = text.split(' ').next().unwrap_or("");
    let new_code: u16 = first.parse().ok()?;
    let new_reason = text
        .split_once(' ')
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default();
    Some((new_code, new_reason))
}

fn header_block(headers: &HeaderMap) -> String {
    let mut block = String::new();
    for (name, value) in headers {
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(name.as_str());
        block.push_str(": ");
        block.push_str(&String::from_utf8_lossy(value.as_bytes()));
    }
    format!("\n{block}\n")
}

fn parse_header_block(block: &str) -> Result<HeaderMap, RuleError> {
    let mut headers = HeaderMap::new();
    for line in block.split('\n') {
        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };
        if key.is_empty() && value.is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| RuleError::InvalidHeader(line.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| RuleError::InvalidHeader(line.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Rewrites a header map by serializing it to a newline-framed block of
/// "Name: Value" lines, applying the rules to the block, and parsing the
/// result back. A rewritten line that is not a legal header leaves the map
/// untouched and returns the error; the caller logs it and forwards the
/// original headers.
pub fn alter_header(headers: &mut HeaderMap, rules: &[Rule]) -> Result<(), RuleError> {
    if rules.is_empty() {
        return Ok(());
    }
    let mut block = header_block(headers);
    for rule in rules {
        block = apply_text_rule(block, rule);
    }
    // The rules see a block framed by newlines so anchors like "\n" match at
    // both ends; restore the frame if a rule consumed it.
    if !block.starts_with('\n') {
        block.insert(0, '\n');
    }
    if block.len() < 2 || !block.ends_with('\n') {
        block.push('\n');
    }
    *headers = parse_header_block(&block)?;
    Ok(())
}

fn apply_stream_rule(body: BoxedBody, rule: &Rule) -> BoxedBody {
    match rule {
        Rule::Replace {
            find: Some(pattern),
            text,
        } => Box::new(ChunkedRegexReader::new(
            body,
            BODY_REWRITE_WINDOW,
            pattern.bytes.clone(),
            text.clone().into_bytes(),
        )),
        Rule::Replace { find: None, text } => Box::new(Cursor::new(text.clone().into_bytes())),
        Rule::Prepend(text) => Box::new(Cursor::new(text.clone().into_bytes()).chain(body)),
        Rule::Append(text) => Box::new(body.chain(Cursor::new(text.clone().into_bytes()))),
    }
}

/// Stacks the body rules into a reader pipeline. Rules apply in order, each
/// consuming the previous rule's output. Returns `None` when there is nothing
/// to do, so an untouched body keeps its known content length.
pub fn alter_body(body: BoxedBody, rules: &[Rule]) -> Option<BoxedBody> {
    if rules.is_empty() {
        return None;
    }
    let mut reader = body;
    for rule in rules {
        reader = apply_stream_rule(reader, rule);
    }
    Some(reader)
}

#[cfg(test)]
mod tests {
    use super::{alter_body, alter_header, alter_status, alter_url};
    use crate::compile::compile;
    use crate::schema::ConfigJson;
    use http::header::HeaderMap;
    use tokio::io::AsyncReadExt;
    use url::Url;

    fn rules_for(target: &str, rules_json: &str) -> Vec<crate::compile::Rule> {
        let json = format!(
            r#"{{"rules":[{{"rewrite":{{"request":{{"{target}":{rules_json}}}}}}}]}}"#
        );
        let config: ConfigJson = serde_json::from_str(&json).expect("config json");
        let mut compiled = compile(&config).expect("compile");
        let targets = compiled.remove(0).request;
        match target {
            "url" => targets.url,
            "header" => targets.header,
            "body" => targets.body,
            "status" => targets.status,
            other => panic!("unknown target {other}"),
        }
    }

    #[test]
    fn url_find_replace_redirects_the_host() {
        let rules = rules_for("url", r#"[{"find":"example\\.com","replace":"example.org"}]"#);
        let mut url = Url::parse("http://example.com/path?q=1").unwrap();
        alter_url(&mut url, &rules).expect("rewrite");
        assert_eq!(url.as_str(), "http://example.org/path?q=1");
    }

    #[test]
    fn url_rewrite_to_garbage_is_an_error_and_preserves_the_original() {
        let rules = rules_for("url", r#"[{"replace":"not a url"}]"#);
        let mut url = Url::parse("http://example.com/").unwrap();
        assert!(alter_url(&mut url, &rules).is_err());
        assert_eq!(url.as_str(), "http://example.com/");
    }

    #[test]
    fn header_delete_removes_the_whole_line() {
        let rules = rules_for("header", r#"[{"delete":"\\ncookie: .*?\\n"}]"#);
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "secret=1".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());
        alter_header(&mut headers, &rules).expect("rewrite");
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn header_append_adds_a_new_line() {
        let rules = rules_for("header", r#"[{"append":"x-injected: yes\n"}]"#);
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());
        alter_header(&mut headers, &rules).expect("rewrite");
        assert_eq!(headers.get("x-injected").unwrap(), "yes");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn header_rewrite_producing_an_illegal_name_keeps_the_original_map() {
        let rules = rules_for("header", r#"[{"replace":"bad name: oops"}]"#);
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());
        assert!(alter_header(&mut headers, &rules).is_err());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn empty_rule_list_leaves_headers_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());
        alter_header(&mut headers, &[]).expect("no-op");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn status_rewrite_changes_code_and_reason() {
        let rules = rules_for("status", r#"[{"replace":"404 Not Found"}]"#);
        let (code, reason) = alter_status(200, "OK", &rules).expect("rewrite");
        assert_eq!(code, 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn status_rewrite_without_an_integer_code_is_ignored() {
        let rules = rules_for("status", r#"[{"replace":"teapot"}]"#);
        assert!(alter_status(200, "OK", &rules).is_none());
    }

    #[tokio::test]
    async fn body_rules_stack_in_order() {
        let rules = rules_for(
            "body",
            r#"[{"find":"world","replace":"there"},{"prepend":"<<"},{"append":">>"}]"#,
        );
        let body = Box::new(std::io::Cursor::new(b"hello world".to_vec()));
        let mut reader = alter_body(body, &rules).expect("pipeline");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"<<hello there>>");
    }

    #[tokio::test]
    async fn body_replace_without_find_substitutes_everything() {
        let rules = rules_for("body", r#"[{"replace":"gone"}]"#);
        let body = Box::new(std::io::Cursor::new(b"original content".to_vec()));
        let mut reader = alter_body(body, &rules).expect("pipeline");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"gone");
    }

    #[test]
    fn empty_body_rules_report_nothing_to_do() {
        let body: super::BoxedBody = Box::new(std::io::Cursor::new(Vec::new()));
        assert!(alter_body(body, &[]).is_none());
    }
}
