//! Document Fetch/Extract
//!
//! Thin excerpt fetcher behind the `DocumentFetcher` trait: a reqwest GET
//! with timeout and user agent, script/style blocks and tags stripped, basic
//! entities decoded, and the surviving text truncated to a configured excerpt
//! length. Not a readability engine.

use crate::models::ReadStatus;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; delver/0.1)";

/// Errors that can occur while fetching one document
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetch request failed: {0}")]
    Request(String),

    #[error("Fetch returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Fetch returned an empty body")]
    EmptyBody,

    #[error("No readable text after markup stripping")]
    NoText,
}

impl FetchError {
    /// Ledger status for a reader pipeline that stopped on this error.
    pub fn as_read_status(&self) -> ReadStatus {
        match self {
            FetchError::NoText => ReadStatus::ParseFailed,
            _ => ReadStatus::FetchFailed,
        }
    }
}

/// Fetch a URL and return readable text for the reader agent.
///
/// Errors are per-document; callers turn them into degraded ledger entries
/// instead of aborting sibling fetches.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_extract(&self, url: &str) -> Result<String, FetchError>;
}

/// reqwest-backed excerpt fetcher
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    user_agent: String,
    max_chars: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_chars: usize) -> Self {
        Self {
            client: Client::new(),
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_chars,
        }
    }

    pub fn from_config(config: &crate::config::FetchConfig) -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent.clone(),
            max_chars: config.excerpt_max_chars,
        }
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch_extract(&self, url: &str) -> Result<String, FetchError> {
        debug!(url = %url, "Fetching document");

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }

        let text = extract_text(&body);
        if text.is_empty() {
            return Err(FetchError::NoText);
        }

        Ok(truncate_chars(&text, self.max_chars).to_string())
    }
}

/// Reduce an HTML body to plain text: drop script/style blocks, strip tags,
/// decode common entities, squeeze whitespace.
fn extract_text(html: &str) -> String {
    let without_scripts = strip_element(html, "script");
    let without_styles = strip_element(&without_scripts, "style");
    let text = strip_tags(&without_styles);
    let text = decode_entities(&text);
    squeeze_whitespace(&text)
}

/// Remove `<tag ...>...</tag>` blocks, case-insensitive. An unterminated
/// block swallows the rest of the input.
fn strip_element(html: &str, tag: &str) -> String {
    let open = format!("<{}", tag);
    let close = format!("</{}", tag);

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = find_ci(rest, &open) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start..];
        rest = match find_ci(after_open, &close) {
            Some(close_start) => {
                let after_close = &after_open[close_start..];
                match after_close.find('>') {
                    Some(gt) => &after_close[gt + 1..],
                    None => "",
                }
            }
            None => "",
        };
    }
    out.push_str(rest);
    out
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

// `&amp;` last so an escaped entity decodes to its literal text, not twice.
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn squeeze_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive ASCII substring search returning a byte offset.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Truncate on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_drops_scripts_and_tags() {
        let html = r#"<html><head><title>T</title>
            <SCRIPT src="x.js">var a = 1;</SCRIPT>
            <style>.a { color: red; }</style></head>
            <body><h1>Heading</h1><p>First &amp; second&nbsp;line.</p></body></html>"#;
        let text = extract_text(html);
        assert_eq!(text, "T Heading First & second line.");
    }

    #[test]
    fn test_strip_element_handles_unterminated_block() {
        assert_eq!(strip_element("before<script>var x", "script"), "before");
    }

    #[test]
    fn test_decode_entities_does_not_double_decode() {
        assert_eq!(decode_entities("a &amp;lt; b"), "a &lt; b");
        assert_eq!(decode_entities("&lt;tag&gt;"), "<tag>");
    }

    #[test]
    fn test_find_ci() {
        assert_eq!(find_ci("abc<SCRIPT>", "<script"), Some(3));
        assert_eq!(find_ci("no match", "<script"), None);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[tokio::test]
    async fn test_fetch_extract_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><body><p>Useful   text</p><script>nope()</script></body></html>")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), 8000);
        let text = fetcher
            .fetch_extract(&format!("{}/page", server.url()))
            .await
            .unwrap();
        assert_eq!(text, "Useful text");
    }

    #[tokio::test]
    async fn test_fetch_extract_truncates_to_excerpt_length() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/long")
            .with_status(200)
            .with_body("abcdefghij")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), 4);
        let text = fetcher
            .fetch_extract(&format!("{}/long", server.url()))
            .await
            .unwrap();
        assert_eq!(text, "abcd");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), 8000);
        let err = fetcher
            .fetch_extract(&format!("{}/missing", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(err.as_read_status(), ReadStatus::FetchFailed);
    }

    #[tokio::test]
    async fn test_empty_body_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/empty")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), 8000);
        let err = fetcher
            .fetch_extract(&format!("{}/empty", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody));
    }

    #[tokio::test]
    async fn test_markup_only_body_has_no_text() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/markup")
            .with_status(200)
            .with_body("<script>only()</script><style>.x{}</style>")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), 8000);
        let err = fetcher
            .fetch_extract(&format!("{}/markup", server.url()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoText));
        assert_eq!(err.as_read_status(), ReadStatus::ParseFailed);
    }
}
