//! HTTP scraper with user-agent rotation and charset-aware decoding
//!
//! This module provides the production [`Scraper`] implementation:
//! - User-Agent rotation
//! - Status classification (429/5xx retryable, other errors final)
//! - Charset detection from `Content-Type` or a `<meta charset>` tag
//! - Page title extraction
//!
//! Retry, pacing and concurrency are the caller's concern (see
//! [`UrlProcessor`](super::UrlProcessor)); a single `fetch` is one request.

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use rand::seq::SliceRandom;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT},
    Client, Response,
};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{FetchOptions, ScrapedPage, Scraper};
use crate::utils::error::FetchError;

/// Pool of realistic User-Agent strings for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
];

/// Bytes inspected when sniffing a `<meta charset>` declaration
const META_SNIFF_BYTES: usize = 1024;

/// HTTP scraper configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpScraperConfig {
    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// Fixed User-Agent; rotates through a built-in pool when unset
    pub user_agent: Option<String>,

    pub accept_language: String,

    /// Keep cookies between requests
    pub enable_cookies: bool,
}

impl Default for HttpScraperConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: None,
            accept_language: "en-US,en;q=0.9,ko;q=0.8".to_string(),
            enable_cookies: true,
        }
    }
}

/// Production [`Scraper`] backed by `reqwest`
pub struct HttpScraper {
    /// HTTP client with configured timeout and compression
    client: Client,

    config: HttpScraperConfig,

    /// Optional base URL override for testing with mock servers
    base_url: Option<String>,
}

impl HttpScraper {
    /// Create a scraper with default settings
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(HttpScraperConfig::default())
    }

    /// Create a scraper with custom configuration
    pub fn with_config(config: HttpScraperConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .gzip(true)
            .cookie_store(config.enable_cookies)
            .build()?;

        Ok(Self {
            client,
            config,
            base_url: None,
        })
    }

    /// Create a scraper that prefixes every request path with `base_url`
    ///
    /// Used against mock servers in tests.
    pub fn with_base_url(base_url: &str, config: HttpScraperConfig) -> Result<Self, FetchError> {
        let mut scraper = Self::with_config(config)?;
        scraper.base_url = Some(base_url.trim_end_matches('/').to_string());
        Ok(scraper)
    }

    fn resolve(&self, url: &str) -> Result<reqwest::Url, FetchError> {
        let full_url = match &self.base_url {
            Some(base) => format!("{base}{url}"),
            None => url.to_string(),
        };
        reqwest::Url::parse(&full_url).map_err(|e| FetchError::InvalidUrl(format!("{full_url}: {e}")))
    }

    async fn read_page(&self, response: Response) -> Result<ScrapedPage, FetchError> {
        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        let content = decode_bytes(&bytes, content_type.as_deref().unwrap_or_default())?;

        let looks_like_html = content_type
            .as_deref()
            .map_or(true, |ct| ct.to_ascii_lowercase().contains("html"));
        let title = if looks_like_html {
            extract_title(&content)
        } else {
            None
        };

        let mut metadata = HashMap::new();
        metadata.insert("status".to_string(), status.as_u16().to_string());
        metadata.insert("final_url".to_string(), final_url);
        metadata.insert("content_length".to_string(), bytes.len().to_string());

        Ok(ScrapedPage {
            content,
            title,
            content_type,
            metadata,
        })
    }

    /// Build HTTP headers for a request
    fn build_headers(&self, options: &FetchOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let user_agent = self
            .config
            .user_agent
            .as_deref()
            .unwrap_or_else(|| random_user_agent());
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }

        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        if let Ok(value) = HeaderValue::from_str(&self.config.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }

        for (name, value) in &options.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::debug!(header = %name, "Skipping invalid request header"),
            }
        }

        headers
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ScrapedPage, FetchError> {
        let target = self.resolve(url)?;
        let mut request = self.client.get(target).headers(self.build_headers(options));
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, status = status.as_u16(), "Non-success response");
            return Err(FetchError::from_status(status.as_u16()));
        }

        self.read_page(response).await
    }
}

/// Get a random user agent from the pool
fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

/// Decode a response body to a string
///
/// Strategies, in order:
/// 1. The `charset` parameter of `Content-Type`
/// 2. Strict UTF-8
/// 3. A `<meta charset>` declaration in the first kilobyte
///
/// # Errors
///
/// Returns `FetchError::Decode` if no strategy yields clean text
pub fn decode_bytes(bytes: &[u8], content_type: &str) -> Result<String, FetchError> {
    if let Some(encoding) = charset_param(content_type).and_then(|c| Encoding::for_label(c.as_bytes())) {
        return decode_with(encoding, bytes);
    }

    if let Ok(text) = decode_with(UTF_8, bytes) {
        return Ok(text);
    }

    let head = &bytes[..bytes.len().min(META_SNIFF_BYTES)];
    if let Some(encoding) = Encoding::for_bom(bytes)
        .map(|(encoding, _)| encoding)
        .or_else(|| sniff_meta_charset(head))
    {
        return decode_with(encoding, bytes);
    }

    Err(FetchError::Decode(
        "content is not valid UTF-8 and declares no charset".to_string(),
    ))
}

fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> Result<String, FetchError> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(FetchError::Decode(format!(
            "{} decoding errors",
            encoding.name()
        )));
    }
    Ok(text.into_owned())
}

fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn sniff_meta_charset(head: &[u8]) -> Option<&'static Encoding> {
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    let start = text.find("charset=")? + "charset=".len();
    let label: String = text[start..]
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    Encoding::for_label(label.as_bytes())
}

/// Text of the first `<title>` element, whitespace-collapsed
pub fn extract_title(html: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(html);
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_agents_come_from_the_pool() {
        let seen: std::collections::HashSet<_> = (0..100).map(|_| random_user_agent()).collect();
        assert!(seen.iter().all(|agent| USER_AGENTS.contains(agent)));
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_fixed_agent_and_extra_headers_are_sent() {
        let scraper = HttpScraper::with_config(HttpScraperConfig {
            user_agent: Some("tansaek-test/1.0".into()),
            ..Default::default()
        })
        .unwrap();
        let options = FetchOptions {
            headers: vec![("x-trace".into(), "abc".into())],
            ..Default::default()
        };

        let headers = scraper.build_headers(&options);
        assert_eq!(headers[USER_AGENT], "tansaek-test/1.0");
        assert_eq!(headers["x-trace"], "abc");
        assert!(headers.contains_key(ACCEPT));
    }

    #[test]
    fn test_unset_agent_is_drawn_from_the_pool() {
        let scraper = HttpScraper::with_config(HttpScraperConfig::default()).unwrap();
        let headers = scraper.build_headers(&FetchOptions::default());
        let agent = headers[USER_AGENT].to_str().unwrap();
        assert!(USER_AGENTS.contains(&agent));
    }

    #[test]
    fn test_utf8_passes_through() {
        let body = "검색 결과: tokio";
        assert_eq!(decode_bytes(body.as_bytes(), "text/html; charset=utf-8").unwrap(), body);
    }

    #[test]
    fn test_header_charset_wins() {
        let (encoded, _, _) = encoding_rs::EUC_KR.encode("안녕하세요");
        let decoded = decode_bytes(&encoded, "text/html; charset=\"EUC-KR\"").unwrap();
        assert_eq!(decoded, "안녕하세요");
    }

    #[test]
    fn test_meta_charset_is_sniffed() {
        let (tail, _, _) = encoding_rs::EUC_KR.encode("안녕");
        let mut body = b"<html><head><meta charset=\"euc-kr\"></head><body>".to_vec();
        body.extend_from_slice(&tail);
        assert!(decode_bytes(&body, "text/html").unwrap().ends_with("안녕"));
    }

    #[test]
    fn test_undeclared_binary_is_a_decode_error() {
        let result = decode_bytes(&[0xc3, 0x28, 0xa0, 0xa1], "application/octet-stream");
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_title_whitespace_is_collapsed() {
        let html = "<html><head><title>\n  Rust   Async Book </title></head></html>";
        assert_eq!(extract_title(html).as_deref(), Some("Rust Async Book"));
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[test]
    fn test_resolve_handles_base_and_garbage() {
        let plain = HttpScraper::new().unwrap();
        assert!(matches!(plain.resolve("not a url"), Err(FetchError::InvalidUrl(_))));

        let mocked =
            HttpScraper::with_base_url("http://localhost:8080/", HttpScraperConfig::default())
                .unwrap();
        assert_eq!(
            mocked.resolve("/page").unwrap().as_str(),
            "http://localhost:8080/page"
        );
    }
}
