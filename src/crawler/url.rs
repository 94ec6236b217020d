//! Link extraction and URL normalization
//!
//! Used by the research driver to discover follow-up URLs in fetched pages.

use scraper::{Html, Selector};
use std::collections::BTreeSet;
use url::Url;

use crate::utils::extract_domain;

/// Canonical form used for deduplication
///
/// Resolves `href` against `base`, keeps only http(s), drops the fragment.
/// Returns `None` for anything that is not a fetchable web URL.
pub fn normalize_url(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let mut url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Extracts `<a href>` targets from HTML
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    anchor: Selector,
    same_domain_only: bool,
}

impl LinkExtractor {
    pub fn new(same_domain_only: bool) -> Self {
        Self {
            // A constant selector; parsing cannot fail.
            anchor: Selector::parse("a[href]").unwrap_or_else(|_| unreachable!()),
            same_domain_only,
        }
    }

    /// Normalized, deduplicated links in sorted order
    pub fn extract(&self, html: &str, page_url: &str) -> Vec<String> {
        let base = Url::parse(page_url).ok();
        let page_domain = extract_domain(page_url);
        let document = Html::parse_document(html);

        let links: BTreeSet<String> = document
            .select(&self.anchor)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| normalize_url(href, base.as_ref()))
            .filter(|link| !self.same_domain_only || extract_domain(link) == page_domain)
            .collect();

        links.into_iter().collect()
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// URL validation functions
pub mod validators {
    use url::Url;

    /// Whether `url` parses as an absolute http(s) URL with a host
    pub fn is_http_url(url: &str) -> bool {
        Url::parse(url)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .unwrap_or(false)
    }

    /// Validate URL and return an error message if invalid
    pub fn validate_url(url: &str) -> Result<(), String> {
        let parsed = Url::parse(url).map_err(|e| format!("Invalid URL '{url}': {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("Unsupported scheme '{}' in {url}", parsed.scheme()));
        }
        if parsed.host_str().is_none() {
            return Err(format!("URL has no host: {url}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative_and_fragment() {
        let base = Url::parse("https://docs.example.com/guide/intro.html").unwrap();
        assert_eq!(
            normalize_url("../api/index.html#top", Some(&base)).as_deref(),
            Some("https://docs.example.com/api/index.html")
        );
        assert_eq!(normalize_url("#section", Some(&base)), None);
        assert_eq!(normalize_url("mailto:a@b.c", Some(&base)), None);
        assert_eq!(normalize_url("javascript:void(0)", Some(&base)), None);
    }

    #[test]
    fn test_extract_same_domain_links() {
        let html = r#"
            <a href="/a">A</a>
            <a href="/a#dup">A again</a>
            <a href="https://other.test/x">Other</a>
            <a href="https://Docs.Example.com/b">B</a>
            <a>no href</a>
        "#;
        let links = LinkExtractor::new(true).extract(html, "https://docs.example.com/");
        assert_eq!(
            links,
            vec![
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_all_domains() {
        let html = r#"<a href="https://other.test/x">x</a><a href="/y">y</a>"#;
        let links = LinkExtractor::new(false).extract(html, "https://site.test/");
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_validators() {
        assert!(validators::is_http_url("https://example.com"));
        assert!(!validators::is_http_url("ftp://example.com"));
        assert!(validators::validate_url("not a url").is_err());
        assert!(validators::validate_url("file:///etc/passwd").is_err());
        assert!(validators::validate_url("http://example.com/x").is_ok());
    }
}
