//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tansaek::crawler::{FetchOptions, ScrapedPage, Scraper, UrlProcessorConfig};
use tansaek::utils::error::FetchError;
use tansaek::utils::extract_domain;
use tansaek::utils::retry::RetryConfig;

/// One scripted response
#[derive(Debug, Clone)]
pub enum Reply {
    Page(String),
    Status(u16),
}

#[derive(Default)]
struct Script {
    replies: HashMap<String, Vec<Reply>>,
    calls: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Scraper that replays scripted replies per URL after an optional delay
///
/// The last reply of a script repeats. Unknown URLs answer 404. The peak
/// number of concurrent fetches is tracked per domain and overall.
#[derive(Default)]
pub struct MockScraper {
    script: Mutex<Script>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, body: &str) -> Self {
        self.script(url, vec![Reply::Page(body.to_string())])
    }

    pub fn script(self, url: &str, replies: Vec<Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .replies
            .insert(url.to_string(), replies);
        self
    }

    pub fn delay(self, url: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().calls.values().sum()
    }

    pub fn peak_for_domain(&self, domain: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .peak
            .get(domain)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut script = self.script.lock().unwrap();
        let call = {
            let count = script.calls.entry(url.to_string()).or_default();
            *count += 1;
            *count
        };
        match script.replies.get(url) {
            Some(replies) if !replies.is_empty() => {
                replies[(call - 1).min(replies.len() - 1)].clone()
            }
            _ => Reply::Status(404),
        }
    }

    fn enter(&self, domain: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut script = self.script.lock().unwrap();
        let in_flight = script.in_flight.entry(domain.to_string()).or_default();
        *in_flight += 1;
        let current = *in_flight;
        let peak = script.peak.entry(domain.to_string()).or_default();
        *peak = (*peak).max(current);
    }

    fn leave(&self, domain: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(in_flight) = self.script.lock().unwrap().in_flight.get_mut(domain) {
            *in_flight -= 1;
        }
    }
}

#[async_trait]
impl Scraper for MockScraper {
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<ScrapedPage, FetchError> {
        let domain = extract_domain(url);
        let delay = self.delays.lock().unwrap().get(url).copied();

        self.enter(&domain);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.leave(&domain);

        match self.next_reply(url) {
            Reply::Page(body) => {
                let mut page = ScrapedPage::new(body.clone());
                page.title = tansaek::crawler::fetcher::extract_title(&body);
                Ok(page)
            }
            Reply::Status(status) => Err(FetchError::from_status(status)),
        }
    }
}

/// Minimal HTML page with a title and links
pub fn html_page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{href}">{href}</a>"#))
        .collect();
    format!("<html><head><title>{title}</title></head><body><p>{title}</p>{anchors}</body></html>")
}

/// Processor config with short retry delays and generous limits
pub fn fast_processor_config() -> UrlProcessorConfig {
    let mut config = UrlProcessorConfig::default();
    config.retry = RetryConfig::with_delays(2, 10, 100);
    config.parallel.max_concurrent = 8;
    config.parallel.max_per_domain = 4;
    config
}

pub fn shared(scraper: MockScraper) -> Arc<MockScraper> {
    Arc::new(scraper)
}
