use anyhow::{bail, Result};
use serde::Serialize;

use tansaek::config::EngineConfig;
use tansaek::crawler::url::validators;
use tansaek::crawler::{FallbackKind, UrlProcessResult};
use tansaek::events::EventBus;
use tansaek::utils::truncate_text;

use super::{build_processor, spawn_event_logger};

/// Characters of page content echoed per result
const PREVIEW_CHARS: usize = 280;

#[derive(Serialize)]
struct FetchReport<'a> {
    url: &'a str,
    success: bool,
    title: Option<&'a str>,
    error: Option<&'a str>,
    attempts: u32,
    processing_time_ms: u64,
    used_cache: bool,
    fallback: Option<FallbackKind>,
    content_bytes: usize,
    preview: Option<String>,
}

impl<'a> From<&'a UrlProcessResult> for FetchReport<'a> {
    fn from(r: &'a UrlProcessResult) -> Self {
        Self {
            url: &r.url,
            success: r.success,
            title: r.title.as_deref(),
            error: r.error.as_deref(),
            attempts: r.attempts,
            processing_time_ms: r.processing_time_ms,
            used_cache: r.used_cache,
            fallback: r.fallback,
            content_bytes: r.content.as_ref().map_or(0, String::len),
            preview: r
                .content
                .as_deref()
                .map(|c| truncate_text(c.trim(), PREVIEW_CHARS)),
        }
    }
}

/// Process `urls` once and print one JSON report per URL, in input order
pub async fn fetch(config: &EngineConfig, urls: Vec<String>) -> Result<()> {
    for url in &urls {
        if let Err(e) = validators::validate_url(url) {
            bail!(e);
        }
    }

    let events = EventBus::default();
    spawn_event_logger(&events);
    let processor = build_processor(config, events)?;

    tracing::info!(count = urls.len(), "Fetching URLs");
    let results = processor.process_many(&urls).await;

    let reports: Vec<FetchReport<'_>> = results.iter().map(FetchReport::from).collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        tracing::warn!(failed, total = results.len(), "Some URLs could not be fetched");
    }
    Ok(())
}
