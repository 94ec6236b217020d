pub mod fetch;
pub mod research;
pub mod stats;

use anyhow::{Context, Result};
use std::sync::Arc;

use tansaek::concurrency::ParallelExecutorBuilder;
use tansaek::config::EngineConfig;
use tansaek::crawler::{HttpScraper, UrlProcessor};
use tansaek::events::EventBus;

// Re-export command functions for convenience
pub use fetch::fetch;
pub use research::{research, resume, ResearchParams};
pub use stats::stats;

/// Wire scraper, executor and processor from configuration
pub(crate) fn build_processor(config: &EngineConfig, events: EventBus) -> Result<Arc<UrlProcessor>> {
    let scraper = HttpScraper::with_config(config.scraper.clone())
        .context("Failed to create HTTP scraper")?;

    let executor = ParallelExecutorBuilder::new(config.executor.clone())
        .event_bus(events.clone())
        .build()
        .context("Invalid executor configuration")?;

    let processor = UrlProcessor::new(config.processor.clone(), Arc::new(scraper))
        .context("Invalid processor configuration")?
        .with_executor(Arc::new(executor))
        .with_configured_fallbacks();

    Ok(Arc::new(processor))
}

/// Log engine events at debug level until the bus closes
pub(crate) fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(event = event.name(), detail = ?event, "Engine event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
