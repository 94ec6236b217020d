//! tansaek - adaptive parallel fetch-and-converge engine
//!
//! An engine for iterative, network-bound research: it decides how many URLs
//! may be fetched at once, how hard any one domain may be hit, how failures are
//! retried, how fetched content is cached, and when a multi-round research loop
//! has gathered enough new information to stop.
//!
//! # Layout
//!
//! - [`concurrency`] - semaphore, per-domain limiter, adaptive controller,
//!   priority queue and the [`ParallelExecutor`](concurrency::ParallelExecutor)
//! - [`cache`] - TTL and size bounded content cache
//! - [`crawler`] - scraper seam, HTTP scraper, fallbacks and the
//!   [`UrlProcessor`](crawler::UrlProcessor)
//! - [`iteration`] - iteration state machine and the research loop
//! - [`storage`] - checkpoints for resumable sessions
//! - [`events`] - typed engine events
//! - [`config`], [`error`], [`metrics`], [`utils`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tansaek::crawler::{HttpScraper, UrlProcessor, UrlProcessorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scraper = Arc::new(HttpScraper::new()?);
//!     let processor = UrlProcessor::new(UrlProcessorConfig::default(), scraper)?;
//!     let results = processor
//!         .process_many(&["https://example.com/".to_string()])
//!         .await;
//!     println!("{}", results[0].success);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod iteration;
pub mod metrics;
pub mod storage;
pub mod utils;

/// Types most callers need, in one import
pub mod prelude {
    pub use crate::cache::{CacheConfig, CacheEntry, ContentCache};
    pub use crate::concurrency::{
        BatchResult, ParallelExecutor, ParallelExecutorConfig, Priority, Task, TaskResult,
    };
    pub use crate::config::EngineConfig;
    pub use crate::crawler::{Scraper, UrlProcessResult, UrlProcessor, UrlProcessorConfig};
    pub use crate::error::{EngineErrorTrait, Error, ErrorCategory, Result};
    pub use crate::events::{EngineEvent, EventBus};
    pub use crate::iteration::{
        ContinueDecision, IterationConfig, IterationController, IterationMetrics, Phase,
        StopReason,
    };
}
