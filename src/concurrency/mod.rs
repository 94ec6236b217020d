//! Concurrency control for network-bound work
//!
//! Leaf primitives:
//! - [`Semaphore`]: global in-flight bound with an adjustable limit
//! - [`DomainRateLimiter`]: per-domain concurrency and pacing
//! - [`ResourceMonitor`]: rolling latency/error window
//!
//! Built on top of them:
//! - [`AdaptiveConcurrencyController`]: timer-driven effective concurrency
//! - [`ConcurrencyQueue`]: priority tiers, FIFO within a tier
//! - [`ParallelExecutor`]: the facade combining all of the above with retry

pub mod adaptive;
pub mod domain_limiter;
pub mod executor;
pub mod queue;
pub mod resource_monitor;
pub mod semaphore;
pub mod stream;
pub mod task;

pub use adaptive::{AdaptiveConcurrencyController, AdaptiveConfig, ConcurrencySnapshot};
pub use domain_limiter::{DomainPermit, DomainRateLimiter, DomainWindowState, RateLimiterConfig};
pub use executor::{ExecutorStats, ParallelExecutor, ParallelExecutorBuilder, ParallelExecutorConfig};
pub use queue::{ConcurrencyQueue, QueueConfig, QueueStats};
pub use resource_monitor::{ResourceMonitor, ResourceMonitorConfig, ResourceSnapshot};
pub use semaphore::{Semaphore, SemaphorePermit, SemaphoreStats};
pub use stream::TaskStream;
pub use task::{BatchResult, Priority, Task, TaskFn, TaskResult};
