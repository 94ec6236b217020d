//! Typed engine events
//!
//! Components publish [`EngineEvent`]s on an [`EventBus`] backed by a tokio
//! broadcast channel. Publishing never blocks and never fails: events sent
//! with no live subscriber are dropped, and a lagging subscriber only loses
//! its own backlog.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::iteration::{IterationRecord, StopReason};

/// Default broadcast buffer per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Everything observable about the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    TaskStart {
        task_id: String,
        url: String,
    },
    TaskComplete {
        task_id: String,
        url: String,
        duration_ms: u64,
        retries: u32,
    },
    TaskError {
        task_id: String,
        url: String,
        error: String,
        retries: u32,
    },
    Retrying {
        /// Task id, or the URL for processor-level retries
        id: String,
        url: String,
        retry: u32,
        delay_ms: u64,
        error: String,
    },
    CacheHit {
        url: String,
    },
    IterationStart {
        iteration: u32,
    },
    IterationComplete {
        record: IterationRecord,
    },
    IterationFailed {
        iteration: u32,
        error: String,
        consecutive_failures: u32,
    },
    ConvergenceReached {
        iteration: u32,
        new_info_rate: f64,
    },
    MaxIterationsReached {
        iteration: u32,
    },
    Aborted {
        iteration: u32,
        reason: StopReason,
    },
}

impl EngineEvent {
    /// Event name as used by log consumers
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStart { .. } => "taskStart",
            Self::TaskComplete { .. } => "taskComplete",
            Self::TaskError { .. } => "taskError",
            Self::Retrying { .. } => "retrying",
            Self::CacheHit { .. } => "cacheHit",
            Self::IterationStart { .. } => "iterationStart",
            Self::IterationComplete { .. } => "iterationComplete",
            Self::IterationFailed { .. } => "iterationFailed",
            Self::ConvergenceReached { .. } => "convergenceReached",
            Self::MaxIterationsReached { .. } => "maxIterationsReached",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Cloneable publish/subscribe handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new listener; it only sees events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current listener
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "Engine event");
        // No receivers is not an error for the emitter.
        let _ = self.sender.send(event);
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_listeners_is_silent() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::CacheHit {
            url: "https://example.com".into(),
        });
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::IterationStart { iteration: 1 });
        bus.emit(EngineEvent::MaxIterationsReached { iteration: 1 });

        assert_eq!(rx.recv().await.unwrap().name(), "iterationStart");
        assert_eq!(rx.recv().await.unwrap().name(), "maxIterationsReached");
    }

    #[tokio::test]
    async fn test_dropped_listener_does_not_affect_others() {
        let bus = EventBus::new(8);
        let dropped = bus.subscribe();
        let mut kept = bus.subscribe();
        drop(dropped);

        bus.emit(EngineEvent::CacheHit { url: "u".into() });
        assert_eq!(kept.recv().await.unwrap().name(), "cacheHit");
    }

    #[test]
    fn test_lagging_listener_does_not_block_emitter() {
        let bus = EventBus::new(1);
        let _slow = bus.subscribe();
        for i in 0..10 {
            bus.emit(EngineEvent::IterationStart { iteration: i });
        }
    }
}
