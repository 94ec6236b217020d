//! Multi-round research control
//!
//! [`IterationController`] is a caller-driven state machine: the caller starts
//! an iteration, moves it through phases, then completes or fails it and asks
//! [`IterationController::should_continue`] whether another round is worth it.
//!
//! Stop conditions are checked in a fixed priority order:
//!
//! 1. `aborted` - [`IterationController::abort`] was called
//! 2. `consecutive_failures` - failure streak reached the limit
//! 3. `max_iterations` - enough rounds completed
//! 4. `converged` - the latest round's new-info rate fell below the threshold
//!
//! [`ResearchLoop`](research::ResearchLoop) drives the controller together
//! with a [`UrlProcessor`](crate::crawler::UrlProcessor).

pub mod research;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics;

pub use research::{Assessment, LinkFollowingPlanner, ResearchLoop, ResearchOutcome, RoundPlanner};

/// Iteration limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    pub max_iterations: u32,
    /// A round whose new-info rate is below this ends the loop
    pub convergence_threshold: f64,
    /// Per-round deadline; overrides `processor.timeouts.per_iteration_ms`
    pub timeout_ms: Option<u64>,
    pub max_consecutive_failures: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            convergence_threshold: 0.1,
            timeout_ms: None,
            max_consecutive_failures: 3,
        }
    }
}

impl IterationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::config("iteration.max_iterations must be at least 1"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::config(
                "iteration.max_consecutive_failures must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.convergence_threshold) {
            return Err(Error::config(
                "iteration.convergence_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Pipeline stage of the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Initializing,
    Searching,
    Scraping,
    Analyzing,
    Aggregating,
    Generating,
    Completed,
    Failed,
    Paused,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Searching => "searching",
            Self::Scraping => "scraping",
            Self::Analyzing => "analyzing",
            Self::Aggregating => "aggregating",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Completed or failed sessions do not run further rounds
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the loop should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Aborted,
    ConsecutiveFailures,
    MaxIterations,
    Converged,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::MaxIterations => "max_iterations",
            Self::Converged => "converged",
        }
    }

    /// Phase a session ends in for this reason
    pub fn final_phase(&self) -> Phase {
        match self {
            Self::Converged | Self::MaxIterations => Phase::Completed,
            Self::ConsecutiveFailures => Phase::Failed,
            Self::Aborted => Phase::Paused,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer of [`IterationController::should_continue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum ContinueDecision {
    Continue,
    Stop(StopReason),
}

impl ContinueDecision {
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::Continue => None,
            Self::Stop(reason) => Some(*reason),
        }
    }

    /// `"continue"` or the stop reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Stop(reason) => reason.as_str(),
        }
    }
}

/// What the caller measured for one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub urls_processed: usize,
    pub urls_succeeded: usize,
    pub urls_failed: usize,
    /// Externally computed share of new information, 0.0 to 1.0
    pub new_info_rate: f64,
    pub findings: Vec<String>,
    pub duration_ms: u64,
}

/// One completed round; immutable once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub urls_processed: usize,
    pub urls_succeeded: usize,
    pub urls_failed: usize,
    pub new_info_rate: f64,
    pub findings: Vec<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Serializable controller state, used for checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    pub session_id: String,
    pub current_iteration: u32,
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub aborted: bool,
    pub results: Vec<IterationRecord>,
}

impl IterationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_iteration: 0,
            phase: Phase::Initializing,
            consecutive_failures: 0,
            aborted: false,
            results: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    state: IterationState,
    /// Stop conditions already announced through events
    announced: HashSet<StopReason>,
}

/// Iteration state machine; shareable across tasks
#[derive(Debug)]
pub struct IterationController {
    config: IterationConfig,
    inner: Mutex<ControllerState>,
    events: EventBus,
}

impl IterationController {
    /// New controller with a random session id
    pub fn new(config: IterationConfig) -> Result<Self> {
        Self::with_session_id(config, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_session_id(config: IterationConfig, session_id: impl Into<String>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(ControllerState {
                state: IterationState::new(session_id),
                announced: HashSet::new(),
            }),
            events: EventBus::default(),
        })
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &IterationConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.lock().state.session_id.clone()
    }

    pub fn current_iteration(&self) -> u32 {
        self.lock().state.current_iteration
    }

    pub fn phase(&self) -> Phase {
        self.lock().state.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().state.consecutive_failures
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().state.aborted
    }

    pub fn results(&self) -> Vec<IterationRecord> {
        self.lock().state.results.clone()
    }

    /// Begin the next round and return its number (1-based)
    pub fn start_iteration(&self) -> u32 {
        let iteration = {
            let mut inner = self.lock();
            inner.state.current_iteration += 1;
            inner.state.phase = Phase::Searching;
            inner.state.current_iteration
        };

        tracing::info!(iteration, "Iteration started");
        self.events.emit(EngineEvent::IterationStart { iteration });
        iteration
    }

    /// Move to `phase`; any transition is allowed
    pub fn set_phase(&self, phase: Phase) {
        let mut inner = self.lock();
        if inner.state.phase != phase {
            tracing::debug!(from = %inner.state.phase, to = %phase, "Phase change");
            inner.state.phase = phase;
        }
    }

    /// Append the round's record and update the failure streak
    pub fn complete_iteration(&self, round: IterationMetrics) -> IterationRecord {
        let record = {
            let mut inner = self.lock();
            let record = IterationRecord {
                iteration: inner.state.current_iteration,
                urls_processed: round.urls_processed,
                urls_succeeded: round.urls_succeeded,
                urls_failed: round.urls_failed,
                new_info_rate: round.new_info_rate,
                findings: round.findings,
                duration_ms: round.duration_ms,
                completed_at: Utc::now(),
            };

            if record.urls_succeeded > 0 {
                inner.state.consecutive_failures = 0;
            } else {
                inner.state.consecutive_failures += 1;
            }
            inner.state.results.push(record.clone());
            record
        };

        metrics::record_iteration("completed");
        tracing::info!(
            iteration = record.iteration,
            succeeded = record.urls_succeeded,
            failed = record.urls_failed,
            new_info_rate = record.new_info_rate,
            duration_ms = record.duration_ms,
            "Iteration completed"
        );
        self.events.emit(EngineEvent::IterationComplete {
            record: record.clone(),
        });
        record
    }

    /// Count a failed round; no record is appended
    pub fn fail_iteration(&self, error: &str) {
        let (iteration, consecutive_failures) = {
            let mut inner = self.lock();
            inner.state.consecutive_failures += 1;
            (inner.state.current_iteration, inner.state.consecutive_failures)
        };

        metrics::record_iteration("failed");
        tracing::warn!(iteration, consecutive_failures, error, "Iteration failed");
        self.events.emit(EngineEvent::IterationFailed {
            iteration,
            error: error.to_string(),
            consecutive_failures,
        });
    }

    /// Sticky until [`reset`](Self::reset)
    pub fn abort(&self) {
        let mut inner = self.lock();
        if !inner.state.aborted {
            tracing::info!(iteration = inner.state.current_iteration, "Research aborted");
            inner.state.aborted = true;
        }
    }

    /// Decide whether another round should run
    pub fn should_continue(&self) -> ContinueDecision {
        let (decision, announce) = {
            let mut inner = self.lock();
            let state = &inner.state;

            let reason = if state.aborted {
                Some(StopReason::Aborted)
            } else if state.consecutive_failures >= self.config.max_consecutive_failures {
                Some(StopReason::ConsecutiveFailures)
            } else if state.results.len() >= self.config.max_iterations as usize {
                Some(StopReason::MaxIterations)
            } else if state
                .results
                .last()
                .is_some_and(|r| r.new_info_rate < self.config.convergence_threshold)
            {
                Some(StopReason::Converged)
            } else {
                None
            };

            match reason {
                None => (ContinueDecision::Continue, None),
                Some(reason) => {
                    let iteration = state.current_iteration;
                    let rate = state.results.last().map_or(0.0, |r| r.new_info_rate);
                    let first_time = inner.announced.insert(reason);
                    (
                        ContinueDecision::Stop(reason),
                        first_time.then_some((reason, iteration, rate)),
                    )
                }
            }
        };

        if let Some((reason, iteration, new_info_rate)) = announce {
            tracing::info!(iteration, reason = %reason, "Research loop stopping");
            let event = match reason {
                StopReason::Converged => EngineEvent::ConvergenceReached {
                    iteration,
                    new_info_rate,
                },
                StopReason::MaxIterations => EngineEvent::MaxIterationsReached { iteration },
                StopReason::Aborted | StopReason::ConsecutiveFailures => {
                    EngineEvent::Aborted { iteration, reason }
                }
            };
            self.events.emit(event);
        }
        decision
    }

    /// Mean new-info rate over all records; 0 when empty
    pub fn average_new_info_rate(&self) -> f64 {
        let inner = self.lock();
        let results = &inner.state.results;
        if results.is_empty() {
            return 0.0;
        }
        results.iter().map(|r| r.new_info_rate).sum::<f64>() / results.len() as f64
    }

    /// Sum of record durations in milliseconds; 0 when empty
    pub fn total_processing_time(&self) -> u64 {
        self.lock().state.results.iter().map(|r| r.duration_ms).sum()
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        let session_id = std::mem::take(&mut inner.state.session_id);
        inner.state = IterationState::new(session_id);
        inner.announced.clear();
        tracing::debug!("Iteration controller reset");
    }

    pub fn snapshot(&self) -> IterationState {
        self.lock().state.clone()
    }

    /// Replace the whole state, e.g. from a checkpoint
    pub fn restore(&self, state: IterationState) {
        let mut inner = self.lock();
        tracing::info!(
            session_id = %state.session_id,
            iteration = state.current_iteration,
            phase = %state.phase,
            "Iteration state restored"
        );
        inner.state = state;
        inner.announced.clear();
    }
}
