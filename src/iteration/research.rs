//! Research loop: plan, fetch, assess, repeat until converged
//!
//! One round moves the controller through
//! `Searching -> Scraping -> Analyzing -> Aggregating`. URLs that already
//! succeeded in this session are never fetched again. After each round the
//! session is checkpointed when a [`CheckpointManager`] is attached.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{ContinueDecision, IterationController, IterationMetrics, IterationRecord, Phase, StopReason};
use crate::crawler::url::LinkExtractor;
use crate::crawler::{UrlProcessResult, UrlProcessor};
use crate::error::Result;
use crate::storage::{CheckpointManager, ResearchCheckpoint};
use crate::utils::{content_hash, duration_ms};

/// Judgement of one round's results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Share of new information, clamped to 0.0..=1.0
    pub new_info_rate: f64,
    pub findings: Vec<String>,
}

/// Decides what to fetch and how much was learned
#[async_trait]
pub trait RoundPlanner: Send + Sync {
    /// URLs to fetch in `iteration`; an empty plan ends the loop as converged
    async fn plan(&self, iteration: u32, history: &[IterationRecord]) -> anyhow::Result<Vec<String>>;

    async fn assess(&self, iteration: u32, results: &[UrlProcessResult]) -> anyhow::Result<Assessment>;

    /// URLs planned for later rounds, persisted in checkpoints
    fn pending(&self) -> Vec<String> {
        Vec::new()
    }

    /// Re-queue URLs from a checkpoint
    fn restore_pending(&self, _urls: Vec<String>) {}
}

/// How a research run ended
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub reason: StopReason,
    pub checkpoint: ResearchCheckpoint,
}

impl ResearchOutcome {
    pub fn rounds(&self) -> usize {
        self.checkpoint.state.results.len()
    }

    pub fn phase(&self) -> Phase {
        self.checkpoint.state.phase
    }
}

/// Drives an [`IterationController`] with a [`UrlProcessor`]
pub struct ResearchLoop {
    controller: Arc<IterationController>,
    processor: Arc<UrlProcessor>,
    planner: Arc<dyn RoundPlanner>,
    checkpoints: Option<(CheckpointManager, String)>,
    progress: ResearchCheckpoint,
}

impl ResearchLoop {
    pub fn new(
        controller: Arc<IterationController>,
        processor: Arc<UrlProcessor>,
        planner: Arc<dyn RoundPlanner>,
    ) -> Self {
        let progress = ResearchCheckpoint::new(controller.snapshot());
        Self {
            controller,
            processor,
            planner,
            checkpoints: None,
            progress,
        }
    }

    /// Save the session under `name` after every round
    pub fn with_checkpoints(mut self, manager: CheckpointManager, name: impl Into<String>) -> Self {
        self.checkpoints = Some((manager, name.into()));
        self
    }

    /// Continue a saved session
    ///
    /// Clears the abort flag so a paused session can run again; failed URLs
    /// go back to the planner together with its saved frontier.
    pub fn resume(mut self, checkpoint: ResearchCheckpoint) -> Self {
        let mut state = checkpoint.state.clone();
        state.aborted = false;
        if state.phase == Phase::Paused {
            state.phase = Phase::Initializing;
        }
        self.controller.restore(state);

        let mut pending = checkpoint.frontier.clone();
        pending.extend(checkpoint.failed_urls());
        self.planner.restore_pending(pending);

        info!(
            session_id = %checkpoint.state.session_id,
            succeeded = checkpoint.succeeded_count(),
            "Resuming research session"
        );
        self.progress = checkpoint;
        self
    }

    pub fn controller(&self) -> &Arc<IterationController> {
        &self.controller
    }

    pub fn progress(&self) -> &ResearchCheckpoint {
        &self.progress
    }

    fn round_timeout(&self) -> Option<Duration> {
        self.controller
            .config()
            .timeout()
            .or_else(|| self.processor.config().timeouts.per_iteration())
    }

    /// Run rounds until the controller says stop
    ///
    /// Only checkpoint I/O errors surface as `Err`; round failures are
    /// counted by the controller.
    pub async fn run(&mut self) -> Result<ResearchOutcome> {
        let started = Instant::now();
        let deadline = self
            .processor
            .config()
            .timeouts
            .total()
            .map(|total| started + total);

        info!(session_id = %self.controller.session_id(), "Research loop started");

        let reason = loop {
            if let ContinueDecision::Stop(reason) = self.controller.should_continue() {
                break reason;
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                warn!("Total research time exhausted, aborting");
                self.controller.abort();
                continue;
            }

            let limit = match (self.round_timeout(), remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if let Err(e) = self.run_round(limit).await {
                let error = format!("{e:#}");
                // running out of total time pauses the session; the round itself did not fail
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(error = %error, "Total research time exhausted mid-round, aborting");
                    self.controller.abort();
                } else {
                    self.controller.fail_iteration(&error);
                }
            }
            self.save_checkpoint()?;
        };

        self.controller.set_phase(reason.final_phase());
        self.save_checkpoint()?;

        info!(
            reason = %reason,
            rounds = self.progress.state.results.len(),
            succeeded_urls = self.progress.succeeded_count(),
            elapsed_ms = duration_ms(started.elapsed()),
            "Research loop finished"
        );
        Ok(ResearchOutcome {
            reason,
            checkpoint: self.progress.clone(),
        })
    }

    async fn run_round(&mut self, limit: Option<Duration>) -> anyhow::Result<()> {
        let round_started = Instant::now();
        let iteration = self.controller.start_iteration();

        let history = self.controller.results();
        let planned = self
            .planner
            .plan(iteration, &history)
            .await
            .context("planning failed")?;

        let mut seen = HashSet::new();
        let urls: Vec<String> = planned
            .into_iter()
            .filter(|url| !self.progress.is_succeeded(url) && seen.insert(url.clone()))
            .collect();

        if urls.is_empty() {
            info!(iteration, "Nothing left to fetch");
            self.controller.set_phase(Phase::Aggregating);
            self.controller.complete_iteration(IterationMetrics {
                duration_ms: duration_ms(round_started.elapsed()),
                ..Default::default()
            });
            return Ok(());
        }

        self.controller.set_phase(Phase::Scraping);
        let fetch = self.processor.process_many(&urls);
        let results = match limit {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(results) => results,
                Err(_) => {
                    // Nothing from this round was recorded; hand the URLs back.
                    self.planner.restore_pending(urls.clone());
                    return Err(anyhow!(
                        "iteration {iteration} timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => fetch.await,
        };
        for result in &results {
            self.progress.record(result);
        }

        self.controller.set_phase(Phase::Analyzing);
        let assessment = self
            .planner
            .assess(iteration, &results)
            .await
            .context("assessment failed")?;

        self.controller.set_phase(Phase::Aggregating);
        let succeeded = results.iter().filter(|r| r.success).count();
        let new_info_rate = if assessment.new_info_rate.is_finite() {
            assessment.new_info_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.controller.complete_iteration(IterationMetrics {
            urls_processed: results.len(),
            urls_succeeded: succeeded,
            urls_failed: results.len() - succeeded,
            new_info_rate,
            findings: assessment.findings,
            duration_ms: duration_ms(round_started.elapsed()),
        });
        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        self.progress.state = self.controller.snapshot();
        self.progress.frontier = self.planner.pending();
        self.progress.saved_at = Utc::now();

        if let Some((manager, name)) = &self.checkpoints {
            manager.save(name, &self.progress)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Frontier {
    queue: VecDeque<String>,
    planned: HashSet<String>,
    seen_hashes: HashSet<String>,
}

/// Follows links found in fetched pages, breadth first
///
/// The new-info rate of a round is the share of successfully fetched pages
/// whose content hash was not seen before in this session.
#[derive(Debug)]
pub struct LinkFollowingPlanner {
    extractor: LinkExtractor,
    max_urls_per_round: usize,
    frontier: Mutex<Frontier>,
}

impl LinkFollowingPlanner {
    pub fn new(seeds: Vec<String>, max_urls_per_round: usize, same_domain_only: bool) -> Self {
        let planner = Self {
            extractor: LinkExtractor::new(same_domain_only),
            max_urls_per_round: max_urls_per_round.max(1),
            frontier: Mutex::new(Frontier::default()),
        };
        planner.push(seeds);
        planner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Frontier> {
        self.frontier.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, urls: impl IntoIterator<Item = String>) {
        let mut frontier = self.lock();
        for url in urls {
            if !frontier.planned.contains(&url) && !frontier.queue.contains(&url) {
                frontier.queue.push_back(url);
            }
        }
    }
}

#[async_trait]
impl RoundPlanner for LinkFollowingPlanner {
    async fn plan(&self, _iteration: u32, _history: &[IterationRecord]) -> anyhow::Result<Vec<String>> {
        let mut frontier = self.lock();
        let take = frontier.queue.len().min(self.max_urls_per_round);
        let urls: Vec<String> = frontier.queue.drain(..take).collect();
        frontier.planned.extend(urls.iter().cloned());
        Ok(urls)
    }

    async fn assess(&self, _iteration: u32, results: &[UrlProcessResult]) -> anyhow::Result<Assessment> {
        let mut fresh = 0usize;
        let mut succeeded = 0usize;
        let mut findings = Vec::new();
        let mut discovered = Vec::new();

        {
            let mut frontier = self.lock();
            for result in results.iter().filter(|r| r.success) {
                succeeded += 1;
                let Some(content) = result.content.as_deref() else {
                    continue;
                };
                if frontier.seen_hashes.insert(content_hash(content)) {
                    fresh += 1;
                    findings.push(match &result.title {
                        Some(title) => format!("{title} ({})", result.url),
                        None => result.url.clone(),
                    });
                }
                discovered.extend(self.extractor.extract(content, &result.url));
            }
        }
        self.push(discovered);

        let new_info_rate = if succeeded == 0 {
            0.0
        } else {
            fresh as f64 / succeeded as f64
        };
        Ok(Assessment {
            new_info_rate,
            findings,
        })
    }

    fn pending(&self) -> Vec<String> {
        self.lock().queue.iter().cloned().collect()
    }

    fn restore_pending(&self, urls: Vec<String>) {
        let mut frontier = self.lock();
        for url in urls {
            frontier.planned.remove(&url);
            if !frontier.queue.contains(&url) {
                frontier.queue.push_back(url);
            }
        }
    }
}
