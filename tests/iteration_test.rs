//! Integration tests for the iteration controller and the research loop

mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use common::{fast_processor_config, html_page, shared, MockScraper};
use tansaek::crawler::{UrlProcessResult, UrlProcessor, UrlProcessorConfig};
use tansaek::events::EngineEvent;
use tansaek::iteration::{
    Assessment, ContinueDecision, IterationConfig, IterationController, IterationMetrics,
    IterationRecord, LinkFollowingPlanner, Phase, ResearchLoop, RoundPlanner, StopReason,
};
use tansaek::storage::{CheckpointManager, ResearchCheckpoint, UrlStatus};

fn controller(config: IterationConfig) -> IterationController {
    IterationController::with_session_id(config, "it-session").unwrap()
}

fn round(succeeded: usize, rate: f64) -> IterationMetrics {
    IterationMetrics {
        urls_processed: 2,
        urls_succeeded: succeeded,
        urls_failed: 2 - succeeded,
        new_info_rate: rate,
        findings: vec![format!("rate {rate}")],
        duration_ms: 10,
    }
}

// ============================================================================
// Controller
// ============================================================================

#[test]
fn test_converges_when_rate_drops_below_threshold() {
    let ctl = controller(IterationConfig {
        convergence_threshold: 0.1,
        ..Default::default()
    });

    ctl.start_iteration();
    ctl.complete_iteration(round(2, 0.5));
    assert!(ctl.should_continue().should_continue());

    ctl.start_iteration();
    ctl.complete_iteration(round(2, 0.05));
    let decision = ctl.should_continue();
    assert_eq!(decision, ContinueDecision::Stop(StopReason::Converged));
    assert_eq!(decision.reason(), "converged");
}

#[test]
fn test_stops_at_max_iterations() {
    let ctl = controller(IterationConfig {
        max_iterations: 2,
        ..Default::default()
    });

    for _ in 0..2 {
        assert!(ctl.should_continue().should_continue());
        ctl.start_iteration();
        ctl.complete_iteration(round(2, 0.9));
    }
    assert_eq!(
        ctl.should_continue().stop_reason(),
        Some(StopReason::MaxIterations)
    );
    assert_eq!(ctl.results().len(), 2);
}

#[test]
fn test_consecutive_failures_stop_and_announce() {
    let ctl = controller(IterationConfig {
        max_consecutive_failures: 2,
        ..Default::default()
    });
    let mut rx = ctl.events().subscribe();

    ctl.start_iteration();
    ctl.fail_iteration("planner down");
    assert!(ctl.should_continue().should_continue());
    ctl.start_iteration();
    ctl.fail_iteration("planner down");

    assert_eq!(
        ctl.should_continue(),
        ContinueDecision::Stop(StopReason::ConsecutiveFailures)
    );
    assert!(ctl.results().is_empty());

    let aborted: Vec<StopReason> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|event| match event {
            EngineEvent::Aborted { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(aborted, vec![StopReason::ConsecutiveFailures]);
}

#[test]
fn test_abort_takes_priority() {
    let ctl = controller(IterationConfig {
        max_iterations: 1,
        max_consecutive_failures: 1,
        ..Default::default()
    });
    ctl.start_iteration();
    ctl.complete_iteration(round(0, 0.0));
    ctl.abort();

    assert_eq!(ctl.should_continue().stop_reason(), Some(StopReason::Aborted));
    // Sticky until reset
    assert!(ctl.is_aborted());
    assert_eq!(ctl.should_continue().stop_reason(), Some(StopReason::Aborted));
}

#[test]
fn test_reset_keeps_session_only() {
    let ctl = controller(IterationConfig::default());
    ctl.start_iteration();
    ctl.complete_iteration(round(1, 0.7));
    ctl.fail_iteration("x");
    ctl.abort();

    ctl.reset();
    assert_eq!(ctl.session_id(), "it-session");
    assert_eq!(ctl.current_iteration(), 0);
    assert_eq!(ctl.phase(), Phase::Initializing);
    assert_eq!(ctl.consecutive_failures(), 0);
    assert!(!ctl.is_aborted());
    assert!(ctl.results().is_empty());
    assert_eq!(ctl.should_continue(), ContinueDecision::Continue);
}

// ============================================================================
// Research loop
// ============================================================================

/// Planner with a fixed plan and new-info rate per round
struct ScriptedPlanner {
    rounds: Mutex<Vec<(Vec<String>, f64)>>,
}

impl ScriptedPlanner {
    fn new(rounds: Vec<(Vec<&str>, f64)>) -> Self {
        Self {
            rounds: Mutex::new(
                rounds
                    .into_iter()
                    .map(|(urls, rate)| (urls.into_iter().map(str::to_string).collect(), rate))
                    .collect(),
            ),
        }
    }

    fn rate_for(&self, iteration: u32) -> f64 {
        let rounds = self.rounds.lock().unwrap();
        rounds
            .get(iteration as usize - 1)
            .map_or(0.0, |(_, rate)| *rate)
    }
}

#[async_trait]
impl RoundPlanner for ScriptedPlanner {
    async fn plan(&self, iteration: u32, _history: &[IterationRecord]) -> anyhow::Result<Vec<String>> {
        let rounds = self.rounds.lock().unwrap();
        match rounds.get(iteration as usize - 1) {
            Some((urls, _)) => Ok(urls.clone()),
            None => anyhow::bail!("no plan for round {iteration}"),
        }
    }

    async fn assess(&self, iteration: u32, results: &[UrlProcessResult]) -> anyhow::Result<Assessment> {
        Ok(Assessment {
            new_info_rate: self.rate_for(iteration),
            findings: results.iter().map(|r| r.url.clone()).collect(),
        })
    }
}

fn processor(scraper: Arc<MockScraper>, config: UrlProcessorConfig) -> Arc<UrlProcessor> {
    Arc::new(UrlProcessor::new(config, scraper).unwrap())
}

fn site() -> MockScraper {
    // /c repeats /a word for word
    let a = html_page("Alpha", &["/c"]);
    MockScraper::new()
        .page("https://site.test/", &html_page("Home", &["/a", "/b", "https://other.test/"]))
        .page("https://site.test/a", &a)
        .page("https://site.test/b", &html_page("Beta", &["/a"]))
        .page("https://site.test/c", &a)
}

#[tokio::test]
async fn test_link_following_session_converges_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path()).unwrap();
    let scraper = shared(site());

    let ctl = Arc::new(controller(IterationConfig::default()));
    let planner = Arc::new(LinkFollowingPlanner::new(
        vec!["https://site.test/".to_string()],
        10,
        true,
    ));
    let mut research = ResearchLoop::new(ctl, processor(scraper.clone(), fast_processor_config()), planner)
        .with_checkpoints(manager, "site");

    let outcome = research.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::Converged);
    assert_eq!(outcome.phase(), Phase::Completed);
    assert_eq!(outcome.rounds(), 3);

    let rates: Vec<f64> = outcome
        .checkpoint
        .state
        .results
        .iter()
        .map(|r| r.new_info_rate)
        .collect();
    assert_eq!(rates, vec![1.0, 1.0, 0.0]);
    assert_eq!(
        outcome.checkpoint.state.results[0].findings,
        vec!["Home (https://site.test/)"]
    );

    // Off-domain links are never followed, every page is fetched once
    assert_eq!(scraper.calls("https://other.test/"), 0);
    assert_eq!(scraper.total_calls(), 4);

    let saved: ResearchCheckpoint = CheckpointManager::new(dir.path())
        .unwrap()
        .load("site")
        .unwrap()
        .expect("checkpoint written");
    assert_eq!(saved.state.phase, Phase::Completed);
    assert_eq!(saved.succeeded_count(), 4);
    assert!(saved.frontier.is_empty());
}

#[tokio::test]
async fn test_succeeded_urls_are_not_fetched_again() {
    let scraper = shared(
        MockScraper::new()
            .page("https://s.test/1", "one")
            .page("https://s.test/2", "two"),
    );
    let planner = Arc::new(ScriptedPlanner::new(vec![
        (vec!["https://s.test/1"], 0.9),
        (vec!["https://s.test/1", "https://s.test/2", "https://s.test/2"], 0.8),
    ]));
    let ctl = Arc::new(controller(IterationConfig {
        max_iterations: 2,
        ..Default::default()
    }));

    let mut research = ResearchLoop::new(ctl, processor(scraper.clone(), fast_processor_config()), planner);
    let outcome = research.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::MaxIterations);
    assert_eq!(scraper.calls("https://s.test/1"), 1);
    assert_eq!(scraper.calls("https://s.test/2"), 1);
    assert_eq!(outcome.checkpoint.state.results[1].urls_processed, 1);
}

#[tokio::test]
async fn test_planner_errors_count_as_failed_rounds() {
    let scraper = shared(MockScraper::new());
    let planner = Arc::new(ScriptedPlanner::new(Vec::new()));
    let ctl = Arc::new(controller(IterationConfig {
        max_consecutive_failures: 2,
        ..Default::default()
    }));

    let mut research = ResearchLoop::new(ctl, processor(scraper, fast_processor_config()), planner);
    let outcome = research.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::ConsecutiveFailures);
    assert_eq!(outcome.phase(), Phase::Failed);
    assert_eq!(outcome.rounds(), 0);
    assert_eq!(outcome.checkpoint.state.current_iteration, 2);
}

#[tokio::test]
async fn test_assessed_rate_is_clamped() {
    let scraper = shared(MockScraper::new().page("https://s.test/", "x"));
    let planner = Arc::new(ScriptedPlanner::new(vec![
        (vec!["https://s.test/"], 7.5),
        (vec!["https://s.test/missing"], f64::NAN),
    ]));
    let ctl = Arc::new(controller(IterationConfig::default()));

    let mut research = ResearchLoop::new(ctl, processor(scraper, fast_processor_config()), planner);
    let outcome = research.run().await.unwrap();

    let rates: Vec<f64> = outcome
        .checkpoint
        .state
        .results
        .iter()
        .map(|r| r.new_info_rate)
        .collect();
    assert_eq!(rates, vec![1.0, 0.0]);
    assert_eq!(outcome.reason, StopReason::Converged);
}

#[tokio::test(start_paused = true)]
async fn test_round_timeout_counts_as_failure() {
    let scraper = shared(site().delay("https://site.test/", Duration::from_millis(100)));

    let mut config = fast_processor_config();
    config.timeouts.per_iteration_ms = 50;

    let ctl = Arc::new(controller(IterationConfig {
        max_consecutive_failures: 2,
        ..Default::default()
    }));
    let planner = Arc::new(LinkFollowingPlanner::new(
        vec!["https://site.test/".to_string()],
        10,
        true,
    ));
    let mut research = ResearchLoop::new(ctl, processor(scraper, config), planner);
    let outcome = research.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::ConsecutiveFailures);
    assert_eq!(outcome.checkpoint.state.consecutive_failures, 2);
    assert!(!outcome.checkpoint.state.aborted);
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_pauses_and_resume_finishes() {
    let dir = TempDir::new().unwrap();
    let delay = Duration::from_millis(100);
    let scraper = shared(
        site()
            .delay("https://site.test/", delay)
            .delay("https://site.test/a", delay)
            .delay("https://site.test/b", delay)
            .delay("https://site.test/c", delay),
    );

    // Round 1 fits the budget, round 2 runs into it
    let mut limited = fast_processor_config();
    limited.timeouts.total_ms = 150;

    let ctl = Arc::new(controller(IterationConfig::default()));
    let planner = Arc::new(LinkFollowingPlanner::new(
        vec!["https://site.test/".to_string()],
        10,
        true,
    ));
    let mut research = ResearchLoop::new(ctl, processor(scraper.clone(), limited), planner)
        .with_checkpoints(CheckpointManager::new(dir.path()).unwrap(), "paused");
    let outcome = research.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::Aborted);
    assert_eq!(outcome.phase(), Phase::Paused);
    assert_eq!(outcome.rounds(), 1);
    // the cut-short round is not held against the session
    assert_eq!(outcome.checkpoint.state.consecutive_failures, 0);
    assert!(matches!(
        outcome.checkpoint.url_status.get("https://site.test/"),
        Some(UrlStatus::Succeeded)
    ));

    let manager = CheckpointManager::new(dir.path()).unwrap();
    let saved: ResearchCheckpoint = manager.load("paused").unwrap().unwrap();
    assert_eq!(saved.state.phase, Phase::Paused);
    assert!(saved.state.aborted);
    assert_eq!(saved.state.consecutive_failures, 0);
    let mut frontier = saved.frontier.clone();
    frontier.sort();
    assert_eq!(frontier, vec!["https://site.test/a", "https://site.test/b"]);

    // Resume with a fresh planner and no total budget
    let ctl = Arc::new(controller(IterationConfig::default()));
    let planner = Arc::new(LinkFollowingPlanner::new(Vec::new(), 10, true));
    let mut unlimited = fast_processor_config();
    unlimited.timeouts.total_ms = 0;
    let mut research = ResearchLoop::new(ctl, processor(scraper.clone(), unlimited), planner)
        .with_checkpoints(manager, "paused")
        .resume(saved);
    assert!(!research.controller().is_aborted());

    let outcome = research.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::Converged);
    assert_eq!(outcome.phase(), Phase::Completed);
    let iterations: Vec<u32> = outcome
        .checkpoint
        .state
        .results
        .iter()
        .map(|r| r.iteration)
        .collect();
    assert_eq!(iterations, vec![1, 3, 4]);
    assert_eq!(outcome.checkpoint.succeeded_count(), 4);
    assert_eq!(scraper.calls("https://site.test/"), 1);
}
