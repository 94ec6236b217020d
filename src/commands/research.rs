use anyhow::{bail, Context, Result};
use std::sync::Arc;

use tansaek::config::EngineConfig;
use tansaek::crawler::url::validators;
use tansaek::events::EventBus;
use tansaek::iteration::{
    IterationController, LinkFollowingPlanner, ResearchLoop, ResearchOutcome,
};
use tansaek::storage::{CheckpointManager, ResearchCheckpoint};

use super::{build_processor, spawn_event_logger};

/// Arguments of the `research` command
pub struct ResearchParams {
    pub seeds: Vec<String>,
    pub session: Option<String>,
    pub max_urls_per_round: usize,
    pub all_domains: bool,
}

/// Start a new research session from seed URLs
pub async fn research(config: &EngineConfig, params: ResearchParams) -> Result<()> {
    if params.seeds.is_empty() {
        bail!("At least one --seed URL is required");
    }
    for seed in &params.seeds {
        if let Err(e) = validators::validate_url(seed) {
            bail!(e);
        }
    }

    let session = params
        .session
        .unwrap_or_else(|| format!("research-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));
    let checkpoints = checkpoint_manager(config)?;
    if let Some(manager) = &checkpoints {
        if manager.exists(&session) {
            bail!("Session '{session}' already exists; use `resume --session {session}`");
        }
    }

    let planner = LinkFollowingPlanner::new(
        params.seeds,
        params.max_urls_per_round,
        !params.all_domains,
    );

    println!("Starting research session: {session}");
    let outcome = run(config, &session, checkpoints, Arc::new(planner), None).await?;
    print_outcome(&session, &outcome);
    Ok(())
}

/// Continue a checkpointed session
pub async fn resume(config: &EngineConfig, session: String, max_urls_per_round: usize, all_domains: bool) -> Result<()> {
    let Some(manager) = checkpoint_manager(config)? else {
        bail!("Checkpoints are disabled in the configuration");
    };
    let checkpoint: ResearchCheckpoint = manager
        .load(&session)?
        .with_context(|| format!("No checkpoint named '{session}' in {}", manager.checkpoint_dir().display()))?;

    if checkpoint.state.phase.is_terminal() {
        println!(
            "Session '{session}' already finished ({}), nothing to resume",
            checkpoint.state.phase
        );
        return Ok(());
    }

    let planner = LinkFollowingPlanner::new(Vec::new(), max_urls_per_round, !all_domains);
    println!(
        "Resuming research session: {session} (iteration {}, {} URLs done)",
        checkpoint.state.current_iteration,
        checkpoint.succeeded_count()
    );
    let outcome = run(config, &session, Some(manager), Arc::new(planner), Some(checkpoint)).await?;
    print_outcome(&session, &outcome);
    Ok(())
}

fn checkpoint_manager(config: &EngineConfig) -> Result<Option<CheckpointManager>> {
    if !config.checkpoint.enabled {
        return Ok(None);
    }
    Ok(Some(CheckpointManager::from_config(&config.checkpoint)?))
}

async fn run(
    config: &EngineConfig,
    session: &str,
    checkpoints: Option<CheckpointManager>,
    planner: Arc<LinkFollowingPlanner>,
    resume_from: Option<ResearchCheckpoint>,
) -> Result<ResearchOutcome> {
    let events = EventBus::default();
    spawn_event_logger(&events);

    let processor = build_processor(config, events.clone())?;
    let controller = Arc::new(
        IterationController::with_session_id(config.iteration.clone(), session)?
            .with_event_bus(events),
    );

    // Ctrl-C stops new rounds; the current round finishes and is checkpointed.
    let abort_handle = Arc::clone(&controller);
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current round");
            abort_handle.abort();
        }
    });

    let mut research = ResearchLoop::new(controller, processor, planner);
    if let Some(manager) = checkpoints {
        research = research.with_checkpoints(manager, session);
    }
    if let Some(checkpoint) = resume_from {
        research = research.resume(checkpoint);
    }

    let outcome = research.run().await;
    signal_task.abort();
    Ok(outcome?)
}

fn print_outcome(session: &str, outcome: &ResearchOutcome) {
    let state = &outcome.checkpoint.state;
    let rates: Vec<f64> = state.results.iter().map(|r| r.new_info_rate).collect();
    let average = if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    };

    println!();
    println!("Research Session Summary");
    println!("========================");
    println!("Session: {session}");
    println!("Stop reason: {}", outcome.reason);
    println!("Final phase: {}", outcome.phase());
    println!("Rounds completed: {}", outcome.rounds());
    println!("URLs succeeded: {}", outcome.checkpoint.succeeded_count());
    println!("URLs failed: {}", outcome.checkpoint.failed_urls().len());
    println!("Average new-info rate: {average:.2}");

    for record in &state.results {
        println!(
            "  #{:<3} {:>3}/{:<3} ok  rate {:.2}  {} ms",
            record.iteration,
            record.urls_succeeded,
            record.urls_processed,
            record.new_info_rate,
            record.duration_ms
        );
        for finding in record.findings.iter().take(5) {
            println!("        - {finding}");
        }
    }
}
