use anyhow::Result;

use tansaek::config::EngineConfig;
use tansaek::storage::{CheckpointManager, ResearchCheckpoint};

/// Summarize saved research sessions
pub fn stats(config: &EngineConfig, session: Option<String>) -> Result<()> {
    let manager = CheckpointManager::from_config(&config.checkpoint)?;
    let names = match session {
        Some(name) => vec![name],
        None => manager.list()?,
    };

    println!("Research Sessions");
    println!("=================");
    println!("Directory: {}", manager.checkpoint_dir().display());

    if names.is_empty() {
        println!("No saved sessions.");
        return Ok(());
    }

    for name in names {
        let Some(checkpoint) = manager.load::<ResearchCheckpoint>(&name)? else {
            println!("\n{name}: not found");
            continue;
        };
        let state = &checkpoint.state;
        let total = checkpoint.url_status.len();
        let succeeded = checkpoint.succeeded_count();

        println!("\n{name}");
        println!("  Phase: {}", state.phase);
        println!("  Iteration: {}", state.current_iteration);
        println!("  Rounds recorded: {}", state.results.len());
        println!("  Consecutive failures: {}", state.consecutive_failures);
        println!(
            "  URLs: {total} ({succeeded} succeeded, {} failed, {:.1}% success)",
            total - succeeded,
            if total > 0 {
                succeeded as f64 / total as f64 * 100.0
            } else {
                0.0
            }
        );
        println!("  Frontier: {} pending", checkpoint.frontier.len());
        println!("  Saved at: {}", checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}
