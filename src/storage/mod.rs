//! Persistence for resumable sessions
//!
//! The engine keeps no long-term knowledge store; the only thing written to
//! disk is the checkpoint of a research session.

pub mod checkpoint;

pub use checkpoint::{CheckpointConfig, CheckpointManager, ResearchCheckpoint, UrlStatus};
