//! Session checkpoints on local disk
//!
//! A [`ResearchCheckpoint`] holds the iteration controller state, the planner
//! frontier and the last known outcome of every URL the session touched. On
//! resume, URLs marked [`UrlStatus::Succeeded`] are never fetched again.
//!
//! Files live at `<dir>/<name>.checkpoint.json` and are replaced atomically
//! (write to a sibling temp file, then rename).
//!
//! ```no_run
//! use tansaek::iteration::IterationState;
//! use tansaek::storage::checkpoint::{CheckpointManager, ResearchCheckpoint};
//!
//! # fn example() -> tansaek::error::Result<()> {
//! let store = CheckpointManager::new(std::path::Path::new("./checkpoints"))?;
//! store.save("rust-async", &ResearchCheckpoint::new(IterationState::new("session-1")))?;
//!
//! if let Some(saved) = store.load::<ResearchCheckpoint>("rust-async")? {
//!     println!("resume from iteration {}", saved.state.current_iteration);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use crate::crawler::UrlProcessResult;
use crate::error::{Error, Result};
use crate::iteration::IterationState;

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Where checkpoints are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./checkpoints"),
        }
    }
}

/// Outcome of one URL within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UrlStatus {
    Succeeded,
    Failed {
        /// Primary attempts summed over every round that tried this URL
        attempts: u32,
        error: String,
    },
}

impl UrlStatus {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Everything needed to resume a research session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchCheckpoint {
    pub state: IterationState,
    pub url_status: BTreeMap<String, UrlStatus>,
    /// URLs the planner had queued but not yet handed out
    #[serde(default)]
    pub frontier: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl ResearchCheckpoint {
    pub fn new(state: IterationState) -> Self {
        Self {
            state,
            url_status: BTreeMap::new(),
            frontier: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    /// Fold one processed URL into the status map
    ///
    /// A success is final; failures accumulate attempts.
    pub fn record(&mut self, result: &UrlProcessResult) {
        if result.success {
            self.url_status
                .insert(result.url.clone(), UrlStatus::Succeeded);
            return;
        }

        let error = result.error.clone().unwrap_or_default();
        match self.url_status.get_mut(&result.url) {
            Some(UrlStatus::Succeeded) => {}
            Some(UrlStatus::Failed { attempts, error: last }) => {
                *attempts += result.attempts;
                *last = error;
            }
            None => {
                self.url_status.insert(
                    result.url.clone(),
                    UrlStatus::Failed {
                        attempts: result.attempts,
                        error,
                    },
                );
            }
        }
    }

    pub fn is_succeeded(&self, url: &str) -> bool {
        self.url_status.get(url).is_some_and(UrlStatus::is_succeeded)
    }

    pub fn succeeded_count(&self) -> usize {
        self.url_status.values().filter(|s| s.is_succeeded()).count()
    }

    pub fn failed_urls(&self) -> Vec<String> {
        self.url_status
            .iter()
            .filter(|(_, status)| !status.is_succeeded())
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Reads and writes checkpoint files under one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Open `dir`, creating it when missing
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::checkpoint(dir.display().to_string(), format!("cannot create directory: {e}"))
        })?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn from_config(config: &CheckpointConfig) -> Result<Self> {
        Self::new(&config.dir)
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}{CHECKPOINT_SUFFIX}")))
    }

    /// Write `state` under `name`, replacing any previous checkpoint
    pub fn save<T: Serialize>(&self, name: &str, state: &T) -> Result<PathBuf> {
        let target = self.file_for(name)?;
        let staging = target.with_extension("json.tmp");

        let writer = fs::File::create(&staging)
            .map(BufWriter::new)
            .map_err(|e| Error::checkpoint(name, format!("cannot stage write: {e}")))?;
        serde_json::to_writer_pretty(writer, state)?;
        fs::rename(&staging, &target)
            .map_err(|e| Error::checkpoint(name, format!("cannot replace file: {e}")))?;

        tracing::debug!(session = name, path = %target.display(), "Wrote checkpoint");
        Ok(target)
    }

    /// Read the checkpoint called `name`; `Ok(None)` if it was never saved
    pub fn load<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>> {
        let source = self.file_for(name)?;
        let reader = match fs::File::open(&source) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::checkpoint(name, format!("cannot open: {e}"))),
        };

        let state = serde_json::from_reader(reader)
            .map_err(|e| Error::checkpoint(name, format!("corrupt checkpoint: {e}")))?;
        tracing::debug!(session = name, path = %source.display(), "Read checkpoint");
        Ok(Some(state))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.file_for(name).is_ok_and(|path| path.is_file())
    }

    /// Remove a checkpoint; removing one that does not exist is not an error
    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.file_for(name)?) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Saved session names in lexical order
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|file| file.strip_suffix(CHECKPOINT_SUFFIX))
                    .map(str::to_owned)
            })
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}

/// Session names become file names
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::checkpoint(name, "name may only contain [A-Za-z0-9._-]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(url: &str, success: bool, attempts: u32) -> UrlProcessResult {
        UrlProcessResult {
            url: url.to_string(),
            success,
            content: success.then(|| "body".to_string()),
            title: None,
            error: (!success).then(|| "HTTP 503".to_string()),
            attempts,
            processing_time_ms: 5,
            used_cache: false,
            fallback: None,
        }
    }

    #[test]
    fn test_record_url_status() {
        let mut checkpoint = ResearchCheckpoint::new(IterationState::new("s"));
        checkpoint.record(&result("https://a.test/", false, 3));
        checkpoint.record(&result("https://a.test/", false, 2));
        checkpoint.record(&result("https://b.test/", true, 1));

        assert_eq!(
            checkpoint.url_status["https://a.test/"],
            UrlStatus::Failed {
                attempts: 5,
                error: "HTTP 503".to_string()
            }
        );
        assert!(checkpoint.is_succeeded("https://b.test/"));
        assert_eq!(checkpoint.failed_urls(), vec!["https://a.test/".to_string()]);

        // A later failure does not undo a success.
        checkpoint.record(&result("https://b.test/", false, 1));
        assert!(checkpoint.is_succeeded("https://b.test/"));
        assert_eq!(checkpoint.succeeded_count(), 1);
    }

    fn store() -> (TempDir, CheckpointManager) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_saved_checkpoint_reads_back_identically() {
        let (_dir, store) = store();
        let mut checkpoint = ResearchCheckpoint::new(IterationState::new("session-1"));
        checkpoint.record(&result("https://a.test/", true, 1));
        checkpoint.frontier.push("https://b.test/".to_string());

        let path = store.save("rust-async", &checkpoint).unwrap();
        assert!(path.ends_with("rust-async.checkpoint.json"));
        assert!(store.exists("rust-async"));

        let restored: ResearchCheckpoint = store.load("rust-async").unwrap().unwrap();
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_unknown_session_loads_as_none() {
        let (_dir, store) = store();
        assert!(store.load::<ResearchCheckpoint>("never-saved").unwrap().is_none());
        assert!(!store.exists("never-saved"));
    }

    #[test]
    fn test_garbage_file_is_reported_as_corrupt() {
        let (dir, store) = store();
        fs::write(dir.path().join("broken.checkpoint.json"), "{ not json").unwrap();

        match store.load::<ResearchCheckpoint>("broken") {
            Err(Error::Checkpoint { name, reason }) => {
                assert_eq!(name, "broken");
                assert!(reason.starts_with("corrupt"));
            }
            other => panic!("expected a checkpoint error, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store
            .save("old", &ResearchCheckpoint::new(IterationState::new("s")))
            .unwrap();

        store.delete("old").unwrap();
        assert!(!store.exists("old"));
        store.delete("old").unwrap();
    }

    #[test]
    fn test_list_ignores_unrelated_files() {
        let (dir, store) = store();
        for name in ["beta", "alpha"] {
            store
                .save(name, &ResearchCheckpoint::new(IterationState::new(name)))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_path_like_names_are_rejected() {
        let (_dir, store) = store();
        let checkpoint = ResearchCheckpoint::new(IterationState::new("s"));

        assert!(store.save("../escape", &checkpoint).is_err());
        assert!(store.save("", &checkpoint).is_err());
        assert!(store.load::<ResearchCheckpoint>("a/b").is_err());
    }
}
