//! Priority-tiered, domain-aware task queue

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::task::{Priority, Task};
use crate::error::{Error, QueueError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued tasks across all tiers
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("queue.max_size must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
    /// Queued tasks per domain
    pub by_domain: HashMap<String, usize>,
}

struct Tiers<T> {
    lanes: [VecDeque<Task<T>>; 3],
    ids: HashSet<String>,
    by_domain: HashMap<String, usize>,
}

impl<T> Tiers<T> {
    fn new() -> Self {
        Self {
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            ids: HashSet::new(),
            by_domain: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn forget(&mut self, task: &Task<T>) {
        self.ids.remove(&task.id);
        if let Some(count) = self.by_domain.get_mut(&task.domain) {
            *count -= 1;
            if *count == 0 {
                self.by_domain.remove(&task.domain);
            }
        }
    }
}

/// FIFO within a tier, higher tiers first
pub struct ConcurrencyQueue<T> {
    max_size: usize,
    tiers: Mutex<Tiers<T>>,
}

impl<T> std::fmt::Debug for ConcurrencyQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyQueue")
            .field("max_size", &self.max_size)
            .field("size", &self.size())
            .finish()
    }
}

impl<T> ConcurrencyQueue<T> {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_size: config.max_size,
            tiers: Mutex::new(Tiers::new()),
        })
    }

    fn tiers(&self) -> MutexGuard<'_, Tiers<T>> {
        self.tiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a task to its tier and return its id
    pub fn enqueue(&self, task: Task<T>) -> std::result::Result<String, QueueError> {
        let mut tiers = self.tiers();
        if tiers.len() >= self.max_size {
            return Err(QueueError::Full {
                max_size: self.max_size,
            });
        }
        if !tiers.ids.insert(task.id.clone()) {
            return Err(QueueError::Duplicate(task.id));
        }

        *tiers.by_domain.entry(task.domain.clone()).or_insert(0) += 1;
        let id = task.id.clone();
        tiers.lanes[task.priority.index()].push_back(task);
        Ok(id)
    }

    /// Pop the oldest task of the highest non-empty tier
    pub fn dequeue(&self) -> Option<Task<T>> {
        let mut tiers = self.tiers();
        let task = tiers.lanes.iter_mut().find_map(VecDeque::pop_front)?;
        tiers.forget(&task);
        Some(task)
    }

    /// Remove a queued task by id
    pub fn remove(&self, id: &str) -> bool {
        let mut tiers = self.tiers();
        if !tiers.ids.contains(id) {
            return false;
        }

        for lane in 0..tiers.lanes.len() {
            if let Some(pos) = tiers.lanes[lane].iter().position(|t| t.id == id) {
                if let Some(task) = tiers.lanes[lane].remove(pos) {
                    tiers.forget(&task);
                    return true;
                }
            }
        }
        false
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tiers().ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn size(&self) -> usize {
        self.tiers().len()
    }

    pub fn size_of(&self, priority: Priority) -> usize {
        self.tiers().lanes[priority.index()].len()
    }

    /// Number of queued tasks targeting `domain`
    pub fn domain_count(&self, domain: &str) -> usize {
        self.tiers().by_domain.get(domain).copied().unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut tiers = self.tiers();
        let dropped = tiers.len();
        *tiers = Tiers::new();
        if dropped > 0 {
            tracing::debug!(dropped, "Cleared task queue");
        }
    }

    pub fn stats(&self) -> QueueStats {
        let tiers = self.tiers();
        QueueStats {
            high: tiers.lanes[Priority::High.index()].len(),
            normal: tiers.lanes[Priority::Normal.index()].len(),
            low: tiers.lanes[Priority::Low.index()].len(),
            total: tiers.len(),
            by_domain: tiers.by_domain.clone(),
        }
    }
}
