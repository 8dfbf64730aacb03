//! Execution scheduler - determines which tasks to run next

use crate::core::{Run, TaskState};
use chrono::Utc;
use std::collections::VecDeque;
use std::str::FromStr;

/// Strategy for scheduling task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute tasks in dependency order, one at a time
    Sequential,

    /// Execute all ready tasks in parallel
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent tasks)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Maximum number of tasks running at once
    pub fn concurrency_limit(&self) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(n) => (*n).max(1),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(SchedulingStrategy::Sequential),
            "parallel" => Ok(SchedulingStrategy::Parallel),
            other => other
                .strip_prefix("limited:")
                .and_then(|n| n.parse().ok())
                .map(SchedulingStrategy::LimitedParallel)
                .ok_or_else(|| {
                    format!(
                        "unknown strategy '{}' (expected sequential, parallel or limited:N)",
                        other
                    )
                }),
        }
    }
}

/// Ready queue plus promotion rules
///
/// Tasks are promoted from Pending to Ready once every predecessor has
/// Succeeded. After `halt` nothing further is promoted.
#[derive(Debug)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    ready_queue: VecDeque<String>,
    halted: bool,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self {
            strategy,
            ready_queue: VecDeque::new(),
            halted: false,
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Move every newly eligible Pending task to Ready; returns their names
    pub fn promote(&mut self, run: &mut Run) -> Vec<String> {
        if self.halted {
            return Vec::new();
        }

        // `run.tasks` is in topological order, so the queue follows it too
        let eligible: Vec<String> = run
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Pending))
            .filter(|t| run.predecessors_succeeded(&t.name))
            .map(|t| t.name.clone())
            .collect();

        let now = Utc::now();
        for name in &eligible {
            if let Some(task) = run.task_mut(name) {
                task.state = TaskState::Ready { since: now };
            }
            self.ready_queue.push_back(name.clone());
        }
        eligible
    }

    /// Take as many Ready tasks as the concurrency limit allows
    pub fn next_batch(&mut self, running: usize) -> Vec<String> {
        if self.halted {
            return Vec::new();
        }
        let free = self.strategy.concurrency_limit().saturating_sub(running);
        let take = free.min(self.ready_queue.len());
        self.ready_queue.drain(..take).collect()
    }

    /// Stop promoting and launching
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Drop everything still queued, returning it
    pub fn drain_queue(&mut self) -> Vec<String> {
        self.ready_queue.drain(..).collect()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready_queue.is_empty()
    }
}
