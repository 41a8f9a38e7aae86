//! Status of singleton background work
//!
//! At most one task of each kind runs at a time. Starting one is a
//! compare-and-swap on the registry entry; the returned guard records the
//! outcome when the work finishes, or marks it failed if the task is dropped
//! mid-way.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    GoldenImage,
    PoolRefill,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::GoldenImage => "golden_image",
            TaskKind::PoolRefill => "pool_refill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: String,
    },
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running { .. })
    }

    fn started_at(&self) -> DateTime<Utc> {
        match self {
            TaskState::Running { started_at }
            | TaskState::Succeeded { started_at, .. }
            | TaskState::Failed { started_at, .. } => *started_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub kind: TaskKind,
    #[serde(flatten)]
    pub state: TaskState,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskKind, TaskState>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `kind` running unless it already is
    pub fn try_start(self: &Arc<Self>, kind: TaskKind) -> Option<TaskGuard> {
        let running = TaskState::Running {
            started_at: Utc::now(),
        };

        match self.tasks.entry(kind) {
            Entry::Occupied(entry) if entry.get().is_running() => {
                debug!(task = kind.as_str(), "Task already running");
                return None;
            }
            Entry::Occupied(mut entry) => {
                entry.insert(running);
            }
            Entry::Vacant(entry) => {
                entry.insert(running);
            }
        }

        Some(TaskGuard {
            registry: Arc::clone(self),
            kind,
            finished: false,
        })
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.tasks
            .get(&kind)
            .map(|state| state.is_running())
            .unwrap_or(false)
    }

    pub fn state(&self, kind: TaskKind) -> Option<TaskState> {
        self.tasks.get(&kind).map(|state| state.clone())
    }

    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| TaskStatus {
                kind: *entry.key(),
                state: entry.value().clone(),
            })
            .collect();
        statuses.sort_by_key(|s| s.kind.as_str());
        statuses
    }

    fn finish(&self, kind: TaskKind, error: Option<String>) {
        if let Some(mut state) = self.tasks.get_mut(&kind) {
            let started_at = state.started_at();
            let finished_at = Utc::now();
            *state = match error {
                None => TaskState::Succeeded {
                    started_at,
                    finished_at,
                },
                Some(error) => TaskState::Failed {
                    started_at,
                    finished_at,
                    error,
                },
            };
        }
    }
}

/// Held by the running task; releases the slot when dropped
pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    kind: TaskKind,
    finished: bool,
}

impl TaskGuard {
    pub fn succeed(mut self) {
        self.finished = true;
        self.registry.finish(self.kind, None);
    }

    pub fn fail(mut self, error: impl ToString) {
        self.finished = true;
        self.registry.finish(self.kind, Some(error.to_string()));
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(task = self.kind.as_str(), "Task ended without reporting an outcome");
            self.registry
                .finish(self.kind, Some("task aborted".to_string()));
        }
    }
}
