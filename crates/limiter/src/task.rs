//! Task runner
//!
//! A task owns one [`Reservation`] for its whole lifetime. The reservation is
//! moved into [`TaskRunner::run`], so it is returned to the pool when the run
//! finishes, fails, panics, or is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::slot_pool::Reservation;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Built by the dispatcher, not started yet
    Created,
    /// Reservation confirmed by the running task
    SlotReserved,
    /// Work in progress
    Running,
    /// Work finished, slot released
    Completed,
    /// Work returned an error, slot released
    Failed,
}

impl TaskState {
    /// Whether the task has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Work step errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    /// The work step reported a failure
    #[error("work failed: {0}")]
    Failed(String),
}

/// The body executed while a task holds its slot
#[async_trait]
pub trait Work: Send + Sync {
    /// Perform the work for one task
    async fn perform(&self, task_id: Uuid, duration: Duration) -> Result<(), WorkError>;
}

/// Placeholder work: sleeps for the task's duration
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepWork;

#[async_trait]
impl Work for SleepWork {
    async fn perform(&self, _task_id: Uuid, duration: Duration) -> Result<(), WorkError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

/// Result of a finished task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    /// Requested work duration
    pub duration: Duration,
    /// Terminal state
    pub state: TaskState,
    /// Every state the task passed through, in order, ending with `state`
    pub transitions: Vec<TaskState>,
    /// When the task confirmed its reservation
    pub started_at: Instant,
    /// Time from start until the slot was released
    pub elapsed: Duration,
    /// Error message for failed tasks
    pub error: Option<String>,
}

/// A single admitted task bound to its reservation
#[derive(Debug)]
pub struct TaskRunner {
    id: Uuid,
    duration: Duration,
    reservation: Reservation,
    transitions: Vec<TaskState>,
}

impl TaskRunner {
    /// Bind a new task to an already acquired reservation
    pub fn new(duration: Duration, reservation: Reservation) -> Self {
        Self {
            id: Uuid::now_v7(),
            duration,
            reservation,
            transitions: vec![TaskState::Created],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Current state; `Created` until the task is run
    pub fn state(&self) -> TaskState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(TaskState::Created)
    }

    /// Run the task to completion and release its slot
    pub async fn run(mut self, work: &dyn Work) -> TaskOutcome {
        let started_at = Instant::now();
        self.transition(TaskState::SlotReserved);

        self.transition(TaskState::Running);
        let result = work.perform(self.id, self.duration).await;

        self.reservation.release();
        let elapsed = started_at.elapsed();

        let (state, error) = match result {
            Ok(()) => {
                debug!(
                    task_id = %self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                (TaskState::Completed, None)
            }
            Err(e) => {
                warn!(task_id = %self.id, error = %e, "Task failed");
                (TaskState::Failed, Some(e.to_string()))
            }
        };
        // `self` is partially moved, so push directly
        trace!(task_id = %self.id, to = ?state, "Task state change");
        self.transitions.push(state);

        TaskOutcome {
            task_id: self.id,
            duration: self.duration,
            state,
            transitions: self.transitions,
            started_at,
            elapsed,
            error,
        }
    }

    fn transition(&mut self, next: TaskState) {
        trace!(task_id = %self.id, from = ?self.state(), to = ?next, "Task state change");
        self.transitions.push(next);
    }
}
