//! Queue lifecycle transitions.
//!
//! These events are facts about queue state, not commands. They are
//! broadcast in-process (subscribable via [`super::JobQueue::subscribe`])
//! and mirrored onto the events channel for operators.

use serde::{Deserialize, Serialize};

use super::JobTrigger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueTransition {
    /// A job entered the queue.
    Waiting {
        job_id: String,
        repository_id: String,
        trigger: JobTrigger,
    },

    /// A worker claimed the job.
    Active { job_id: String, attempt: u32 },

    /// The job ran to completion.
    Completed { job_id: String },

    /// The job failed; `will_retry` distinguishes a scheduled retry from a
    /// discard.
    Failed {
        job_id: String,
        reason: String,
        will_retry: bool,
    },
}

impl QueueTransition {
    /// Short transition name, used as the event-name suffix on the bus.
    pub fn name(&self) -> &'static str {
        match self {
            QueueTransition::Waiting { .. } => "waiting",
            QueueTransition::Active { .. } => "active",
            QueueTransition::Completed { .. } => "completed",
            QueueTransition::Failed { .. } => "failed",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            QueueTransition::Waiting { job_id, .. }
            | QueueTransition::Active { job_id, .. }
            | QueueTransition::Completed { job_id }
            | QueueTransition::Failed { job_id, .. } => job_id,
        }
    }
}
