//! Queued job identity and payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed prefix for deterministic job ids.
pub const JOB_ID_PREFIX: &str = "tag-";

/// Deterministic job id for a repository. All producers derive the same
/// id for the same repository, which is what the queue deduplicates on.
pub fn job_id_for_repository(repository_id: &str) -> String {
    let digest = Sha256::digest(repository_id.as_bytes());
    format!("{}{}", JOB_ID_PREFIX, hex::encode(digest))
}

/// Provenance of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Event,
    Manual,
    Scheduler,
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobTrigger::Event => write!(f, "event"),
            JobTrigger::Manual => write!(f, "manual"),
            JobTrigger::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// The payload carried by every tagging job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagJobPayload {
    pub repository_id: String,
    pub trigger: JobTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TagJobPayload {
    pub fn new(repository_id: impl Into<String>, trigger: JobTrigger) -> Self {
        Self {
            repository_id: repository_id.into(),
            trigger,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub payload: TagJobPayload,
    /// Delivery attempts started so far (0 until first claim).
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_deterministic_and_prefixed() {
        let a = job_id_for_repository("r1");
        let b = job_id_for_repository("r1");
        let c = job_id_for_repository("r2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(JOB_ID_PREFIX));
        // sha-256 hex digest after the prefix
        assert_eq!(a.len(), JOB_ID_PREFIX.len() + 64);
    }

    #[test]
    fn payload_serializes_with_camel_case_fields() {
        let payload = TagJobPayload::new("r1", JobTrigger::Event).with_reason("repository.updated");
        let json = serde_json::to_string(&payload).unwrap();

        assert!(json.contains(r#""repositoryId":"r1""#));
        assert!(json.contains(r#""trigger":"event""#));
        assert!(json.contains(r#""reason":"repository.updated""#));

        let back: TagJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.repository_id, "r1");
        assert_eq!(back.trigger, JobTrigger::Event);
    }

    #[test]
    fn reason_is_omitted_when_absent() {
        let payload = TagJobPayload::new("r1", JobTrigger::Scheduler);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("reason"));
    }
}
