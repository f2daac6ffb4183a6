//! Failure classification for tagging runs.
//!
//! Every failure in the worker pipeline is either transient (retrying has
//! a plausible chance of success, the queue reschedules it) or permanent
//! (the queue discards the job after recording the failed run). The
//! pipeline maps into this sum at each collaborator boundary; the worker
//! maps out of it into retry vs discard.

use thiserror::Error;

/// Result type for pipeline stages.
pub type TaggingResult<T> = Result<T, TaggingError>;

#[derive(Debug, Error)]
pub enum TaggingError {
    /// Retryable failure: network errors, non-2xx collaborator responses,
    /// subprocess failures, audit store I/O.
    #[error("{0}")]
    Transient(anyhow::Error),

    /// Non-retryable failure: missing required metadata, unusable model
    /// output.
    #[error("{0}")]
    Permanent(anyhow::Error),
}

impl TaggingError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        TaggingError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        TaggingError::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TaggingError::Transient(_))
    }

    /// The underlying cause, as recorded on the failed run.
    pub fn message(&self) -> String {
        match self {
            TaggingError::Transient(err) | TaggingError::Permanent(err) => err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_preserved() {
        let transient = TaggingError::transient(anyhow::anyhow!("connection reset"));
        assert!(transient.is_transient());

        let permanent = TaggingError::permanent(anyhow::anyhow!("metadata missing repoUrl"));
        assert!(!permanent.is_transient());
    }

    #[test]
    fn message_is_the_cause() {
        let err = TaggingError::permanent(anyhow::anyhow!("repository metadata missing repoUrl"));
        assert_eq!(err.message(), "repository metadata missing repoUrl");
        assert_eq!(err.to_string(), "repository metadata missing repoUrl");
    }
}
