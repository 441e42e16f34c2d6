//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// A non-idempotent job was re-added with an id that is already taken.
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// Malformed cron expression or timezone.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No registered worker has a free slot.
    #[error("No worker capacity available")]
    NoCapacityAvailable,

    /// Lock could not be acquired before the deadline.
    #[error("Timed out acquiring lock {key} after {waited_ms} ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Remove/release on an unknown id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The coordination store could not be reached.
    #[error("Coordination backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The coordination store answered with an error.
    #[error("Coordination backend error: {0}")]
    Backend(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A persisted record could not be upgraded to the current schema.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if a dispatcher should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::NoCapacityAvailable
                | JobError::LockTimeout { .. }
                | JobError::BackendUnavailable(_)
        )
    }

    /// Returns true for mistakes made by the producer that added the job.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, JobError::DuplicateJob(_) | JobError::InvalidSchedule(_))
    }

    /// Returns true when the coordination store is unreachable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, JobError::BackendUnavailable(_))
    }
}

impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            JobError::BackendUnavailable(err.to_string())
        } else {
            JobError::Backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for JobError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        JobError::BackendUnavailable(err.to_string())
    }
}

impl From<conveyor_core::ConveyorError> for JobError {
    fn from(err: conveyor_core::ConveyorError) -> Self {
        match err {
            conveyor_core::ConveyorError::Configuration(msg) => JobError::Configuration(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_capacity() {
        assert!(JobError::NoCapacityAvailable.is_retryable());
    }

    #[test]
    fn test_is_retryable_lock_timeout() {
        let err = JobError::LockTimeout {
            key: "migration".into(),
            waited_ms: 3000,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_backend_unavailable() {
        let err = JobError::BackendUnavailable("connection refused".into());
        assert!(err.is_retryable());
        assert!(err.is_backend_unavailable());
    }

    #[test]
    fn test_is_not_retryable_caller_errors() {
        assert!(!JobError::DuplicateJob("job-1".into()).is_retryable());
        assert!(!JobError::InvalidSchedule("* *".into()).is_retryable());
    }

    #[test]
    fn test_caller_errors() {
        assert!(JobError::DuplicateJob("job-1".into()).is_caller_error());
        assert!(JobError::InvalidSchedule("bad".into()).is_caller_error());
        assert!(!JobError::JobNotFound("job-1".into()).is_caller_error());
        assert!(!JobError::NoCapacityAvailable.is_caller_error());
    }

    #[test]
    fn test_io_redis_error_is_backend_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = JobError::from(redis::RedisError::from(io));
        assert!(err.is_backend_unavailable());
    }

    #[test]
    fn test_response_redis_error_is_backend_error() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        let err = JobError::from(redis_err);
        assert!(matches!(err, JobError::Backend(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_conveyor_configuration_error() {
        let err = JobError::from(conveyor_core::ConveyorError::configuration("no url"));
        match err {
            JobError::Configuration(msg) => assert_eq!(msg, "no url"),
            other => panic!("Expected Configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_display_lock_timeout() {
        let err = JobError::LockTimeout {
            key: "scheduler".into(),
            waited_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("scheduler") && msg.contains("250"));
    }
}
