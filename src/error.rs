use crate::{job::JobStatus, priority::PriorityError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobkeeperError {
    #[error("Invalid payload for job type '{job_type}': {message}")]
    InvalidPayload { job_type: String, message: String },

    #[error("No handler registered for job type '{job_type}'")]
    NoHandler { job_type: String },

    #[error("Job timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Job {id} exceeded max retries after {attempts} attempts")]
    MaxRetriesExceeded { id: String, attempts: u32 },

    #[error("Cannot {operation} job {id} in status '{status}'")]
    InvalidState {
        id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Invalid job options: {message}")]
    InvalidOptions { message: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Priority error: {0}")]
    Priority(#[from] PriorityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobkeeperError {
    /// Convenience constructor for handler bodies returning a plain message.
    pub fn handler(message: impl Into<String>) -> Self {
        JobkeeperError::Handler {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(id: impl ToString) -> Self {
        JobkeeperError::JobNotFound { id: id.to_string() }
    }
}

impl From<toml::de::Error> for JobkeeperError {
    fn from(err: toml::de::Error) -> Self {
        JobkeeperError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for JobkeeperError {
    fn from(err: toml::ser::Error) -> Self {
        JobkeeperError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for JobkeeperError {
    fn from(err: redis::RedisError) -> Self {
        JobkeeperError::Store {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let invalid = JobkeeperError::InvalidPayload {
            job_type: "email_notification".to_string(),
            message: "missing field 'body'".to_string(),
        };
        assert_eq!(
            invalid.to_string(),
            "Invalid payload for job type 'email_notification': missing field 'body'"
        );

        let state = JobkeeperError::InvalidState {
            id: "abc".to_string(),
            status: JobStatus::Completed,
            operation: "cancel",
        };
        assert_eq!(state.to_string(), "Cannot cancel job abc in status 'completed'");

        let not_found = JobkeeperError::not_found("test-id");
        assert_eq!(not_found.to_string(), "Job not found: test-id");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: JobkeeperError = json_error.unwrap_err().into();
        assert!(matches!(error, JobkeeperError::Serialization(_)));
    }

    #[test]
    fn test_timeout_message() {
        let error = JobkeeperError::Timeout {
            timeout: Duration::from_secs(30),
        };
        assert_eq!(error.to_string(), "Job timeout after 30s");
    }
}
