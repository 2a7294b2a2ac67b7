//! Error types for stream orchestration

use crate::diagnostics::DiagnosisResult;
use crate::model::StreamStatus;
use pmoicecast::IcecastError;
use std::time::Duration;

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Bad input; nothing was changed
    #[error("Invalid stream configuration: {0}")]
    Validation(String),

    #[error("Stream not found: {0}")]
    NotFound(String),

    /// A record with the derived id already exists
    #[error("Stream {id} already exists ({status})")]
    DuplicateStreamId { id: String, status: StreamStatus },

    /// The operation needs a stopped stream
    #[error("Stream {id} is {status}; stop it first")]
    Busy { id: String, status: StreamStatus },

    /// No free source slot on the broadcast server
    #[error("Capacity exceeded: {active} active stream(s) for a limit of {limit}")]
    CapacityExceeded { limit: u32, active: u32 },

    /// The worker could not be launched
    #[error("Failed to spawn worker for {id}: {reason}")]
    ProcessSpawnFailure {
        id: String,
        reason: String,
        diagnosis: Box<DiagnosisResult>,
    },

    /// The worker exited during the confirmation window
    #[error("Worker for {id} exited{}: {}", exit_suffix(.exit_code), .diagnosis.title)]
    ProcessCrashed {
        id: String,
        exit_code: Option<i64>,
        stderr: String,
        diagnosis: Box<DiagnosisResult>,
    },

    /// The worker did not exit before the stop deadline
    #[error("Worker for {id} did not stop within {}ms", .timeout.as_millis())]
    VerificationTimeout { id: String, timeout: Duration },

    /// A newer operation on the same stream superseded this one
    #[error("{operation} of {id} was cancelled by a newer request")]
    Cancelled { id: String, operation: &'static str },

    #[error(transparent)]
    Icecast(#[from] IcecastError),

    /// The registry file is unreadable or corrupt
    #[error("Stream registry error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Validation(_) => "VALIDATION_ERROR",
            StreamError::NotFound(_) => "NOT_FOUND",
            StreamError::DuplicateStreamId { .. } => "DUPLICATE_STREAM_ID",
            StreamError::Busy { .. } => "STREAM_BUSY",
            StreamError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            StreamError::ProcessSpawnFailure { .. } => "PROCESS_SPAWN_FAILURE",
            StreamError::ProcessCrashed { .. } => "PROCESS_CRASHED",
            StreamError::VerificationTimeout { .. } => "VERIFICATION_TIMEOUT",
            StreamError::Cancelled { .. } => "CANCELLED",
            StreamError::Icecast(e) => e.code(),
            StreamError::Persistence(_) => "PERSISTENCE_ERROR",
            StreamError::Io(_) => "IO_ERROR",
        }
    }

    /// Diagnosis attached to process-level failures
    pub fn diagnosis(&self) -> Option<&DiagnosisResult> {
        match self {
            StreamError::ProcessSpawnFailure { diagnosis, .. }
            | StreamError::ProcessCrashed { diagnosis, .. } => Some(diagnosis),
            _ => None,
        }
    }
}

fn exit_suffix(code: &Option<i64>) -> String {
    match code {
        Some(c) => format!(" with code {}", c),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message() {
        let err = StreamError::CapacityExceeded { limit: 1, active: 1 };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: 1 active stream(s) for a limit of 1"
        );
        assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    }

    #[test]
    fn test_icecast_code_passes_through() {
        let err: StreamError = IcecastError::InstallationNotFound { searched: vec![] }.into();
        assert_eq!(err.code(), "INSTALLATION_NOT_FOUND");
        assert!(err.diagnosis().is_none());
    }
}
