//! Error types for the broadcast server controller

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for broadcast server operations
pub type Result<T> = std::result::Result<T, IcecastError>;

/// Errors raised while driving the Icecast server
#[derive(Debug, thiserror::Error)]
pub enum IcecastError {
    /// No installation root passed the detection checks
    #[error("Icecast installation not found (searched: {})", display_paths(.searched))]
    InstallationNotFound { searched: Vec<PathBuf> },

    /// The configuration file cannot be read or parsed
    #[error("Cannot parse {}: {reason}", .path.display())]
    ConfigParse { path: PathBuf, reason: String },

    /// The configuration parsed but fails blocking checks
    #[error("Icecast configuration is invalid: {}", .errors.join("; "))]
    ConfigInvalid { errors: Vec<String> },

    /// Non-blocking configuration findings
    #[error("Icecast configuration warnings: {}", .warnings.join("; "))]
    ConfigWarning { warnings: Vec<String> },

    /// The server port is held by a process that is not Icecast
    #[error("Port {port} is already in use{}", holder_suffix(.holder))]
    PortConflict { port: u16, holder: Option<String> },

    /// The observed state did not reach the target before the deadline
    #[error("Icecast {operation} was not confirmed within {}ms", .timeout.as_millis())]
    VerificationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A newer lifecycle request superseded this one
    #[error("Icecast {operation} was cancelled by a newer request")]
    Cancelled { operation: &'static str },

    /// Spawning the server process failed
    #[error("Failed to launch Icecast: {0}")]
    Launch(#[source] std::io::Error),

    /// The service manager refused the request
    #[error("Service manager error: {0}")]
    ServiceControl(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IcecastError {
    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            IcecastError::InstallationNotFound { .. } => "INSTALLATION_NOT_FOUND",
            IcecastError::ConfigParse { .. } => "CONFIG_PARSE",
            IcecastError::ConfigInvalid { .. } => "CONFIG_INVALID",
            IcecastError::ConfigWarning { .. } => "CONFIG_WARNING",
            IcecastError::PortConflict { .. } => "PORT_CONFLICT",
            IcecastError::VerificationTimeout { .. } => "VERIFICATION_TIMEOUT",
            IcecastError::Cancelled { .. } => "CANCELLED",
            IcecastError::Launch(_) => "LAUNCH_FAILED",
            IcecastError::ServiceControl(_) => "SERVICE_CONTROL",
            IcecastError::Io(_) => "IO_ERROR",
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no candidate".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" by {}", h),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_conflict_names_holder() {
        let err = IcecastError::PortConflict {
            port: 8000,
            holder: Some("nginx (pid 42)".to_string()),
        };
        assert_eq!(err.to_string(), "Port 8000 is already in use by nginx (pid 42)");
        assert_eq!(err.code(), "PORT_CONFLICT");
    }

    #[test]
    fn test_timeout_message_in_millis() {
        let err = IcecastError::VerificationTimeout {
            operation: "start",
            timeout: Duration::from_secs(8),
        };
        assert_eq!(err.to_string(), "Icecast start was not confirmed within 8000ms");
    }
}
