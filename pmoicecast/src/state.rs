//! Observable state of the broadcast server

use crate::installation::InstallationChecks;
use crate::probe::ServerStats;
use crate::validation::SecurityFinding;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Lifecycle phase as last observed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ServerPhase {
    NotInstalled,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

/// Result of merging the process, port and admin signals.
///
/// `running` is only true when both the process and the port checks pass.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub process_running: bool,
    pub port_open: bool,
    pub admin_reachable: bool,
    pub admin_latency_ms: Option<u64>,
    pub host: String,
    pub port: Option<u16>,
    pub listeners: Option<u32>,
    pub stats: Option<ServerStats>,
    /// Service manager view when a service name is configured.
    pub service_status: Option<String>,
}

/// Individual checks behind a [`HealthReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub installed: bool,
    pub process: bool,
    pub port: bool,
    pub admin: bool,
    pub config_valid: bool,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthLevel,
    pub checks: HealthChecks,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregated view served by the status endpoints and refreshed by the
/// health loop.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct BroadcastServerState {
    pub phase: ServerPhase,
    pub installed: bool,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub installation_path: Option<PathBuf>,
    pub checks: InstallationChecks,
    pub running: bool,
    pub pid: Option<u32>,
    pub host: String,
    pub port: Option<u16>,
    /// Concurrent source limit; `None` when the configuration cannot be read.
    pub source_limit: Option<u32>,
    pub config_valid: bool,
    pub security_findings: Vec<SecurityFinding>,
    pub health: HealthLevel,
    pub uptime_secs: Option<u64>,
    pub listeners: Option<u32>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for BroadcastServerState {
    fn default() -> Self {
        Self {
            phase: ServerPhase::NotInstalled,
            installed: false,
            installation_path: None,
            checks: InstallationChecks::default(),
            running: false,
            pid: None,
            host: "127.0.0.1".to_string(),
            port: None,
            source_limit: None,
            config_valid: false,
            security_findings: Vec::new(),
            health: HealthLevel::Critical,
            uptime_secs: None,
            listeners: None,
            last_error: None,
            last_checked: None,
        }
    }
}

/// What a stream worker needs to connect to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub source_password: String,
}
