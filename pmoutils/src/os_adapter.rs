//! Narrow OS-command adapter.
//!
//! Everything the control plane needs to know about the host (process table,
//! open ports, service manager) goes through [`OsAdapter`]. The orchestration
//! code only depends on the trait; [`SystemOsAdapter`] is the real
//! implementation and tests plug in fakes.

use crate::process::{self, ProcessEntry, ProcessPortInfo, TransportProtocol};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

/// State of a system service as reported by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
    Unknown,
}

/// Action forwarded to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl ServiceAction {
    fn verb(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        }
    }
}

/// A program to launch in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[async_trait]
pub trait OsAdapter: Send + Sync {
    /// Live processes whose executable name matches `name`.
    async fn list_processes_by_name(&self, name: &str) -> Vec<ProcessEntry>;

    async fn is_process_alive(&self, pid: u32) -> bool;

    /// TCP connect probe.
    async fn is_port_open(&self, host: &str, port: u16) -> bool;

    /// Process holding a TCP port, if any can be identified.
    async fn port_holder(&self, port: u16) -> Option<ProcessPortInfo>;

    async fn query_service_status(&self, name: &str) -> ServiceStatus;

    async fn control_service(&self, name: &str, action: ServiceAction) -> io::Result<()>;

    /// Requests termination. `Ok(false)` means the process was already gone.
    async fn kill_process(&self, pid: u32) -> io::Result<bool>;

    /// Starts a program detached from the caller and returns its pid.
    async fn spawn_detached(&self, command: &LaunchCommand) -> io::Result<u32>;
}

/// [`OsAdapter`] backed by the real host.
#[derive(Debug, Clone)]
pub struct SystemOsAdapter {
    connect_timeout: Duration,
}

impl SystemOsAdapter {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for SystemOsAdapter {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

#[async_trait]
impl OsAdapter for SystemOsAdapter {
    async fn list_processes_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || process::list_processes_by_name(&name))
            .await
            .unwrap_or_default()
    }

    async fn is_process_alive(&self, pid: u32) -> bool {
        tokio::task::spawn_blocking(move || process::process_alive(pid))
            .await
            .unwrap_or(false)
    }

    async fn is_port_open(&self, host: &str, port: u16) -> bool {
        let target = format!("{}:{}", host, port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "Port probe refused");
                false
            }
            Err(_) => {
                debug!(target = %target, "Port probe timed out");
                false
            }
        }
    }

    async fn port_holder(&self, port: u16) -> Option<ProcessPortInfo> {
        tokio::task::spawn_blocking(move || {
            process::find_process_using_port(port, TransportProtocol::Tcp)
        })
        .await
        .ok()
        .flatten()
    }

    async fn query_service_status(&self, name: &str) -> ServiceStatus {
        match service_query_command(name).output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                parse_service_status(&stdout, output.status.success())
            }
            Err(e) => {
                debug!(service = name, error = %e, "Service manager unavailable");
                ServiceStatus::Unknown
            }
        }
    }

    async fn control_service(&self, name: &str, action: ServiceAction) -> io::Result<()> {
        let status = service_control_command(name, action).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "service manager failed to {} {} ({})",
                action.verb(),
                name,
                status
            )))
        }
    }

    async fn kill_process(&self, pid: u32) -> io::Result<bool> {
        tokio::task::spawn_blocking(move || process::terminate_process(pid))
            .await
            .map_err(io::Error::other)
    }

    async fn spawn_detached(&self, command: &LaunchCommand) -> io::Result<u32> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process exited before reporting a pid"))?;

        // Reap the child so it does not linger as a zombie once it exits.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, %status, "Detached process exited"),
                Err(e) => warn!(pid, error = %e, "Failed to wait for detached process"),
            }
        });

        Ok(pid)
    }
}

#[cfg(windows)]
fn service_query_command(name: &str) -> Command {
    let mut cmd = Command::new("sc");
    cmd.arg("query").arg(name);
    cmd
}

#[cfg(not(windows))]
fn service_query_command(name: &str) -> Command {
    let mut cmd = Command::new("systemctl");
    cmd.arg("is-active").arg(name);
    cmd
}

#[cfg(windows)]
fn service_control_command(name: &str, action: ServiceAction) -> Command {
    let mut cmd = Command::new("sc");
    cmd.arg(action.verb()).arg(name);
    cmd
}

#[cfg(not(windows))]
fn service_control_command(name: &str, action: ServiceAction) -> Command {
    let mut cmd = Command::new("systemctl");
    cmd.arg(action.verb()).arg(name);
    cmd
}

/// Interprets the output of `systemctl is-active` or `sc query`.
pub fn parse_service_status(stdout: &str, success: bool) -> ServiceStatus {
    let text = stdout.to_ascii_lowercase();

    // sc query
    if text.contains("state") {
        if text.contains("running") {
            return ServiceStatus::Running;
        }
        if text.contains("stopped") {
            return ServiceStatus::Stopped;
        }
    }
    if text.contains("does not exist") || text.contains("1060") {
        return ServiceStatus::NotInstalled;
    }

    // systemctl is-active
    match text.trim() {
        "active" | "activating" | "reloading" => ServiceStatus::Running,
        "inactive" | "failed" | "deactivating" => ServiceStatus::Stopped,
        "unknown" => ServiceStatus::NotInstalled,
        _ if success => ServiceStatus::Running,
        _ => ServiceStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_systemctl_output() {
        assert_eq!(parse_service_status("active\n", true), ServiceStatus::Running);
        assert_eq!(parse_service_status("inactive\n", false), ServiceStatus::Stopped);
        assert_eq!(parse_service_status("failed\n", false), ServiceStatus::Stopped);
        assert_eq!(parse_service_status("unknown\n", false), ServiceStatus::NotInstalled);
        assert_eq!(parse_service_status("", false), ServiceStatus::Unknown);
    }

    #[test]
    fn test_parse_sc_query_output() {
        let running = "SERVICE_NAME: Icecast\n        STATE              : 4  RUNNING\n";
        assert_eq!(parse_service_status(running, true), ServiceStatus::Running);

        let stopped = "SERVICE_NAME: Icecast\n        STATE              : 1  STOPPED\n";
        assert_eq!(parse_service_status(stopped, true), ServiceStatus::Stopped);

        let missing = "[SC] EnumQueryServicesStatus:OpenService FAILED 1060:\n\nThe specified service does not exist as an installed service.";
        assert_eq!(parse_service_status(missing, false), ServiceStatus::NotInstalled);
    }

    #[tokio::test]
    async fn test_port_probe_on_closed_port() {
        let adapter = SystemOsAdapter::new(Duration::from_millis(200));
        // Bind then drop to get a port that is very likely free.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!adapter.is_port_open("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_port_probe_on_listening_port() {
        let adapter = SystemOsAdapter::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(adapter.is_port_open("127.0.0.1", port).await);
    }
}
