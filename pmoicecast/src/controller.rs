//! Broadcast server controller
//!
//! [`IcecastController`] owns everything the control plane knows about the
//! local Icecast server: where it is installed, whether it runs, what its
//! configuration allows, and how healthy it looks.
//!
//! Lifecycle operations (start, stop, restart) are serialized. A newer
//! request cancels the verification wait of the one in flight, so a stop
//! issued during a slow start takes effect without waiting for the start
//! deadline.

use crate::config_ext::IcecastSettings;
use crate::config_file::IcecastConfig;
use crate::error::{IcecastError, Result};
use crate::installation::{self, InstallationReport};
use crate::probe::{HttpProbe, STATUS_JSON_PATH, parse_status_json};
use crate::state::{
    BroadcastServerState, ConnectionTarget, HealthChecks, HealthLevel, HealthReport, ServerPhase,
    StatusReport,
};
use crate::validation::{self, SecurityFinding, ValidationReport};
use chrono::Utc;
use pmoutils::{
    LaunchCommand, OsAdapter, PollOutcome, PollPolicy, ServiceAction, ServiceStatus, poll_until,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct IcecastController {
    settings: IcecastSettings,
    os: Arc<dyn OsAdapter>,
    probe: Arc<dyn HttpProbe>,
    installation: RwLock<InstallationReport>,
    state: RwLock<BroadcastServerState>,
    lifecycle: Mutex<()>,
    in_flight: Mutex<CancellationToken>,
    /// Set by a successful start, cleared by a stop.
    expected_running: AtomicBool,
}

impl IcecastController {
    /// Builds a controller and runs a first installation scan.
    pub fn new(settings: IcecastSettings, os: Arc<dyn OsAdapter>, probe: Arc<dyn HttpProbe>) -> Self {
        let report = installation::detect_installation(&settings.search_paths);
        log_installation(&report);

        let mut state = BroadcastServerState::default();
        apply_installation(&mut state, &report);

        Self {
            settings,
            os,
            probe,
            installation: RwLock::new(report),
            state: RwLock::new(state),
            lifecycle: Mutex::new(()),
            in_flight: Mutex::new(CancellationToken::new()),
            expected_running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &IcecastSettings {
        &self.settings
    }

    /// Rescans the candidate roots.
    pub async fn detect_installation(&self) -> InstallationReport {
        let report = installation::detect_installation(&self.settings.search_paths);
        log_installation(&report);

        *self.installation.write().await = report.clone();
        apply_installation(&mut *self.state.write().await, &report);
        report
    }

    /// Last installation scan.
    pub async fn installation(&self) -> InstallationReport {
        self.installation.read().await.clone()
    }

    /// Copy of the aggregated state.
    pub async fn snapshot(&self) -> BroadcastServerState {
        self.state.read().await.clone()
    }

    async fn config_path(&self) -> Result<PathBuf> {
        let installation = self.installation.read().await;
        installation
            .config_path
            .clone()
            .ok_or_else(|| IcecastError::InstallationNotFound {
                searched: installation.searched.clone(),
            })
    }

    /// Reads the configuration file of the detected installation.
    pub async fn load_config(&self) -> Result<IcecastConfig> {
        let path = self.config_path().await?;
        IcecastConfig::load(&path)
    }

    /// Concurrent source limit, read from the configuration file.
    ///
    /// `None` when the file is missing or the value unreadable.
    pub async fn source_limit(&self) -> Option<u32> {
        let limit = self.load_config().await.ok().and_then(|c| c.source_limit);
        self.state.write().await.source_limit = limit;
        limit
    }

    /// Host, port and source password a stream worker connects with.
    pub async fn connection_target(&self) -> Result<ConnectionTarget> {
        let cfg = self.load_config().await?;
        let port = cfg.port().ok_or_else(|| IcecastError::ConfigInvalid {
            errors: vec!["No <listen-socket> with a usable <port> is configured".to_string()],
        })?;
        let source_password = cfg
            .source_password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| IcecastError::ConfigInvalid {
                errors: vec!["authentication/source-password is empty".to_string()],
            })?;
        Ok(ConnectionTarget {
            host: cfg.local_host(),
            port,
            source_password,
        })
    }

    /// Merges the process, port and admin-page signals.
    pub async fn get_status(&self) -> StatusReport {
        let installation = self.installation().await;
        let config = self.load_config().await.ok();
        let host = config
            .as_ref()
            .map(IcecastConfig::local_host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = config.as_ref().and_then(IcecastConfig::port);

        let processes = self
            .os
            .list_processes_by_name(&installation.process_name())
            .await;
        let process = processes.first();

        let port_open = match port {
            Some(p) => self.os.is_port_open(&host, p).await,
            None => false,
        };

        let mut report = StatusReport {
            running: process.is_some() && port_open,
            pid: process.map(|p| p.pid),
            uptime_secs: process.map(|p| p.run_time_secs),
            process_running: process.is_some(),
            port_open,
            host,
            port,
            ..Default::default()
        };

        if let (true, Some(p)) = (port_open, port) {
            let url = format!("http://{}:{}{}", report.host, p, STATUS_JSON_PATH);
            match self.probe.get(&url, self.settings.probe_timeout).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    report.admin_reachable = true;
                    report.admin_latency_ms = Some(response.elapsed.as_millis() as u64);
                    report.stats = parse_status_json(&response.body);
                    report.listeners = report.stats.as_ref().map(|s| s.listeners);
                }
                Ok(response) => {
                    debug!(url = %url, status = response.status, "Icecast status page answered with an error");
                }
                Err(e) => debug!(url = %url, error = %e, "Icecast status page unreachable"),
            }
        }

        if let Some(service) = &self.settings.service_name {
            let status = self.os.query_service_status(service).await;
            report.service_status = Some(service_label(status).to_string());
        }

        self.observe(&report, config.as_ref()).await;
        report
    }

    async fn observe(&self, report: &StatusReport, config: Option<&IcecastConfig>) {
        let mut state = self.state.write().await;
        state.running = report.running;
        state.pid = report.pid;
        state.uptime_secs = report.uptime_secs;
        state.listeners = report.listeners;
        state.host = config
            .and_then(|c| c.hostname.clone())
            .unwrap_or_else(|| report.host.clone());
        state.port = report.port;
        state.source_limit = config.and_then(|c| c.source_limit);
        state.last_checked = Some(Utc::now());

        state.phase = match state.phase {
            ServerPhase::Starting | ServerPhase::Stopping => state.phase,
            _ if report.running => ServerPhase::Running,
            _ if !state.installed => ServerPhase::NotInstalled,
            ServerPhase::Error => ServerPhase::Error,
            _ => ServerPhase::Stopped,
        };
    }

    /// Leaves `Starting`/`Stopping` for the phase the evidence supports.
    async fn settle_phase(&self, running: bool) {
        let mut state = self.state.write().await;
        state.phase = if running {
            ServerPhase::Running
        } else if !state.installed {
            ServerPhase::NotInstalled
        } else {
            ServerPhase::Stopped
        };
    }

    async fn set_phase(&self, phase: ServerPhase, last_error: Option<String>) {
        let mut state = self.state.write().await;
        state.phase = phase;
        if phase == ServerPhase::Running || last_error.is_some() {
            state.last_error = last_error;
        }
    }

    /// Cancels the lifecycle operation in flight and returns the token of
    /// the new one.
    async fn supersede(&self) -> CancellationToken {
        let mut current = self.in_flight.lock().await;
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    /// Starts the server and waits until both the process and the port are up.
    pub async fn start(&self) -> Result<StatusReport> {
        let cancel = self.supersede().await;
        let _guard = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(IcecastError::Cancelled { operation: "start" });
        }
        self.start_locked(&cancel, self.settings.start_policy()).await
    }

    /// Stops the server and waits until no server process remains.
    pub async fn stop(&self) -> Result<StatusReport> {
        let cancel = self.supersede().await;
        let _guard = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(IcecastError::Cancelled { operation: "stop" });
        }
        self.stop_locked(&cancel, self.settings.stop_policy()).await
    }

    /// Stop then start, within the restart window.
    pub async fn restart(&self) -> Result<StatusReport> {
        let cancel = self.supersede().await;
        let _guard = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(IcecastError::Cancelled { operation: "restart" });
        }

        let window = self.settings.restart_timeout;
        let began = Instant::now();
        let stop_policy = PollPolicy::new(self.settings.poll_interval, window);
        self.stop_locked(&cancel, stop_policy)
            .await
            .map_err(|e| as_restart_error(e, window))?;

        let remaining = window
            .saturating_sub(began.elapsed())
            .max(self.settings.start_timeout);
        let start_policy = PollPolicy::new(self.settings.poll_interval, remaining);
        self.start_locked(&cancel, start_policy)
            .await
            .map_err(|e| as_restart_error(e, window))
    }

    async fn start_locked(&self, cancel: &CancellationToken, policy: PollPolicy) -> Result<StatusReport> {
        let installation = self.installation().await;
        let config_path = match (&installation.installed, &installation.config_path) {
            (true, Some(path)) => path.clone(),
            _ => {
                return Err(IcecastError::InstallationNotFound {
                    searched: installation.searched.clone(),
                });
            }
        };

        let validation = validation::validate_file(&config_path);
        self.state.write().await.config_valid = validation.valid;
        if !validation.valid {
            warn!(errors = ?validation.errors, "Refusing to start Icecast with an invalid configuration");
            return Err(IcecastError::ConfigInvalid {
                errors: validation.errors,
            });
        }
        if !validation.warnings.is_empty() {
            warn!(
                "{}",
                IcecastError::ConfigWarning {
                    warnings: validation.warnings.clone(),
                }
            );
        }

        let status = self.get_status().await;
        if status.running {
            info!(pid = ?status.pid, "Icecast is already running");
            self.expected_running.store(true, Ordering::SeqCst);
            self.set_phase(ServerPhase::Running, None).await;
            return Ok(status);
        }

        if status.port_open && !status.process_running {
            if let Some(port) = status.port {
                let holder = self
                    .os
                    .port_holder(port)
                    .await
                    .map(|h| format!("{} (pid {})", h.process_name, h.pid));
                let err = IcecastError::PortConflict { port, holder };
                error!("{}", err);
                self.set_phase(ServerPhase::Error, Some(err.to_string())).await;
                return Err(err);
            }
        }

        self.set_phase(ServerPhase::Starting, None).await;
        if let Err(e) = self.launch(&installation, &config_path).await {
            error!("{}", e);
            self.set_phase(ServerPhase::Error, Some(e.to_string())).await;
            return Err(e);
        }

        let outcome = poll_until(policy, cancel, move || async move {
            let status = self.get_status().await;
            status.running.then_some(status)
        })
        .await;

        match outcome {
            PollOutcome::Ready(status) => {
                info!(pid = ?status.pid, port = ?status.port, "Icecast started");
                self.expected_running.store(true, Ordering::SeqCst);
                self.set_phase(ServerPhase::Running, None).await;
                Ok(status)
            }
            PollOutcome::TimedOut => {
                let err = IcecastError::VerificationTimeout {
                    operation: "start",
                    timeout: policy.timeout,
                };
                error!("{}", err);
                self.set_phase(ServerPhase::Error, Some(err.to_string())).await;
                Err(err)
            }
            PollOutcome::Cancelled => {
                info!("Icecast start superseded by a newer request");
                let running = self.get_status().await.running;
                self.settle_phase(running).await;
                Err(IcecastError::Cancelled { operation: "start" })
            }
        }
    }

    async fn launch(&self, installation: &InstallationReport, config_path: &Path) -> Result<()> {
        if let Some(service) = &self.settings.service_name {
            match self.os.query_service_status(service).await {
                ServiceStatus::NotInstalled | ServiceStatus::Unknown => {
                    warn!(service = %service, "Service unavailable, launching the executable directly");
                }
                _ => {
                    info!(service = %service, "Starting Icecast through the service manager");
                    return self
                        .os
                        .control_service(service, ServiceAction::Start)
                        .await
                        .map_err(|e| IcecastError::ServiceControl(e.to_string()));
                }
            }
        }

        let program = installation.executable_path.clone().ok_or_else(|| {
            IcecastError::InstallationNotFound {
                searched: installation.searched.clone(),
            }
        })?;
        let command = LaunchCommand {
            program,
            args: vec!["-c".to_string(), config_path.display().to_string()],
            working_dir: installation.installation_path.clone(),
        };
        let pid = self
            .os
            .spawn_detached(&command)
            .await
            .map_err(IcecastError::Launch)?;
        info!(pid, program = %command.program.display(), "Icecast launched");
        Ok(())
    }

    async fn stop_locked(&self, cancel: &CancellationToken, policy: PollPolicy) -> Result<StatusReport> {
        self.expected_running.store(false, Ordering::SeqCst);

        let status = self.get_status().await;
        if !status.process_running {
            info!("Icecast is not running");
            self.settle_phase(false).await;
            return Ok(status);
        }

        self.set_phase(ServerPhase::Stopping, None).await;
        if let Err(e) = self.request_stop().await {
            self.set_phase(ServerPhase::Error, Some(e.to_string())).await;
            return Err(e);
        }

        let outcome = poll_until(policy, cancel, move || async move {
            let status = self.get_status().await;
            (!status.process_running).then_some(status)
        })
        .await;

        match outcome {
            PollOutcome::Ready(status) => {
                info!("Icecast stopped");
                self.set_phase(ServerPhase::Stopped, None).await;
                Ok(status)
            }
            PollOutcome::TimedOut => {
                let err = IcecastError::VerificationTimeout {
                    operation: "stop",
                    timeout: policy.timeout,
                };
                error!("{}", err);
                self.set_phase(ServerPhase::Error, Some(err.to_string())).await;
                Err(err)
            }
            PollOutcome::Cancelled => {
                info!("Icecast stop superseded by a newer request");
                let running = self.get_status().await.running;
                self.settle_phase(running).await;
                Err(IcecastError::Cancelled { operation: "stop" })
            }
        }
    }

    async fn request_stop(&self) -> Result<()> {
        if let Some(service) = &self.settings.service_name {
            if self.os.query_service_status(service).await == ServiceStatus::Running {
                info!(service = %service, "Stopping Icecast through the service manager");
                return self
                    .os
                    .control_service(service, ServiceAction::Stop)
                    .await
                    .map_err(|e| IcecastError::ServiceControl(e.to_string()));
            }
        }

        let name = self.installation.read().await.process_name();
        for process in self.os.list_processes_by_name(&name).await {
            match self.os.kill_process(process.pid).await {
                Ok(true) => debug!(pid = process.pid, "Termination requested"),
                Ok(false) => debug!(pid = process.pid, "Process already gone"),
                Err(e) => {
                    warn!(pid = process.pid, error = %e, "Cannot terminate Icecast process");
                    return Err(IcecastError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// Validates the configuration file of the detected installation.
    pub async fn validate_configuration(&self) -> ValidationReport {
        let report = match self.config_path().await {
            Ok(path) => validation::validate_file(&path),
            Err(_) => ValidationReport::missing_file(None),
        };
        self.state.write().await.config_valid = report.valid;
        report
    }

    /// Audits the configuration file; empty when there is none to read.
    pub async fn check_security_vulnerabilities(&self) -> Vec<SecurityFinding> {
        let findings = match self.load_config().await {
            Ok(cfg) => validation::audit_config(&cfg),
            Err(e) => {
                debug!(error = %e, "Security audit skipped");
                Vec::new()
            }
        };
        self.state.write().await.security_findings = findings.clone();
        findings
    }

    /// Classifies the server health from live checks.
    pub async fn get_health_status(&self) -> HealthReport {
        let installed = self.installation.read().await.installed;
        let status = self.get_status().await;
        let validation = self.validate_configuration().await;
        let expected = self.expected_running.load(Ordering::SeqCst);

        let checks = HealthChecks {
            installed,
            process: status.process_running,
            port: status.port_open,
            admin: status.admin_reachable,
            config_valid: validation.valid,
        };

        let mut issues = Vec::new();
        let level = if !installed {
            issues.push("Icecast is not installed".to_string());
            HealthLevel::Critical
        } else if status.process_running != status.port_open {
            issues.push(if status.process_running {
                "Icecast process is running but its port does not answer".to_string()
            } else {
                "Icecast port answers but no Icecast process is running".to_string()
            });
            if expected {
                HealthLevel::Critical
            } else {
                HealthLevel::Warning
            }
        } else if expected && !status.running {
            issues.push("Icecast stopped while it was expected to run".to_string());
            HealthLevel::Critical
        } else if status.running && !status.admin_reachable {
            issues.push("Icecast status page does not answer".to_string());
            HealthLevel::Degraded
        } else if !validation.valid || !validation.warnings.is_empty() {
            HealthLevel::Warning
        } else if !status.running {
            issues.push("Icecast is not running".to_string());
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };
        issues.extend(validation.errors);
        issues.extend(validation.warnings);

        self.state.write().await.health = level;
        HealthReport {
            status: level,
            checks,
            issues,
            checked_at: Utc::now(),
        }
    }

    /// One health-loop pass: refreshes every part of the aggregated state.
    pub async fn refresh(&self) -> BroadcastServerState {
        let health = self.get_health_status().await;
        self.check_security_vulnerabilities().await;
        if health.status != HealthLevel::Healthy {
            debug!(health = ?health.status, issues = ?health.issues, "Icecast health check");
        }
        self.snapshot().await
    }

    /// Refreshes the state every `health_interval` until `shutdown` fires.
    pub async fn run_health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        info!(interval = ?self.settings.health_interval, "Icecast health loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
        info!("Icecast health loop stopped");
    }
}

fn apply_installation(state: &mut BroadcastServerState, report: &InstallationReport) {
    state.installed = report.installed;
    state.installation_path = report.installation_path.clone();
    state.checks = report.checks.clone();
    if !report.installed {
        state.phase = ServerPhase::NotInstalled;
    } else if state.phase == ServerPhase::NotInstalled {
        state.phase = ServerPhase::Stopped;
    }
}

fn log_installation(report: &InstallationReport) {
    match (&report.installed, &report.installation_path) {
        (true, Some(path)) => info!(path = %path.display(), "Icecast installation found"),
        (false, Some(path)) => warn!(
            path = %path.display(),
            checks = ?report.checks,
            "Incomplete Icecast installation"
        ),
        _ => warn!(searched = ?report.searched, "No Icecast installation found"),
    }
    for note in &report.notes {
        warn!("{}", note);
    }
}

fn service_label(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Running => "running",
        ServiceStatus::Stopped => "stopped",
        ServiceStatus::NotInstalled => "not-installed",
        ServiceStatus::Unknown => "unknown",
    }
}

fn as_restart_error(err: IcecastError, window: std::time::Duration) -> IcecastError {
    match err {
        IcecastError::VerificationTimeout { .. } => IcecastError::VerificationTimeout {
            operation: "restart",
            timeout: window,
        },
        IcecastError::Cancelled { .. } => IcecastError::Cancelled {
            operation: "restart",
        },
        other => other,
    }
}
