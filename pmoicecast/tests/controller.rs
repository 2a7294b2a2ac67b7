//! Controller behaviour against a scripted host.

use async_trait::async_trait;
use pmoicecast::probe::{HttpProbe, ProbeResponse};
use pmoicecast::{
    HealthLevel, IcecastController, IcecastError, IcecastSettings, ServerPhase,
};
use pmoutils::{
    LaunchCommand, OsAdapter, ProcessEntry, ProcessPortInfo, ServiceAction, ServiceStatus,
};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const ICECAST_PID: u32 = 4242;
const PORT: u16 = 8000;

#[derive(Default)]
struct Host {
    processes: Vec<ProcessEntry>,
    open_ports: HashSet<u16>,
    holder: Option<ProcessPortInfo>,
    spawned: Vec<LaunchCommand>,
    killed: Vec<u32>,
    service_calls: Vec<ServiceAction>,
    service: Option<ServiceStatus>,
    /// A spawn (or service start) brings the server up.
    boots: bool,
    /// A kill (or service stop) brings the server down.
    dies: bool,
}

impl Host {
    fn bring_up(&mut self) {
        self.processes.push(ProcessEntry {
            pid: ICECAST_PID,
            name: "icecast".to_string(),
            cmd: vec!["icecast".to_string()],
            run_time_secs: 12,
        });
        self.open_ports.insert(PORT);
        if self.service.is_some() {
            self.service = Some(ServiceStatus::Running);
        }
    }

    fn bring_down(&mut self) {
        self.processes.clear();
        self.open_ports.remove(&PORT);
        if self.service.is_some() {
            self.service = Some(ServiceStatus::Stopped);
        }
    }
}

#[derive(Default)]
struct FakeOs {
    host: Mutex<Host>,
}

impl FakeOs {
    fn with(f: impl FnOnce(&mut Host)) -> Arc<Self> {
        let os = Arc::new(Self::default());
        f(&mut os.host.lock().unwrap());
        os
    }
}

#[async_trait]
impl OsAdapter for FakeOs {
    async fn list_processes_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        let host = self.host.lock().unwrap();
        host.processes.iter().filter(|p| p.name == name).cloned().collect()
    }

    async fn is_process_alive(&self, pid: u32) -> bool {
        self.host.lock().unwrap().processes.iter().any(|p| p.pid == pid)
    }

    async fn is_port_open(&self, _host: &str, port: u16) -> bool {
        self.host.lock().unwrap().open_ports.contains(&port)
    }

    async fn port_holder(&self, _port: u16) -> Option<ProcessPortInfo> {
        self.host.lock().unwrap().holder.clone()
    }

    async fn query_service_status(&self, _name: &str) -> ServiceStatus {
        self.host
            .lock()
            .unwrap()
            .service
            .unwrap_or(ServiceStatus::NotInstalled)
    }

    async fn control_service(&self, _name: &str, action: ServiceAction) -> io::Result<()> {
        let mut host = self.host.lock().unwrap();
        host.service_calls.push(action);
        match action {
            ServiceAction::Start if host.boots => host.bring_up(),
            ServiceAction::Stop if host.dies => host.bring_down(),
            _ => {}
        }
        Ok(())
    }

    async fn kill_process(&self, pid: u32) -> io::Result<bool> {
        let mut host = self.host.lock().unwrap();
        host.killed.push(pid);
        if host.dies {
            host.bring_down();
        }
        Ok(true)
    }

    async fn spawn_detached(&self, command: &LaunchCommand) -> io::Result<u32> {
        let mut host = self.host.lock().unwrap();
        host.spawned.push(command.clone());
        if host.boots {
            host.bring_up();
        }
        Ok(ICECAST_PID)
    }
}

struct FakeProbe {
    reachable: AtomicBool,
}

impl FakeProbe {
    fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
        })
    }
}

#[async_trait]
impl HttpProbe for FakeProbe {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<ProbeResponse, String> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err("connection refused".to_string());
        }
        Ok(ProbeResponse {
            status: 200,
            body: r#"{"icestats":{"server_id":"Icecast 2.4.4",
                "source":{"listenurl":"http://studio.lan:8000/kitchen","listeners":5}}}"#
                .to_string(),
            elapsed: Duration::from_millis(3),
        })
    }
}

const SOUND_CONFIG: &str = r#"<icecast>
    <limits><clients>50</clients><sources>2</sources></limits>
    <authentication>
        <source-password>source-secret</source-password>
        <relay-password>relay-secret</relay-password>
        <admin-user>station</admin-user>
        <admin-password>admin-secret-long</admin-password>
    </authentication>
    <hostname>studio.lan</hostname>
    <listen-socket><port>8000</port><bind-address>192.168.1.10</bind-address></listen-socket>
    <paths><logdir>./logs</logdir><webroot>./web</webroot><adminroot>./admin</adminroot></paths>
</icecast>"#;

fn install(root: &Path, config: &str) {
    for dir in ["bin", "logs", "web", "admin"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    let exe = if cfg!(windows) { "icecast.exe" } else { "icecast" };
    fs::write(root.join("bin").join(exe), b"").unwrap();
    fs::write(root.join("icecast.bat"), b"").unwrap();
    fs::write(root.join("icecast.xml"), config).unwrap();
}

fn settings(root: &Path) -> IcecastSettings {
    IcecastSettings {
        search_paths: vec![root.to_path_buf()],
        ..Default::default()
    }
}

fn controller(root: &Path, os: Arc<FakeOs>, probe: Arc<FakeProbe>) -> IcecastController {
    IcecastController::new(settings(root), os, probe)
}

#[tokio::test]
async fn test_start_without_installation_spawns_nothing() {
    let tmp = TempDir::new().unwrap();
    let os = FakeOs::with(|h| h.boots = true);
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let err = ctl.start().await.unwrap_err();
    assert!(matches!(err, IcecastError::InstallationNotFound { .. }));
    assert!(os.host.lock().unwrap().spawned.is_empty());
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::NotInstalled);
}

#[tokio::test]
async fn test_start_launches_and_verifies() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| h.boots = true);
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let status = ctl.start().await.unwrap();
    assert!(status.running);
    assert_eq!(status.pid, Some(ICECAST_PID));
    assert_eq!(status.listeners, Some(5));

    let spawned = os.host.lock().unwrap().spawned.clone();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].args[0], "-c");
    assert!(spawned[0].args[1].ends_with("icecast.xml"));

    let state = ctl.snapshot().await;
    assert_eq!(state.phase, ServerPhase::Running);
    assert_eq!(state.source_limit, Some(2));
    assert_eq!(state.port, Some(PORT));
    assert_eq!(state.host, "studio.lan");
}

#[tokio::test]
async fn test_start_when_already_running_does_not_spawn() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| h.bring_up());
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let status = ctl.start().await.unwrap();
    assert!(status.running);
    assert!(os.host.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_start_refuses_port_held_by_another_process() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.open_ports.insert(PORT);
        h.holder = Some(ProcessPortInfo {
            pid: 77,
            process_name: "nginx".to_string(),
            owner: "www-data".to_string(),
            port: PORT,
        });
    });
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(false));

    match ctl.start().await {
        Err(IcecastError::PortConflict { port, holder }) => {
            assert_eq!(port, PORT);
            assert_eq!(holder.as_deref(), Some("nginx (pid 77)"));
        }
        other => panic!("expected a port conflict, got {:?}", other),
    }
    assert!(os.host.lock().unwrap().spawned.is_empty());
}

#[tokio::test]
async fn test_start_rejects_invalid_configuration() {
    let tmp = TempDir::new().unwrap();
    install(
        tmp.path(),
        "<icecast><listen-socket><port>8000</port></listen-socket></icecast>",
    );
    let os = FakeOs::with(|h| h.boots = true);
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let err = ctl.start().await.unwrap_err();
    match err {
        IcecastError::ConfigInvalid { errors } => assert!(!errors.is_empty()),
        other => panic!("expected invalid configuration, got {:?}", other),
    }
    assert!(os.host.lock().unwrap().spawned.is_empty());
    assert!(!ctl.snapshot().await.config_valid);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_start_times_out() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::default();
    let ctl = controller(tmp.path(), Arc::new(os), FakeProbe::new(true));

    let err = ctl.start().await.unwrap_err();
    match err {
        IcecastError::VerificationTimeout { operation, timeout } => {
            assert_eq!(operation, "start");
            assert_eq!(timeout, Duration::from_secs(8));
        }
        other => panic!("expected a verification timeout, got {:?}", other),
    }
    let state = ctl.snapshot().await;
    assert_eq!(state.phase, ServerPhase::Error);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn test_stop_terminates_and_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.bring_up();
        h.dies = true;
    });
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let status = ctl.stop().await.unwrap();
    assert!(!status.process_running);
    assert_eq!(os.host.lock().unwrap().killed, vec![ICECAST_PID]);
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Stopped);

    ctl.stop().await.unwrap();
    assert_eq!(os.host.lock().unwrap().killed.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_supersedes_start_verification() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = Arc::new(FakeOs::default());
    let ctl = Arc::new(controller(tmp.path(), os.clone(), FakeProbe::new(true)));

    let starting = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    ctl.stop().await.unwrap();
    let start_result = starting.await.unwrap();
    assert!(matches!(
        start_result,
        Err(IcecastError::Cancelled { operation: "start" })
    ));
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Stopped);
}

#[tokio::test]
async fn test_stop_of_absent_server_settles_phase() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = Arc::new(FakeOs::default());
    let ctl = Arc::new(controller(tmp.path(), os.clone(), FakeProbe::new(true)));

    let starting = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.start().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Starting);

    let status = ctl.stop().await.unwrap();
    assert!(!status.process_running);
    assert!(starting.await.unwrap().is_err());
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Stopped);

    ctl.get_status().await;
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Stopped);
}

#[tokio::test]
async fn test_restart_stops_then_starts() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.bring_up();
        h.boots = true;
        h.dies = true;
    });
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let status = ctl.restart().await.unwrap();
    assert!(status.running);
    let host = os.host.lock().unwrap();
    assert_eq!(host.killed, vec![ICECAST_PID]);
    assert_eq!(host.spawned.len(), 1);
}

#[tokio::test]
async fn test_service_mode_uses_service_manager() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.service = Some(ServiceStatus::Stopped);
        h.boots = true;
        h.dies = true;
    });
    let ctl = IcecastController::new(
        IcecastSettings {
            service_name: Some("icecast2".to_string()),
            ..settings(tmp.path())
        },
        os.clone(),
        FakeProbe::new(true),
    );

    ctl.start().await.unwrap();
    let status = ctl.stop().await.unwrap();
    assert_eq!(status.service_status.as_deref(), Some("stopped"));

    let host = os.host.lock().unwrap();
    assert!(host.spawned.is_empty());
    assert!(host.killed.is_empty());
    assert_eq!(host.service_calls, vec![ServiceAction::Start, ServiceAction::Stop]);
}

#[tokio::test]
async fn test_running_requires_process_and_port() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.bring_up();
        h.open_ports.clear();
    });
    let ctl = controller(tmp.path(), os, FakeProbe::new(true));

    let status = ctl.get_status().await;
    assert!(status.process_running);
    assert!(!status.port_open);
    assert!(!status.running);

    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Warning);
    assert!(!health.issues.is_empty());
}

#[tokio::test]
async fn test_foreign_port_is_critical_only_when_expected() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| {
        h.open_ports.insert(PORT);
    });
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Warning);
    assert!(health.checks.port);
    assert!(!health.checks.process);

    {
        let mut host = os.host.lock().unwrap();
        host.open_ports.clear();
        host.boots = true;
    }
    ctl.start().await.unwrap();
    os.host.lock().unwrap().processes.clear();

    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Critical);
}

#[tokio::test]
async fn test_health_levels() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| h.bring_up());
    let probe = FakeProbe::new(true);
    let ctl = controller(tmp.path(), os.clone(), probe.clone());

    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Healthy, "{:?}", health.issues);

    probe.reachable.store(false, Ordering::SeqCst);
    assert_eq!(ctl.get_health_status().await.status, HealthLevel::Degraded);

    os.host.lock().unwrap().bring_down();
    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Warning);
    assert!(!health.checks.process);
}

#[tokio::test]
async fn test_unexpected_stop_is_critical() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let os = FakeOs::with(|h| h.boots = true);
    let ctl = controller(tmp.path(), os.clone(), FakeProbe::new(true));

    ctl.start().await.unwrap();
    os.host.lock().unwrap().bring_down();

    let health = ctl.get_health_status().await;
    assert_eq!(health.status, HealthLevel::Critical);
}

#[tokio::test]
async fn test_security_findings_without_running_server() {
    let tmp = TempDir::new().unwrap();
    install(
        tmp.path(),
        &SOUND_CONFIG.replace("admin-secret-long", "hackme"),
    );
    let ctl = controller(tmp.path(), Arc::new(FakeOs::default()), FakeProbe::new(false));

    let findings = ctl.check_security_vulnerabilities().await;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].code, "DEFAULT_PASSWORD");
    assert_eq!(ctl.snapshot().await.security_findings.len(), 1);
}

#[tokio::test]
async fn test_connection_target_from_config() {
    let tmp = TempDir::new().unwrap();
    install(tmp.path(), SOUND_CONFIG);
    let ctl = controller(tmp.path(), Arc::new(FakeOs::default()), FakeProbe::new(false));

    let target = ctl.connection_target().await.unwrap();
    assert_eq!(target.host, "192.168.1.10");
    assert_eq!(target.port, PORT);
    assert_eq!(target.source_password, "source-secret");
    assert_eq!(ctl.source_limit().await, Some(2));
}

#[tokio::test]
async fn test_detect_picks_up_new_installation() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(tmp.path(), Arc::new(FakeOs::default()), FakeProbe::new(false));
    assert!(!ctl.installation().await.installed);

    install(tmp.path(), SOUND_CONFIG);
    let report = ctl.detect_installation().await;
    assert!(report.installed);
    assert_eq!(ctl.snapshot().await.phase, ServerPhase::Stopped);
}

mod api {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn call(
        ctl: Arc<IcecastController>,
        method: &str,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let router = pmoicecast::api::create_router(ctl);
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_start_without_installation_is_503() {
        let tmp = TempDir::new().unwrap();
        let ctl = Arc::new(controller(tmp.path(), Arc::new(FakeOs::default()), FakeProbe::new(false)));

        let (status, body) = call(ctl, "POST", "/system/icecast/start").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "INSTALLATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_status_and_validation_routes() {
        let tmp = TempDir::new().unwrap();
        install(tmp.path(), SOUND_CONFIG);
        let os = FakeOs::with(|h| h.bring_up());
        let ctl = Arc::new(controller(tmp.path(), os, FakeProbe::new(true)));

        let (status, body) = call(ctl.clone(), "GET", "/system/icecast-status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["running"], true);
        assert_eq!(body["installation"]["installed"], true);
        assert_eq!(body["state"]["sourceLimit"], 2);

        let (_, body) = call(ctl.clone(), "GET", "/system/icecast/validate-config").await;
        assert_eq!(body["valid"], true);

        let (_, body) = call(ctl.clone(), "GET", "/system/icecast/security-check").await;
        assert_eq!(body["count"], 0);

        let (_, body) = call(ctl, "GET", "/icecast/health").await;
        assert_eq!(body["status"], "healthy");
    }
}
