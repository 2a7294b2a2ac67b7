//! Configuration validation and security audit of `icecast.xml`
//!
//! Validation separates blocking errors from warnings. The audit is a pure
//! function of the parsed file and does not care whether the server runs.

use crate::config_file::{FACTORY_PASSWORD, IcecastConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Outcome of [`validate_file`].
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// No blocking error was found.
    pub valid: bool,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub config_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_findings(config_path: Option<PathBuf>, errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            config_path,
            errors,
            warnings,
        }
    }

    pub fn missing_file(path: Option<&Path>) -> Self {
        let message = match path {
            Some(p) => format!("Configuration file {} does not exist", p.display()),
            None => "No Icecast configuration file was found".to_string(),
        };
        Self::from_findings(path.map(Path::to_path_buf), vec![message], Vec::new())
    }
}

/// Parses and validates the file at `path`.
pub fn validate_file(path: &Path) -> ValidationReport {
    if !path.is_file() {
        return ValidationReport::missing_file(Some(path));
    }
    match IcecastConfig::load(path) {
        Ok(cfg) => validate_config(&cfg),
        Err(e) => ValidationReport::from_findings(
            Some(path.to_path_buf()),
            vec![e.to_string()],
            Vec::new(),
        ),
    }
}

/// Checks a parsed configuration.
pub fn validate_config(cfg: &IcecastConfig) -> ValidationReport {
    let mut errors = cfg.issues.clone();
    let mut warnings = Vec::new();

    match cfg.port() {
        None => errors.push("No <listen-socket> with a usable <port> is configured".to_string()),
        Some(0) => errors.push("listen-socket port 0 is not a usable port".to_string()),
        Some(_) => {}
    }

    match cfg.source_limit {
        Some(0) => errors.push("limits/sources is 0: no stream could ever connect".to_string()),
        Some(_) => {}
        None if cfg.issues.iter().any(|i| i.starts_with("limits/sources")) => {}
        None => errors.push(
            "limits/sources is not set; the number of concurrent streams cannot be enforced"
                .to_string(),
        ),
    }

    if cfg.source_password.as_deref().is_none_or(str::is_empty) {
        errors.push("authentication/source-password is empty; encoders cannot authenticate".to_string());
    }

    match &cfg.log_dir {
        None => errors.push("paths/logdir is not set".to_string()),
        Some(dir) if !dir.is_dir() => {
            errors.push(format!("Log directory {} does not exist", dir.display()))
        }
        Some(dir) => {
            if is_read_only(dir) {
                errors.push(format!("Log directory {} is not writable", dir.display()));
            }
        }
    }

    for (label, dir) in [("webroot", &cfg.web_root), ("adminroot", &cfg.admin_root)] {
        match dir {
            Some(dir) if !dir.is_dir() => warnings.push(format!(
                "paths/{} {} does not exist; status pages will not be served",
                label,
                dir.display()
            )),
            None => warnings.push(format!("paths/{} is not set", label)),
            _ => {}
        }
    }

    if let Some(bind) = cfg.bind_address() {
        if pmoutils::is_loopback_bind(bind) {
            warnings.push(format!(
                "bind-address {} only accepts local connections; LAN listeners cannot reach the streams",
                bind
            ));
        }
    }

    match cfg.hostname.as_deref() {
        Some(host) if pmoutils::is_loopback_bind(host) => warnings.push(format!(
            "hostname is {}; stream URLs advertised to LAN clients will not resolve",
            host
        )),
        _ => {}
    }

    if let (Some(sources), Some(clients)) = (cfg.source_limit, cfg.client_limit) {
        if clients < sources {
            warnings.push(format!(
                "limits/clients ({}) is lower than limits/sources ({})",
                clients, sources
            ));
        }
    }

    ValidationReport::from_findings(Some(cfg.path.clone()), errors, warnings)
}

fn is_read_only(dir: &Path) -> bool {
    std::fs::metadata(dir)
        .map(|m| m.permissions().readonly())
        .unwrap_or(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One security issue found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    #[cfg_attr(feature = "pmoserver", schema(value_type = String))]
    pub code: &'static str,
    pub severity: FindingSeverity,
    pub title: String,
    pub recommendation: String,
}

impl SecurityFinding {
    fn new(
        code: &'static str,
        severity: FindingSeverity,
        title: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            code,
            severity,
            title: title.into(),
            recommendation: recommendation.into(),
        }
    }
}

const MIN_PASSWORD_LEN: usize = 8;

/// Audits credentials and network exposure.
///
/// Findings are sorted from most to least severe.
pub fn audit_config(cfg: &IcecastConfig) -> Vec<SecurityFinding> {
    let mut findings = Vec::new();

    check_password(
        &mut findings,
        "admin-password",
        cfg.admin_password.as_deref(),
        FindingSeverity::Critical,
        "anyone on the network can administer the server",
    );
    check_password(
        &mut findings,
        "source-password",
        cfg.source_password.as_deref(),
        FindingSeverity::High,
        "anyone on the network can hijack a mountpoint",
    );
    check_password(
        &mut findings,
        "relay-password",
        cfg.relay_password.as_deref(),
        FindingSeverity::Medium,
        "anyone on the network can relay the streams",
    );

    if cfg.admin_user.as_deref() == Some("admin") {
        findings.push(SecurityFinding::new(
            "DEFAULT_ADMIN_USER",
            FindingSeverity::Medium,
            "Administrator account uses the default name 'admin'",
            "Rename authentication/admin-user",
        ));
    }

    match cfg.bind_address() {
        None => findings.push(SecurityFinding::new(
            "ALL_INTERFACES",
            FindingSeverity::Low,
            "Server listens on every network interface",
            "Set listen-socket/bind-address to the LAN interface address",
        )),
        Some(addr) if pmoutils::is_wildcard_bind(addr) => findings.push(SecurityFinding::new(
            "ALL_INTERFACES",
            FindingSeverity::Low,
            format!("Server listens on every network interface ({})", addr),
            "Set listen-socket/bind-address to the LAN interface address",
        )),
        _ => {}
    }

    if cfg.admin_email.as_deref() == Some("icemaster@localhost") {
        findings.push(SecurityFinding::new(
            "DEFAULT_ADMIN_CONTACT",
            FindingSeverity::Low,
            "Admin contact is the factory placeholder",
            "Set <admin> to a real contact address",
        ));
    }

    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    findings
}

fn check_password(
    findings: &mut Vec<SecurityFinding>,
    field: &str,
    value: Option<&str>,
    severity: FindingSeverity,
    impact: &str,
) {
    let recommendation = format!("Set a unique authentication/{} of at least {} characters", field, MIN_PASSWORD_LEN);
    match value {
        None => {}
        Some("") => findings.push(SecurityFinding::new(
            "EMPTY_PASSWORD",
            severity,
            format!("authentication/{} is empty: {}", field, impact),
            recommendation,
        )),
        Some(FACTORY_PASSWORD) => findings.push(SecurityFinding::new(
            "DEFAULT_PASSWORD",
            severity,
            format!("authentication/{} is the factory default '{}': {}", field, FACTORY_PASSWORD, impact),
            recommendation,
        )),
        Some(pw) if pw.chars().count() < MIN_PASSWORD_LEN => findings.push(SecurityFinding::new(
            "WEAK_PASSWORD",
            FindingSeverity::Medium.min(severity),
            format!("authentication/{} is shorter than {} characters", field, MIN_PASSWORD_LEN),
            recommendation,
        )),
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::ListenSocket;
    use std::fs;
    use tempfile::TempDir;

    fn sound_config(root: &Path) -> IcecastConfig {
        for dir in ["logs", "web", "admin"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        IcecastConfig {
            path: root.join("icecast.xml"),
            hostname: Some("studio.lan".to_string()),
            source_limit: Some(4),
            client_limit: Some(100),
            source_password: Some("correct-horse".to_string()),
            relay_password: Some("battery-staple".to_string()),
            admin_user: Some("station".to_string()),
            admin_password: Some("long-admin-secret".to_string()),
            listen_sockets: vec![ListenSocket {
                port: 8000,
                bind_address: Some("192.168.1.10".to_string()),
            }],
            log_dir: Some(root.join("logs")),
            web_root: Some(root.join("web")),
            admin_root: Some(root.join("admin")),
            ..Default::default()
        }
    }

    #[test]
    fn test_sound_config_is_valid_and_clean() {
        let tmp = TempDir::new().unwrap();
        let cfg = sound_config(tmp.path());

        let report = validate_config(&cfg);
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(audit_config(&cfg).is_empty());
    }

    #[test]
    fn test_missing_port_and_sources_are_errors() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = sound_config(tmp.path());
        cfg.listen_sockets.clear();
        cfg.source_limit = None;

        let report = validate_config(&cfg);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_missing_logdir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = sound_config(tmp.path());
        cfg.log_dir = Some(tmp.path().join("nowhere"));

        let report = validate_config(&cfg);
        assert!(!report.valid);
        assert!(report.errors[0].contains("does not exist"));
    }

    #[test]
    fn test_loopback_bind_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = sound_config(tmp.path());
        cfg.listen_sockets[0].bind_address = Some("127.0.0.1".to_string());

        let report = validate_config(&cfg);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("127.0.0.1"));
    }

    #[test]
    fn test_validate_file_reports_missing_and_broken_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("icecast.xml");

        let report = validate_file(&path);
        assert!(!report.valid);

        fs::write(&path, "<icecast><limits>").unwrap();
        let report = validate_file(&path);
        assert!(!report.valid);
        assert!(report.errors[0].contains("Cannot parse"));
    }

    #[test]
    fn test_factory_defaults_are_flagged() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = sound_config(tmp.path());
        cfg.admin_user = Some("admin".to_string());
        cfg.admin_password = Some(FACTORY_PASSWORD.to_string());
        cfg.source_password = Some(FACTORY_PASSWORD.to_string());
        cfg.listen_sockets[0].bind_address = None;

        let findings = audit_config(&cfg);
        let codes: Vec<_> = findings.iter().map(|f| f.code).collect();
        assert_eq!(
            codes,
            vec!["DEFAULT_PASSWORD", "DEFAULT_PASSWORD", "DEFAULT_ADMIN_USER", "ALL_INTERFACES"]
        );
        assert_eq!(findings[0].severity, FindingSeverity::Critical);
    }

    #[test]
    fn test_short_password_is_weak() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = sound_config(tmp.path());
        cfg.relay_password = Some("abc".to_string());

        let findings = audit_config(&cfg);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "WEAK_PASSWORD");
        assert_eq!(findings[0].severity, FindingSeverity::Medium);
    }
}
