//! Icecast installation detection
//!
//! A candidate root is inspected for the pieces an Icecast install ships
//! with. Every check is recorded, so a partial install is reported rather
//! than rejected with an error.

use crate::config_file::CONFIG_FILE_NAME;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(windows)]
const EXECUTABLE_NAMES: &[&str] = &["icecast.exe", "icecast2.exe"];
#[cfg(not(windows))]
const EXECUTABLE_NAMES: &[&str] = &["icecast", "icecast2"];

const LAUNCHER_NAMES: &[&str] = &["icecast.bat", "icecast.sh"];
const CONFIG_LOCATIONS: &[&str] = &[CONFIG_FILE_NAME, "etc/icecast.xml", "etc/icecast2/icecast.xml"];
const LOG_DIR_NAMES: &[&str] = &["log", "logs"];

/// Which installation pieces were found under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InstallationChecks {
    /// Server binary under `bin/`
    pub executable: bool,
    pub launcher: bool,
    pub config_file: bool,
    pub log_directory: bool,
}

impl InstallationChecks {
    fn passed(&self) -> usize {
        [self.executable, self.launcher, self.config_file, self.log_directory]
            .iter()
            .filter(|c| **c)
            .count()
    }
}

/// Result of scanning the candidate roots.
#[derive(Debug, Clone, Default, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InstallationReport {
    /// An executable and a configuration file were both found.
    pub installed: bool,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub installation_path: Option<PathBuf>,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub executable_path: Option<PathBuf>,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub launcher_path: Option<PathBuf>,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub config_path: Option<PathBuf>,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Option<String>))]
    pub log_directory: Option<PathBuf>,
    pub checks: InstallationChecks,
    #[cfg_attr(feature = "pmoserver", schema(value_type = Vec<String>))]
    pub searched: Vec<PathBuf>,
    pub notes: Vec<String>,
}

impl InstallationReport {
    /// Process name the server shows up as in the process table.
    pub fn process_name(&self) -> String {
        self.executable_path
            .as_deref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "icecast".to_string())
    }
}

/// Installation roots probed when none are configured.
pub fn default_search_paths() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        let mut roots = Vec::new();
        for var in ["ProgramFiles", "ProgramFiles(x86)"] {
            if let Ok(dir) = std::env::var(var) {
                roots.push(PathBuf::from(dir).join("Icecast"));
            }
        }
        roots.push(PathBuf::from(r"C:\Icecast"));
        roots
    }
    #[cfg(not(windows))]
    {
        vec![
            PathBuf::from("/usr/local/icecast"),
            PathBuf::from("/opt/icecast"),
            PathBuf::from("/usr/local"),
            PathBuf::from("/usr"),
        ]
    }
}

/// Scans `candidates` in order and keeps the best matching root.
///
/// The first root with both an executable and a configuration file wins.
/// Otherwise the root passing the most checks is reported with
/// `installed = false`.
pub fn detect_installation(candidates: &[PathBuf]) -> InstallationReport {
    let mut best: Option<InstallationReport> = None;

    for root in candidates {
        if !root.is_dir() {
            debug!(root = %root.display(), "Icecast candidate root does not exist");
            continue;
        }

        let report = inspect_root(root);
        debug!(
            root = %root.display(),
            executable = report.checks.executable,
            config = report.checks.config_file,
            "Inspected Icecast candidate root"
        );

        if report.installed {
            best = Some(report);
            break;
        }
        let better = best
            .as_ref()
            .map(|b| report.checks.passed() > b.checks.passed())
            .unwrap_or(report.checks.passed() > 0);
        if better {
            best = Some(report);
        }
    }

    let mut report = best.unwrap_or_default();
    report.searched = candidates.to_vec();
    report
}

fn inspect_root(root: &Path) -> InstallationReport {
    let mut notes = Vec::new();

    let executable_path = first_file(&root.join("bin"), EXECUTABLE_NAMES);
    if executable_path.is_none() {
        if let Some(misplaced) = first_file(root, EXECUTABLE_NAMES) {
            notes.push(format!(
                "{} sits at the installation root; the server binary is expected under bin/",
                misplaced.display()
            ));
        }
    }

    let launcher_path = first_file(root, LAUNCHER_NAMES);
    let config_path = first_file(root, CONFIG_LOCATIONS);
    let log_directory = LOG_DIR_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_dir());

    let checks = InstallationChecks {
        executable: executable_path.is_some(),
        launcher: launcher_path.is_some(),
        config_file: config_path.is_some(),
        log_directory: log_directory.is_some(),
    };

    InstallationReport {
        installed: checks.executable && checks.config_file,
        installation_path: Some(root.to_path_buf()),
        executable_path,
        launcher_path,
        config_path,
        log_directory,
        checks,
        searched: Vec::new(),
        notes,
    }
}

fn first_file(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| dir.join(name)).find(|p| p.is_file())
}
