//! Classification of worker failures
//!
//! [`diagnose`] maps an exit code, the tail of the worker's stderr and the
//! connection context to a [`DiagnosisResult`]. It never touches the host, so
//! every rule is testable with literal inputs.
//!
//! Exit codes are first brought to one signed 32-bit form: some platforms
//! report `-5` as its unsigned twin `4294967291`.

use serde::{Deserialize, Serialize};
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisCategory {
    Connection,
    Authentication,
    Mountpoint,
    Device,
    Permission,
    Configuration,
    Network,
    Process,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisResult {
    pub category: DiagnosisCategory,
    pub severity: DiagnosisSeverity,
    pub title: String,
    pub solutions: Vec<String>,
    /// Exit code after normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Last meaningful stderr line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DiagnosisResult {
    /// One-line form stored in a record's `lastError`.
    pub fn summary(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{}: {}", self.title, detail),
            None => self.title.clone(),
        }
    }
}

/// What was known about the connection when the worker failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosisContext {
    /// Port currently configured on the broadcast server.
    pub icecast_port: Option<u16>,
    /// Port the worker was launched against.
    pub port: Option<u16>,
    pub host: Option<String>,
    pub device_id: Option<String>,
    pub mount: Option<String>,
}

impl DiagnosisContext {
    fn port_label(&self) -> String {
        match self.icecast_port.or(self.port) {
            Some(port) => port.to_string(),
            None => "its configured port".to_string(),
        }
    }

    fn host_label(&self) -> &str {
        self.host.as_deref().unwrap_or("the broadcast host")
    }

    fn device_label(&self) -> &str {
        self.device_id.as_deref().unwrap_or("the capture device")
    }

    fn mount_label(&self) -> String {
        match &self.mount {
            Some(mount) => format!("/{}", mount.trim_start_matches('/')),
            None => "the mountpoint".to_string(),
        }
    }
}

/// Signed exit code meaning "could not reach the server" (`EIO`).
pub const CONNECTION_FAILURE_CODE: i64 = -5;

/// Brings an exit code to its signed 32-bit value.
///
/// Values in `2^31 ..= 2^32 - 1` are the unsigned spelling of a negative
/// code; anything else is returned unchanged.
pub fn normalize_exit_code(code: i64) -> i64 {
    const TWO_POW_31: i64 = 1 << 31;
    const TWO_POW_32: i64 = 1 << 32;
    if (TWO_POW_31..TWO_POW_32).contains(&code) {
        code - TWO_POW_32
    } else {
        code
    }
}

struct Rule {
    codes: &'static [i64],
    needles: &'static [&'static str],
    build: fn(&DiagnosisContext) -> (DiagnosisCategory, DiagnosisSeverity, String, Vec<String>),
}

const REFUSAL_NEEDLES: &[&str] = &["connection refused", "econnrefused", "refused the connection"];

/// Rules after the two connection rules, checked in order.
const RULES: &[Rule] = &[
    Rule {
        codes: &[],
        needles: &["401 unauthorized", "unauthorized", "http error 401", "server returned 401"],
        build: |ctx| {
            (
                DiagnosisCategory::Authentication,
                DiagnosisSeverity::Critical,
                "The broadcast server rejected the source password".to_string(),
                vec![
                    "Check that authentication/source-password in icecast.xml matches the password used by the worker".to_string(),
                    format!("Restart the broadcast server after editing icecast.xml, then restart the stream on {}", ctx.mount_label()),
                ],
            )
        },
    },
    Rule {
        codes: &[],
        needles: &["403 forbidden", "mountpoint in use", "http error 403", "server returned 403", "already in use"],
        build: |ctx| {
            (
                DiagnosisCategory::Mountpoint,
                DiagnosisSeverity::Error,
                format!("Mountpoint {} is already taken", ctx.mount_label()),
                vec![
                    format!("Stop the other source connected to {}", ctx.mount_label()),
                    "Check the broadcast server source limit; the server refuses new mounts when it is reached".to_string(),
                    "Rename the stream to obtain a new mountpoint".to_string(),
                ],
            )
        },
    },
    Rule {
        codes: &[-2, -19],
        needles: &["no such device", "could not find audio", "cannot open audio device", "audio device not found", "error opening input"],
        build: |ctx| {
            (
                DiagnosisCategory::Device,
                DiagnosisSeverity::Error,
                format!("Capture device {} was not found", ctx.device_label()),
                vec![
                    format!("Check that {} is plugged in and enabled", ctx.device_label()),
                    "Refresh the device list and select the device again".to_string(),
                ],
            )
        },
    },
    Rule {
        codes: &[-16],
        needles: &["device or resource busy"],
        build: |ctx| {
            (
                DiagnosisCategory::Device,
                DiagnosisSeverity::Error,
                format!("Capture device {} is busy", ctx.device_label()),
                vec![
                    "Close the other application or stream using the device".to_string(),
                    "Select a different capture device".to_string(),
                ],
            )
        },
    },
    Rule {
        codes: &[-1, -13],
        needles: &["permission denied", "operation not permitted", "access is denied"],
        build: |ctx| {
            (
                DiagnosisCategory::Permission,
                DiagnosisSeverity::Error,
                format!("Permission denied while opening {}", ctx.device_label()),
                vec![
                    "Grant the control plane user access to the audio devices (e.g. the 'audio' group)".to_string(),
                    "Check the operating system microphone privacy settings".to_string(),
                ],
            )
        },
    },
    Rule {
        codes: &[-22],
        needles: &["invalid argument", "unrecognized option", "error splitting the argument list", "option not found"],
        build: |_| {
            (
                DiagnosisCategory::Configuration,
                DiagnosisSeverity::Error,
                "The worker rejected its command line".to_string(),
                vec![
                    "Check streams.worker.args in the configuration file".to_string(),
                    "Check that the installed encoder supports the selected bitrate".to_string(),
                ],
            )
        },
    },
    Rule {
        codes: &[-101, -104, -110, -111, -113],
        needles: &["network is unreachable", "connection reset", "connection timed out", "no route to host", "broken pipe"],
        build: |ctx| {
            (
                DiagnosisCategory::Network,
                DiagnosisSeverity::Critical,
                format!("Network error while streaming to {}:{}", ctx.host_label(), ctx.port_label()),
                vec![
                    format!("Check that {} is reachable from this machine", ctx.host_label()),
                    format!("Make sure no firewall blocks TCP port {}", ctx.port_label()),
                    "Restart the stream once the network is back".to_string(),
                ],
            )
        },
    },
];

/// Classifies a worker exit.
///
/// `exit_code` is `None` when no code is available (e.g. killed by a
/// signal). The result always carries a title and at least one solution.
pub fn diagnose(exit_code: Option<i64>, stderr: &str, ctx: &DiagnosisContext) -> DiagnosisResult {
    let code = exit_code.map(normalize_exit_code);
    let haystack = stderr.to_lowercase();
    let detail = last_line(stderr);

    let result = |(category, severity, title, solutions)| DiagnosisResult {
        category,
        severity,
        title,
        solutions,
        exit_code: code,
        detail: detail.clone(),
    };

    if code == Some(CONNECTION_FAILURE_CODE) {
        return result(connection_failure(ctx));
    }

    if REFUSAL_NEEDLES.iter().any(|n| haystack.contains(n)) {
        return result(connection_refused(ctx));
    }

    for rule in RULES {
        let code_match = code.is_some_and(|c| rule.codes.contains(&c));
        let text_match = rule.needles.iter().any(|n| haystack.contains(n));
        if code_match || text_match {
            return result((rule.build)(ctx));
        }
    }

    result(unknown_failure(code, ctx))
}

/// Classifies a worker that was killed by a signal.
///
/// Stderr patterns still win; otherwise the signal itself is reported.
pub fn diagnose_signal(signal: i32, stderr: &str, ctx: &DiagnosisContext) -> DiagnosisResult {
    let mut diagnosis = diagnose(None, stderr, ctx);
    if diagnosis.category == DiagnosisCategory::Unknown {
        diagnosis.category = DiagnosisCategory::Process;
        diagnosis.title = format!("The worker was terminated by signal {}", signal);
        diagnosis.solutions = vec![
            "Check whether another program or the system (out-of-memory killer) stopped the encoder".to_string(),
            "Restart the stream".to_string(),
        ];
    }
    diagnosis
}

/// Classifies a worker that could not be spawned at all.
pub fn diagnose_spawn_failure(program: &str, error: &io::Error) -> DiagnosisResult {
    let (title, solutions) = match error.kind() {
        io::ErrorKind::NotFound => (
            format!("Worker program '{}' was not found", program),
            vec![
                format!("Install {} and make sure it is on the PATH", program),
                "Or set streams.worker.program to the full path of the encoder".to_string(),
            ],
        ),
        io::ErrorKind::PermissionDenied => (
            format!("Worker program '{}' is not executable", program),
            vec![format!("Check the permissions of {}", program)],
        ),
        _ => (
            format!("Worker program '{}' could not be started", program),
            vec!["Check the system logs and the worker configuration".to_string()],
        ),
    };
    DiagnosisResult {
        category: DiagnosisCategory::Process,
        severity: DiagnosisSeverity::Critical,
        title,
        solutions,
        exit_code: None,
        detail: Some(error.to_string()),
    }
}

/// Record that was running before a control plane restart but whose worker
/// is gone, or an adopted worker that disappeared.
pub fn diagnose_lost_worker(ctx: &DiagnosisContext) -> DiagnosisResult {
    DiagnosisResult {
        category: DiagnosisCategory::Process,
        severity: DiagnosisSeverity::Error,
        title: "The worker is no longer running".to_string(),
        solutions: vec![
            "The encoder stopped while the control plane was not watching it".to_string(),
            format!("Check that {} is still connected, then start the stream again", ctx.device_label()),
        ],
        exit_code: None,
        detail: None,
    }
}

/// The worker could not be configured because the broadcast server
/// configuration is unusable.
pub fn diagnose_config_failure(message: &str) -> DiagnosisResult {
    DiagnosisResult {
        category: DiagnosisCategory::Configuration,
        severity: DiagnosisSeverity::Critical,
        title: "The broadcast server configuration cannot be used by workers".to_string(),
        solutions: vec![
            "Run the configuration check of the broadcast server and fix the reported errors".to_string(),
            "Make sure icecast.xml defines a listen-socket port and a source password".to_string(),
        ],
        exit_code: None,
        detail: Some(message.to_string()),
    }
}

/// The stream registry refused a write while a worker was coming up.
pub fn diagnose_registry_failure(message: &str) -> DiagnosisResult {
    DiagnosisResult {
        category: DiagnosisCategory::Permission,
        severity: DiagnosisSeverity::Critical,
        title: "The stream registry could not be written".to_string(),
        solutions: vec![
            "Check the free space and the write permission of the streams directory".to_string(),
            "Start the stream again once the registry is writable".to_string(),
        ],
        exit_code: None,
        detail: Some(message.to_string()),
    }
}

fn connection_failure(ctx: &DiagnosisContext) -> (DiagnosisCategory, DiagnosisSeverity, String, Vec<String>) {
    let port = ctx.port_label();
    (
        DiagnosisCategory::Connection,
        DiagnosisSeverity::Critical,
        "The worker could not connect to the broadcast server".to_string(),
        vec![
            format!("Check that Icecast is running and listening on port {}", port),
            format!("Check that {} accepts connections on port {}", ctx.host_label(), port),
            format!("Make sure no firewall blocks TCP port {}", port),
            "Start the broadcast server from the dashboard, then restart this stream".to_string(),
        ],
    )
}

fn connection_refused(ctx: &DiagnosisContext) -> (DiagnosisCategory, DiagnosisSeverity, String, Vec<String>) {
    let port = ctx.port_label();
    (
        DiagnosisCategory::Connection,
        DiagnosisSeverity::Critical,
        "The broadcast server refused the connection".to_string(),
        vec![
            format!("Start Icecast or check that it listens on port {}", port),
            format!("Check that the bind-address of icecast.xml allows connections to {}", ctx.host_label()),
        ],
    )
}

fn unknown_failure(code: Option<i64>, ctx: &DiagnosisContext) -> (DiagnosisCategory, DiagnosisSeverity, String, Vec<String>) {
    let title = match code {
        Some(c) => format!("The worker stopped unexpectedly (exit code {})", c),
        None => "The worker stopped unexpectedly".to_string(),
    };
    (
        DiagnosisCategory::Unknown,
        DiagnosisSeverity::Error,
        title,
        vec![
            format!("Check that {} is still connected", ctx.device_label()),
            "Read the worker log of this stream for the encoder's own message".to_string(),
            "Restart the stream".to_string(),
        ],
    )
}

fn last_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
