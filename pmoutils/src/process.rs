//! Process and socket inspection built on `sysinfo` and `netstat2`.
//!
//! These functions are blocking: they walk the whole process table. The
//! async [`SystemOsAdapter`](crate::SystemOsAdapter) runs them on the
//! blocking pool.

use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};
use sysinfo::{Pid, ProcessStatus, Signal, System};

/// Information about a process bound to a network port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPortInfo {
    pub pid: u32,
    pub process_name: String,
    pub owner: String,
    pub port: u16,
}

/// A live process as seen in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    /// Full command line, program first.
    pub cmd: Vec<String>,
    /// Seconds since the process started.
    pub run_time_secs: u64,
}

impl ProcessEntry {
    /// True if any argument of the command line contains `needle`.
    pub fn cmd_contains(&self, needle: &str) -> bool {
        self.cmd.iter().any(|arg| arg.contains(needle))
    }
}

/// Transport protocol used for the port lookup.
#[derive(Debug, Clone, Copy)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// Finds the process listening on `port` for the given protocol.
pub fn find_process_using_port(port: u16, protocol: TransportProtocol) -> Option<ProcessPortInfo> {
    let proto_flag = match protocol {
        TransportProtocol::Tcp => ProtocolFlags::TCP,
        TransportProtocol::Udp => ProtocolFlags::UDP,
    };

    let sockets = get_sockets_info(
        AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
        proto_flag,
    )
    .ok()?;

    let mut system = System::new();
    system.refresh_processes();

    for socket in sockets {
        let local_port = match socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(ref tcp) => tcp.local_port,
            ProtocolSocketInfo::Udp(ref udp) => udp.local_port,
        };
        if local_port != port {
            continue;
        }
        if let Some(info) = build_port_info(&system, port, socket.associated_pids.first()) {
            return Some(info);
        }
    }

    None
}

fn build_port_info(system: &System, port: u16, pid_opt: Option<&u32>) -> Option<ProcessPortInfo> {
    let pid = *pid_opt?;
    let process = system.process(Pid::from_u32(pid))?;

    let owner = process
        .user_id()
        .and_then(|uid| {
            users::get_user_by_uid(**uid).map(|user| user.name().to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string());

    Some(ProcessPortInfo {
        pid,
        process_name: process.name().to_string(),
        owner,
        port,
    })
}

/// Lists live processes whose executable name matches `name`.
///
/// The comparison ignores ASCII case and a trailing `.exe`, so `icecast`
/// matches `Icecast.exe` on Windows.
pub fn list_processes_by_name(name: &str) -> Vec<ProcessEntry> {
    let wanted = normalize_process_name(name);
    let mut system = System::new();
    system.refresh_processes();

    let mut entries: Vec<ProcessEntry> = system
        .processes()
        .values()
        .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .filter(|p| normalize_process_name(p.name()) == wanted)
        .map(|p| ProcessEntry {
            pid: p.pid().as_u32(),
            name: p.name().to_string(),
            cmd: p.cmd().to_vec(),
            run_time_secs: p.run_time(),
        })
        .collect();
    entries.sort_by_key(|e| e.pid);
    entries
}

/// True if `pid` names a process that is neither dead nor a zombie.
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return false;
    }
    match system.process(sys_pid) {
        Some(p) => !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Asks a process to terminate.
///
/// Sends `SIGTERM` where the platform supports it, a hard kill otherwise.
/// Returns `false` when the process no longer exists.
pub fn terminate_process(pid: u32) -> bool {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return false;
    }
    match system.process(sys_pid) {
        Some(p) => match p.kill_with(Signal::Term) {
            Some(sent) => sent,
            None => p.kill(),
        },
        None => false,
    }
}

fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_process_name() {
        assert_eq!(normalize_process_name("Icecast.EXE"), "icecast");
        assert_eq!(normalize_process_name("icecast2"), "icecast2");
        assert_eq!(normalize_process_name(" ffmpeg "), "ffmpeg");
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_cmd_contains() {
        let entry = ProcessEntry {
            pid: 1,
            name: "ffmpeg".into(),
            cmd: vec!["ffmpeg".into(), "icecast://source:pw@localhost:8000/mic_1".into()],
            run_time_secs: 0,
        };
        assert!(entry.cmd_contains("/mic_1"));
        assert!(!entry.cmd_contains("/mic_2"));
    }
}
