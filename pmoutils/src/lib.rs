//! Host-level utilities for PMOCast.
//!
//! - [`OsAdapter`] / [`SystemOsAdapter`]: process table, port probes, service
//!   manager, termination and detached launches
//! - [`poll_until`]: the cancellable poll-with-timeout used by every
//!   verification window
//! - network helpers ([`guess_local_ip`], [`lan_addresses`])

mod ip_utils;
pub mod os_adapter;
pub mod poll;
pub mod process;

pub use ip_utils::{guess_local_ip, is_loopback_bind, is_wildcard_bind, lan_addresses};
pub use os_adapter::{LaunchCommand, OsAdapter, ServiceAction, ServiceStatus, SystemOsAdapter};
pub use poll::{PollOutcome, PollPolicy, poll_until};
pub use process::{ProcessEntry, ProcessPortInfo};

/// Returns a string describing the operating system and its version.
///
/// # Format
/// - macOS: "Macos/15.1"
/// - Linux: "Ubuntu/22.04"
/// - Windows: "Windows/10.0.19045"
/// - unknown version: "{OS}/Unknown"
pub fn get_os_string() -> String {
    let info = os_info::get();
    let os_type = format!("{:?}", info.os_type());

    let version = info.version();
    if version != &os_info::Version::Unknown {
        format!("{}/{}", os_type, version)
    } else {
        format!("{}/Unknown", os_type)
    }
}
