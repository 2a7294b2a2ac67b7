//! Typed view of `icecast.xml`
//!
//! The raw document is deserialized with quick-xml into loose string fields,
//! then converted into [`IcecastConfig`]. Values that fail conversion are kept
//! as `None` and reported in [`IcecastConfig::issues`], so validation can name
//! them instead of the whole parse failing.

use crate::error::{IcecastError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "icecast.xml";

/// Default password shipped with every Icecast distribution.
pub const FACTORY_PASSWORD: &str = "hackme";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    admin: Option<String>,
    #[serde(default)]
    limits: Option<RawLimits>,
    #[serde(default)]
    authentication: Option<RawAuthentication>,
    #[serde(default, rename = "listen-socket")]
    listen_sockets: Vec<RawListenSocket>,
    #[serde(default)]
    paths: Option<RawPaths>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawLimits {
    #[serde(default)]
    clients: Option<String>,
    #[serde(default)]
    sources: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawAuthentication {
    #[serde(default)]
    source_password: Option<String>,
    #[serde(default)]
    relay_password: Option<String>,
    #[serde(default)]
    admin_user: Option<String>,
    #[serde(default)]
    admin_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawListenSocket {
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    bind_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawPaths {
    #[serde(default)]
    basedir: Option<String>,
    #[serde(default)]
    logdir: Option<String>,
    #[serde(default)]
    webroot: Option<String>,
    #[serde(default)]
    adminroot: Option<String>,
}

/// A `<listen-socket>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSocket {
    pub port: u16,
    pub bind_address: Option<String>,
}

/// Parsed Icecast configuration.
#[derive(Debug, Clone, Default)]
pub struct IcecastConfig {
    pub path: PathBuf,
    pub hostname: Option<String>,
    pub admin_email: Option<String>,
    /// `<limits><sources>`: maximum concurrent source connections.
    pub source_limit: Option<u32>,
    pub client_limit: Option<u32>,
    pub source_password: Option<String>,
    pub relay_password: Option<String>,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub listen_sockets: Vec<ListenSocket>,
    pub log_dir: Option<PathBuf>,
    pub web_root: Option<PathBuf>,
    pub admin_root: Option<PathBuf>,
    /// Values present in the file that could not be converted.
    pub issues: Vec<String>,
}

impl IcecastConfig {
    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path).map_err(|e| IcecastError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_xml(&xml, path)
    }

    /// Parses the XML text of `path`.
    ///
    /// Relative directories are resolved against `<basedir>` when present,
    /// otherwise against the folder holding the file.
    pub fn from_xml(xml: &str, path: &Path) -> Result<Self> {
        let raw: RawConfig =
            quick_xml::de::from_str(xml).map_err(|e| IcecastError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut issues = Vec::new();
        let limits = raw.limits.unwrap_or_default();
        let auth = raw.authentication.unwrap_or_default();
        let paths = raw.paths.unwrap_or_default();

        let source_limit = parse_number::<u32>(limits.sources, "limits/sources", &mut issues);
        let client_limit = parse_number::<u32>(limits.clients, "limits/clients", &mut issues);

        let listen_sockets = raw
            .listen_sockets
            .into_iter()
            .filter_map(|socket| {
                let port = parse_number::<u16>(socket.port, "listen-socket/port", &mut issues)?;
                Some(ListenSocket {
                    port,
                    bind_address: non_empty(socket.bind_address),
                })
            })
            .collect();

        let file_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let base_dir = match non_empty(paths.basedir) {
            Some(basedir) => file_dir.join(basedir),
            None => file_dir.to_path_buf(),
        };
        let resolve = |value: Option<String>| non_empty(value).map(|v| base_dir.join(v));

        Ok(Self {
            path: path.to_path_buf(),
            hostname: non_empty(raw.hostname),
            admin_email: non_empty(raw.admin),
            source_limit,
            client_limit,
            source_password: trimmed(auth.source_password),
            relay_password: trimmed(auth.relay_password),
            admin_user: trimmed(auth.admin_user),
            admin_password: trimmed(auth.admin_password),
            listen_sockets,
            log_dir: resolve(paths.logdir),
            web_root: resolve(paths.webroot),
            admin_root: resolve(paths.adminroot),
            issues,
        })
    }

    /// First listen socket, the one sources and the admin page are reached on.
    pub fn primary_socket(&self) -> Option<&ListenSocket> {
        self.listen_sockets.first()
    }

    pub fn port(&self) -> Option<u16> {
        self.primary_socket().map(|s| s.port)
    }

    pub fn bind_address(&self) -> Option<&str> {
        self.primary_socket().and_then(|s| s.bind_address.as_deref())
    }

    /// Address local clients use to reach the server.
    ///
    /// Wildcard or absent bind addresses map to the loopback address.
    pub fn local_host(&self) -> String {
        match self.bind_address() {
            Some(addr) if !pmoutils::is_wildcard_bind(addr) => addr.to_string(),
            _ => "127.0.0.1".to_string(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Passwords keep an empty value so the audit can flag it.
fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string())
}

fn parse_number<T: std::str::FromStr>(
    value: Option<String>,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<T> {
    let value = non_empty(value)?;
    match value.parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            issues.push(format!("{} is not a valid number: '{}'", field, value));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<icecast>
    <location>Earth</location>
    <admin>icemaster@localhost</admin>
    <limits>
        <clients>100</clients>
        <sources>4</sources>
        <queue-size>524288</queue-size>
    </limits>
    <authentication>
        <source-password>s3cret-source</source-password>
        <relay-password>hackme</relay-password>
        <admin-user>admin</admin-user>
        <admin-password>hackme</admin-password>
    </authentication>
    <hostname>studio.lan</hostname>
    <listen-socket>
        <port>8000</port>
        <!-- <bind-address>127.0.0.1</bind-address> -->
    </listen-socket>
    <mount type="normal">
        <mount-name>/example.ogg</mount-name>
    </mount>
    <listen-socket>
        <port>8443</port>
        <bind-address>192.168.1.10</bind-address>
    </listen-socket>
    <paths>
        <basedir>./</basedir>
        <logdir>./logs</logdir>
        <webroot>./web</webroot>
        <adminroot>./admin</adminroot>
        <alias source="/" destination="/status.xsl"/>
    </paths>
</icecast>"#;

    #[test]
    fn test_parse_full_document() {
        let cfg = IcecastConfig::from_xml(SAMPLE, Path::new("/srv/icecast/icecast.xml")).unwrap();

        assert_eq!(cfg.source_limit, Some(4));
        assert_eq!(cfg.client_limit, Some(100));
        assert_eq!(cfg.hostname.as_deref(), Some("studio.lan"));
        assert_eq!(cfg.source_password.as_deref(), Some("s3cret-source"));
        assert_eq!(cfg.admin_user.as_deref(), Some("admin"));
        assert_eq!(cfg.port(), Some(8000));
        assert_eq!(cfg.bind_address(), None);
        assert_eq!(cfg.listen_sockets.len(), 2);
        assert_eq!(cfg.listen_sockets[1].bind_address.as_deref(), Some("192.168.1.10"));
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/srv/icecast/logs")));
        assert!(cfg.issues.is_empty());
    }

    #[test]
    fn test_bad_numbers_are_reported_not_fatal() {
        let xml = "<icecast><limits><sources>many</sources></limits>\
                   <listen-socket><port>eighty</port></listen-socket></icecast>";
        let cfg = IcecastConfig::from_xml(xml, Path::new("icecast.xml")).unwrap();

        assert_eq!(cfg.source_limit, None);
        assert!(cfg.listen_sockets.is_empty());
        assert_eq!(cfg.issues.len(), 2);
        assert!(cfg.issues[0].contains("limits/sources"));
    }

    #[test]
    fn test_malformed_xml_is_a_parse_error() {
        let err = IcecastConfig::from_xml("<icecast><limits>", Path::new("icecast.xml"));
        assert!(matches!(err, Err(IcecastError::ConfigParse { .. })));
    }

    #[test]
    fn test_local_host_for_wildcard_and_explicit_bind() {
        let mut cfg = IcecastConfig::default();
        cfg.listen_sockets.push(ListenSocket {
            port: 8000,
            bind_address: Some("0.0.0.0".to_string()),
        });
        assert_eq!(cfg.local_host(), "127.0.0.1");

        cfg.listen_sockets[0].bind_address = Some("192.168.1.10".to_string());
        assert_eq!(cfg.local_host(), "192.168.1.10");
    }
}
