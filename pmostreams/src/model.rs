//! Stream records and their input types

use crate::diagnostics::DiagnosisResult;
use crate::error::{Result, StreamError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bitrates (kbps) a worker may be asked to encode at.
pub const ALLOWED_BITRATES: [u32; 4] = [128, 192, 256, 320];

pub const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl StreamStatus {
    /// Holds (or is about to hold) a source slot on the broadcast server.
    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Starting | StreamStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Stopped => "stopped",
            StreamStatus::Starting => "starting",
            StreamStatus::Running => "running",
            StreamStatus::Stopping => "stopping",
            StreamStatus::Error => "error",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capture-device-to-mountpoint binding, as seen by API callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    /// Stable key, also the mountpoint name
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub bitrate: u32,
    pub status: StreamStatus,
    /// Worker pid, only while starting or running
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Full diagnosis of the last failure; not persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisResult>,
    pub created_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn new(id: String, config: &StreamConfig, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: config.name.trim().to_string(),
            device_id: config.device_id.trim().to_string(),
            bitrate: config.bitrate,
            status: StreamStatus::Stopped,
            pid: None,
            started_at: None,
            last_error: None,
            diagnosis: None,
            created_at,
        }
    }

    /// Mountpoint path on the broadcast server.
    pub fn mount(&self) -> String {
        format!("/{}", self.id)
    }

    pub fn config(&self) -> StreamConfig {
        StreamConfig {
            name: self.name.clone(),
            device_id: self.device_id.clone(),
            bitrate: self.bitrate,
        }
    }

    pub(crate) fn mark_error(&mut self, diagnosis: DiagnosisResult) {
        self.status = StreamStatus::Error;
        self.pid = None;
        self.started_at = None;
        self.last_error = Some(diagnosis.summary());
        self.diagnosis = Some(diagnosis);
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.status = StreamStatus::Stopped;
        self.pid = None;
        self.started_at = None;
    }
}

/// On-disk form of a [`StreamRecord`]: runtime fields are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredStream {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub bitrate: u32,
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&StreamRecord> for StoredStream {
    fn from(record: &StreamRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            device_id: record.device_id.clone(),
            bitrate: record.bitrate,
            status: record.status,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
        }
    }
}

impl From<StoredStream> for StreamRecord {
    fn from(stored: StoredStream) -> Self {
        Self {
            id: stored.id,
            name: stored.name,
            device_id: stored.device_id,
            bitrate: stored.bitrate,
            status: stored.status,
            pid: None,
            started_at: None,
            last_error: stored.last_error,
            diagnosis: None,
            created_at: stored.created_at,
        }
    }
}

/// Desired configuration of a new stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub name: String,
    pub device_id: String,
    pub bitrate: u32,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_device(&self.device_id)?;
        validate_bitrate(self.bitrate)
    }
}

/// Changes applied by `update_stream`; absent fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StreamPatch {
    pub name: Option<String>,
    pub device_id: Option<String>,
    pub bitrate: Option<u32>,
}

impl StreamPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.device_id.is_none() && self.bitrate.is_none()
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StreamError::Validation("name is required".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StreamError::Validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if slugify(name).is_empty() {
        return Err(StreamError::Validation(
            "name must contain at least one letter or digit".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_device(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(StreamError::Validation("deviceId is required".to_string()));
    }
    Ok(())
}

pub(crate) fn validate_bitrate(bitrate: u32) -> Result<()> {
    if !ALLOWED_BITRATES.contains(&bitrate) {
        return Err(StreamError::Validation(format!(
            "bitrate must be one of {:?}, got {}",
            ALLOWED_BITRATES, bitrate
        )));
    }
    Ok(())
}

/// Lowercase ASCII slug: runs of other characters collapse to one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Id of a stream created at `created_at`: `<slug>-<yyyymmddhhmmss>`.
pub fn derive_stream_id(name: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", slugify(name), created_at.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> StreamConfig {
        StreamConfig {
            name: "Main Hall (FR)".to_string(),
            device_id: "hw:1,0".to_string(),
            bitrate: 192,
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Main Hall (FR)"), "main-hall-fr");
        assert_eq!(slugify("  --Español--  "), "espa-ol");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_derive_stream_id() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 7).unwrap();
        assert_eq!(derive_stream_id("Main Hall (FR)", at), "main-hall-fr-20260314090507");
    }

    #[test]
    fn test_validation() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.bitrate = 160;
        assert!(matches!(cfg.validate(), Err(StreamError::Validation(_))));

        let mut cfg = config();
        cfg.name = "x".repeat(51);
        assert!(cfg.validate().is_err());
        cfg.name = "x".repeat(50);
        assert!(cfg.validate().is_ok());

        let mut cfg = config();
        cfg.device_id = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.name = "!!!".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_stored_form_drops_runtime_fields() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 7).unwrap();
        let mut record = StreamRecord::new("main-hall-fr-20260314090507".to_string(), &config(), at);
        record.status = StreamStatus::Running;
        record.pid = Some(4242);
        record.started_at = Some(at);

        let json = serde_json::to_value(StoredStream::from(&record)).unwrap();
        assert_eq!(json["deviceId"], "hw:1,0");
        assert_eq!(json["status"], "running");
        assert!(json.get("pid").is_none());
        assert!(json.get("startedAt").is_none());

        let back = StreamRecord::from(StoredStream::from(&record));
        assert_eq!(back.pid, None);
        assert_eq!(back.name, record.name);
        assert_eq!(back.mount(), "/main-hall-fr-20260314090507");
    }
}
