//! HTTP probe of the Icecast status page
//!
//! The controller only needs "fetch this URL within a deadline". The seam is
//! a trait so controller tests can script responses; [`ReqwestProbe`] is the
//! production client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Path of the machine-readable status page served by Icecast 2.4+.
pub const STATUS_JSON_PATH: &str = "/status-json.xsl";

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// GET `url`; transport failures and timeouts are reported as `Err`.
    async fn get(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, String>;
}

/// [`HttpProbe`] over reqwest.
#[derive(Debug, Clone, Default)]
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(&self, url: &str, timeout: Duration) -> Result<ProbeResponse, String> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(ProbeResponse {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}

/// Figures extracted from `status-json.xsl`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub server_id: Option<String>,
    pub server_start: Option<String>,
    pub listeners: u32,
    pub mounts: Vec<MountStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct MountStats {
    pub mount: String,
    pub listeners: u32,
}

/// Parses the JSON status document.
///
/// Icecast emits `source` as an object for a single mount, an array for
/// several, and omits it when nothing is connected.
pub fn parse_status_json(body: &str) -> Option<ServerStats> {
    let root: Value = serde_json::from_str(body).ok()?;
    let icestats = root.get("icestats")?;

    let sources: Vec<&Value> = match icestats.get("source") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    };

    let mounts: Vec<MountStats> = sources
        .into_iter()
        .map(|source| MountStats {
            mount: source
                .get("listenurl")
                .and_then(Value::as_str)
                .map(mount_from_listen_url)
                .unwrap_or_default(),
            listeners: source
                .get("listeners")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        })
        .collect();

    Some(ServerStats {
        server_id: icestats
            .get("server_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        server_start: icestats
            .get("server_start_iso8601")
            .and_then(Value::as_str)
            .map(str::to_string),
        listeners: mounts.iter().map(|m| m.listeners).sum(),
        mounts,
    })
}

fn mount_from_listen_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match without_scheme.find('/') {
        Some(idx) => without_scheme[idx..].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_single_source_object() {
        let body = r#"{"icestats":{"admin":"icemaster@localhost","server_id":"Icecast 2.4.4",
            "server_start_iso8601":"2024-03-01T10:00:00+0100",
            "source":{"listenurl":"http://studio.lan:8000/kitchen","listeners":3}}}"#;

        let stats = parse_status_json(body).unwrap();
        assert_eq!(stats.server_id.as_deref(), Some("Icecast 2.4.4"));
        assert_eq!(stats.listeners, 3);
        assert_eq!(stats.mounts[0].mount, "/kitchen");
    }

    #[test]
    fn test_source_array_and_missing_source() {
        let body = r#"{"icestats":{"source":[
            {"listenurl":"http://h:8000/a","listeners":1},
            {"listenurl":"http://h:8000/b","listeners":2}]}}"#;
        let stats = parse_status_json(body).unwrap();
        assert_eq!(stats.mounts.len(), 2);
        assert_eq!(stats.listeners, 3);

        let idle = parse_status_json(r#"{"icestats":{"server_id":"Icecast"}}"#).unwrap();
        assert!(idle.mounts.is_empty());
        assert_eq!(idle.listeners, 0);
    }

    #[test]
    fn test_not_a_status_document() {
        assert!(parse_status_json("<html>Icecast</html>").is_none());
        assert!(parse_status_json(r#"{"other":1}"#).is_none());
    }

    #[tokio::test]
    async fn test_reqwest_probe_reads_status_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STATUS_JSON_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"icestats":{"server_id":"Icecast 2.4.4"}}"#),
            )
            .mount(&server)
            .await;

        let probe = ReqwestProbe::new();
        let url = format!("{}{}", server.uri(), STATUS_JSON_PATH);
        let response = probe.get(&url, Duration::from_secs(2)).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(parse_status_json(&response.body).is_some());
    }

    #[tokio::test]
    async fn test_reqwest_probe_reports_transport_failure() {
        let probe = ReqwestProbe::new();
        let result = probe
            .get("http://127.0.0.1:1/status-json.xsl", Duration::from_millis(500))
            .await;
        assert!(result.is_err());
    }
}
