//! Extension pour lire les réglages Icecast depuis pmoconfig
//!
//! Ce module fournit le trait `IcecastConfigExt` qui ajoute à
//! `pmoconfig::Config` la lecture de la section `icecast`.

use crate::installation::default_search_paths;
use pmoconfig::Config;
use pmoutils::PollPolicy;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_START_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_RESTART_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;

/// Réglages du contrôleur Icecast
#[derive(Debug, Clone)]
pub struct IcecastSettings {
    /// Racines d'installation examinées dans l'ordre
    pub search_paths: Vec<PathBuf>,
    /// Nom du service système; vide = lancement direct de l'exécutable
    pub service_name: Option<String>,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub restart_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for IcecastSettings {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            service_name: None,
            start_timeout: Duration::from_millis(DEFAULT_START_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            restart_timeout: Duration::from_millis(DEFAULT_RESTART_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
        }
    }
}

impl IcecastSettings {
    pub fn start_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.start_timeout)
    }

    pub fn stop_policy(&self) -> PollPolicy {
        PollPolicy::new(self.poll_interval, self.stop_timeout)
    }
}

/// Trait d'extension pour la section `icecast` de pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::Config;
/// use pmoicecast::IcecastConfigExt;
///
/// let config = Config::load_config("")?;
/// let settings = config.get_icecast_settings();
/// ```
pub trait IcecastConfigExt {
    /// Lit tous les réglages Icecast, valeurs par défaut comprises
    fn get_icecast_settings(&self) -> IcecastSettings;

    /// Définit les racines d'installation à examiner
    fn set_icecast_search_paths(&self, paths: Vec<String>) -> anyhow::Result<()>;
}

impl IcecastConfigExt for Config {
    fn get_icecast_settings(&self) -> IcecastSettings {
        let configured: Vec<PathBuf> = self
            .get_string_list(&["icecast", "search_paths"])
            .into_iter()
            .map(PathBuf::from)
            .collect();

        IcecastSettings {
            search_paths: if configured.is_empty() {
                default_search_paths()
            } else {
                configured
            },
            service_name: self.get_string(&["icecast", "service_name"]),
            start_timeout: Duration::from_millis(
                self.get_u64_or(&["icecast", "start_timeout_ms"], DEFAULT_START_TIMEOUT_MS),
            ),
            stop_timeout: Duration::from_millis(
                self.get_u64_or(&["icecast", "stop_timeout_ms"], DEFAULT_STOP_TIMEOUT_MS),
            ),
            restart_timeout: Duration::from_millis(
                self.get_u64_or(&["icecast", "restart_timeout_ms"], DEFAULT_RESTART_TIMEOUT_MS),
            ),
            poll_interval: Duration::from_millis(
                self.get_u64_or(&["icecast", "poll_interval_ms"], DEFAULT_POLL_INTERVAL_MS),
            ),
            probe_timeout: Duration::from_millis(
                self.get_u64_or(&["icecast", "probe_timeout_ms"], DEFAULT_PROBE_TIMEOUT_MS),
            ),
            health_interval: Duration::from_secs(
                self.get_u64_or(&["icecast", "health_interval_secs"], DEFAULT_HEALTH_INTERVAL_SECS),
            ),
        }
    }

    fn set_icecast_search_paths(&self, paths: Vec<String>) -> anyhow::Result<()> {
        let value = serde_yaml::Value::Sequence(
            paths.into_iter().map(serde_yaml::Value::String).collect(),
        );
        self.set_value(&["icecast", "search_paths"], value)
    }
}
