//! Extension pour lire les réglages des flux depuis pmoconfig
//!
//! Ce module fournit le trait `StreamsConfigExt` qui ajoute à
//! `pmoconfig::Config` la lecture de la section `streams`.

use crate::worker::WorkerTemplate;
use pmoconfig::Config;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STREAMS_DIR: &str = "streams";
const DEFAULT_REGISTRY_FILE: &str = "registry.json";
const DEFAULT_CONFIRM_WINDOW_MS: u64 = 3_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 5;
const DEFAULT_STDERR_TAIL_LINES: u64 = 40;

/// Réglages de l'orchestrateur de flux
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Fichier JSON du registre des flux
    pub registry_path: PathBuf,
    /// Durée pendant laquelle un worker doit survivre pour être `running`
    pub confirm_window: Duration,
    /// Délai d'arrêt gracieux avant de tuer le worker
    pub stop_timeout: Duration,
    /// Intervalle de sondage des processus adoptés pendant l'arrêt
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub stderr_tail_lines: usize,
    pub worker: WorkerTemplate,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from(DEFAULT_STREAMS_DIR).join(DEFAULT_REGISTRY_FILE),
            confirm_window: Duration::from_millis(DEFAULT_CONFIRM_WINDOW_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES as usize,
            worker: WorkerTemplate::default(),
        }
    }
}

/// Trait d'extension pour la section `streams` de pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::Config;
/// use pmostreams::StreamsConfigExt;
///
/// let config = Config::load_config("")?;
/// let settings = config.get_stream_settings()?;
/// println!("Registry: {}", settings.registry_path.display());
/// ```
pub trait StreamsConfigExt {
    /// Lit tous les réglages des flux
    ///
    /// Le répertoire `streams.directory` est créé s'il n'existe pas.
    fn get_stream_settings(&self) -> anyhow::Result<StreamSettings>;

    /// Définit le programme du worker (chemin complet ou nom dans le PATH)
    fn set_worker_program(&self, program: String) -> anyhow::Result<()>;
}

impl StreamsConfigExt for Config {
    fn get_stream_settings(&self) -> anyhow::Result<StreamSettings> {
        let dir = self.get_managed_dir(&["streams", "directory"], DEFAULT_STREAMS_DIR)?;
        let file = self
            .get_string(&["streams", "registry"])
            .unwrap_or_else(|| DEFAULT_REGISTRY_FILE.to_string());

        let program = self
            .get_string(&["streams", "worker", "program"])
            .unwrap_or_else(|| "ffmpeg".to_string());
        let args = self.get_string_list(&["streams", "worker", "args"]);
        let worker = if args.is_empty() {
            WorkerTemplate::ffmpeg(&program)
        } else {
            WorkerTemplate { program, args }
        };

        Ok(StreamSettings {
            registry_path: dir.join(file),
            confirm_window: Duration::from_millis(
                self.get_u64_or(&["streams", "confirm_window_ms"], DEFAULT_CONFIRM_WINDOW_MS),
            ),
            stop_timeout: Duration::from_millis(
                self.get_u64_or(&["streams", "stop_timeout_ms"], DEFAULT_STOP_TIMEOUT_MS),
            ),
            poll_interval: Duration::from_millis(
                self.get_u64_or(&["streams", "poll_interval_ms"], DEFAULT_POLL_INTERVAL_MS),
            ),
            reconcile_interval: Duration::from_secs(self.get_u64_or(
                &["streams", "reconcile_interval_secs"],
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )),
            stderr_tail_lines: self
                .get_u64_or(&["streams", "stderr_tail_lines"], DEFAULT_STDERR_TAIL_LINES)
                as usize,
            worker,
        })
    }

    fn set_worker_program(&self, program: String) -> anyhow::Result<()> {
        self.set_value(
            &["streams", "worker", "program"],
            serde_yaml::Value::String(program),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_embedded_config() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();

        let settings = config.get_stream_settings().unwrap();
        assert!(settings.registry_path.ends_with("streams/registry.json"));
        assert!(settings.registry_path.parent().unwrap().is_dir());
        assert_eq!(settings.confirm_window, Duration::from_secs(3));
        assert_eq!(settings.stderr_tail_lines, 40);
        assert_eq!(settings.worker, WorkerTemplate::ffmpeg("ffmpeg"));
    }

    #[test]
    fn test_custom_worker_program() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_config(tmp.path().to_str().unwrap()).unwrap();
        config
            .set_worker_program("/opt/ffmpeg/bin/ffmpeg".to_string())
            .unwrap();

        let settings = config.get_stream_settings().unwrap();
        assert_eq!(settings.worker.program, "/opt/ffmpeg/bin/ffmpeg");
        assert!(!settings.worker.args.is_empty());
    }
}
