use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::OrchestratorSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs are kept in memory only.
    pub database_url: Option<String>,

    /// HS256 secret used to verify caller bearer tokens
    pub jwt_secret: String,

    /// Maximum number of pending (not yet started) jobs
    #[serde(default = "default_max_pending_jobs")]
    pub max_pending_jobs: usize,

    /// Minimum gap between progress events of one job
    #[serde(default = "default_progress_min_interval_ms")]
    pub progress_min_interval_ms: u64,

    /// Events buffered per progress observer before it is dropped
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,

    /// Generator program run once per job
    pub generator_command: String,

    /// Extra generator arguments, whitespace separated
    #[serde(default)]
    pub generator_args: Option<String>,

    /// Directory receiving generated audio
    #[serde(default = "default_audio_output_dir")]
    pub audio_output_dir: PathBuf,

    /// Upper bound for history page size
    #[serde(default = "default_history_max_page_size")]
    pub history_max_page_size: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_pending_jobs() -> usize {
    32
}

fn default_progress_min_interval_ms() -> u64 {
    250
}

fn default_observer_buffer() -> usize {
    256
}

fn default_audio_output_dir() -> PathBuf {
    PathBuf::from("./data/audio")
}

fn default_history_max_page_size() -> u32 {
    100
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn generator_args(&self) -> Vec<String> {
        self.generator_args
            .as_deref()
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_pending: self.max_pending_jobs,
            observer_buffer: self.observer_buffer,
            progress_interval: Duration::from_millis(self.progress_min_interval_ms),
            output_dir: self.audio_output_dir.clone(),
            history_max_page_size: self.history_max_page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut vars = vec![
            ("JWT_SECRET".to_string(), "secret".to_string()),
            ("GENERATOR_COMMAND".to_string(), "/usr/bin/generate".to_string()),
        ];
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        vars
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = assert_ok!(envy::from_iter(vars(&[])));
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert_eq!(config.max_pending_jobs, 32);
        assert!(config.generator_args().is_empty());

        let settings = config.orchestrator_settings();
        assert_eq!(settings.progress_interval, Duration::from_millis(250));
        assert_eq!(settings.output_dir, PathBuf::from("./data/audio"));
    }

    #[test]
    fn test_overrides_and_args() {
        let config: AppConfig = envy::from_iter(vars(&[
            ("MAX_PENDING_JOBS", "4"),
            ("GENERATOR_ARGS", "--model ./ckpt  --fp16"),
            ("DATABASE_URL", "postgres://localhost/songsmith"),
        ]))
        .unwrap();
        assert_eq!(config.max_pending_jobs, 4);
        assert_eq!(config.generator_args(), vec!["--model", "./ckpt", "--fp16"]);
        assert!(config.database_url.is_some());
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        let result: Result<AppConfig, _> = envy::from_iter(vec![(
            "GENERATOR_COMMAND".to_string(),
            "/usr/bin/generate".to_string(),
        )]);
        assert_err!(result);
    }
}
