use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use autoflow_scheduler::SchedulerConfig;

/// CLI settings, merged from an optional `autoflow.toml` and `AUTOFLOW_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Workers shared by every batch.
    pub global_workers: usize,
    /// How long finished entries stay queryable in memory, as a humantime
    /// string ("30s", "5m").
    pub terminal_linger: String,
    /// Where durable batch and execution records are written.
    pub state_dir: Option<PathBuf>,
    /// Event hub channel capacity.
    pub event_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            global_workers: 4,
            terminal_linger: "30s".to_string(),
            state_dir: None,
            event_capacity: 256,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();
        match config_path {
            Some(path) => {
                builder = builder.add_source(File::from(path.clone()));
            }
            None => {
                builder = builder.add_source(File::with_name("autoflow").required(false));
            }
        }
        let settings = builder
            .add_source(Environment::with_prefix("AUTOFLOW").try_parsing(true))
            .build()
            .context("failed to load configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(settings)
    }

    pub fn terminal_linger(&self) -> Result<Duration> {
        humantime::parse_duration(&self.terminal_linger)
            .with_context(|| format!("invalid terminal_linger '{}'", self.terminal_linger))
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(path) => path.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("autoflow"),
        }
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            global_workers: self.global_workers.max(1),
            terminal_linger: self.terminal_linger()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let settings = Settings::default();
        assert_eq!(settings.terminal_linger().unwrap(), Duration::from_secs(30));
        assert_eq!(settings.global_workers, 4);
    }
}
