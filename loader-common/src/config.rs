//! Loader configuration and layered value resolution
//!
//! Values resolve in priority order: command-line flag, environment
//! variable, TOML config file, compiled default. The CLI layer handles the
//! first two; `fill_from_file` supplies the third.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::directive::DEFAULT_DIRECTIVE_KEY;
use crate::error::{Error, Result};

/// Subset of settings a config file may provide.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    data_source: Option<String>,
    entity_type: Option<String>,
}

/// Tuning and policy knobs shared by every subcommand.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Default `DATA_SOURCE` applied to records that lack one.
    pub data_source: Option<String>,
    /// Default `ENTITY_TYPE` applied to records that lack one.
    pub entity_type: Option<String>,
    /// JSON property carrying the per-record directive envelope.
    pub directive_key: String,
    /// Maximum depth of the internal work queue; the backpressure point.
    pub queue_depth: usize,
    /// Worker tasks per process.
    pub threads_per_process: usize,
    /// OS-level worker processes. The master counts as the first.
    pub processes: usize,
    /// Retries for a transient failure before it escalates.
    pub retry_limit: u32,
    /// Base delay between retries.
    pub retry_backoff: Duration,
    /// Randomize the retry delay to spread contention.
    pub randomize_backoff: bool,
    /// Treat a governor veto as process-fatal instead of routing the
    /// record to the failure sink.
    pub governor_fatal: bool,
    /// How many governor delays to honor per record. `None` is unbounded.
    pub governor_delay_limit: Option<u32>,
    /// Period between monitor reports.
    pub monitoring_period: Duration,
    /// Period between source heartbeats.
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight records to finish.
    pub shutdown_grace: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            data_source: None,
            entity_type: None,
            directive_key: DEFAULT_DIRECTIVE_KEY.to_string(),
            queue_depth: 10,
            threads_per_process: 4,
            processes: 1,
            retry_limit: 3,
            retry_backoff: Duration::from_secs(1),
            randomize_backoff: true,
            governor_fatal: false,
            governor_delay_limit: None,
            monitoring_period: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("queue depth must be at least 1".to_string()));
        }
        if self.threads_per_process == 0 {
            return Err(Error::Config(
                "threads per process must be at least 1".to_string(),
            ));
        }
        if self.processes == 0 {
            return Err(Error::Config("process count must be at least 1".to_string()));
        }
        if self.directive_key.is_empty() {
            return Err(Error::Config("directive key must not be empty".to_string()));
        }
        Ok(())
    }

    /// Fill `data_source`/`entity_type` from the config file when the CLI
    /// and environment left them unset.
    pub fn fill_from_file(&mut self) {
        let Ok(path) = config_file_path() else {
            return;
        };
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };
        let file: FileConfig = match toml::from_str(&content) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!("ignoring unparseable config file {}: {err}", path.display());
                return;
            }
        };

        if self.data_source.is_none() {
            self.data_source = file.data_source;
        }
        if self.entity_type.is_none() {
            self.entity_type = file.entity_type;
        }
    }
}

/// Locate the config file for the platform.
fn config_file_path() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/stream-loader/config.toml first, then /etc.
        let user_config = dirs::config_dir().map(|d| d.join("stream-loader").join("config.toml"));
        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        let system_config = PathBuf::from("/etc/stream-loader/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
        Err(Error::Config("no config file found".to_string()))
    } else {
        let path = dirs::config_dir()
            .map(|d| d.join("stream-loader").join("config.toml"))
            .ok_or_else(|| Error::Config("could not determine config directory".to_string()))?;
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        LoaderConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let config = LoaderConfig {
            queue_depth: 0,
            ..LoaderConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_processes_is_rejected() {
        let config = LoaderConfig {
            processes: 0,
            ..LoaderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
