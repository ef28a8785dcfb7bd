use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::batch::BatchConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub scheduler: SchedulerSection,
    pub backoff: BackoffConfig,
    pub batch: BatchConfig,
    pub timeouts: TimeoutConfig,
    pub defaults: TaskDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Project directory used to derive the isolated store location
    pub project_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub idle_interval_ms: u64,
    pub grace_period_ms: u64,
    pub event_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            idle_interval_ms: 500,
            grace_period_ms: 5000,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2000,
            cap_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    /// Per-task-type overrides, keyed by task type name
    pub per_type: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 300,
            per_type: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Timeout for a task type, falling back to the default.
    pub fn for_type(&self, task_type: &str) -> u64 {
        self.per_type
            .get(task_type)
            .copied()
            .unwrap_or(self.default_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub max_attempts: u32,
    pub priority: i64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            priority: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            storage: StorageConfig::default(),
            scheduler: SchedulerSection::default(),
            backoff: BackoffConfig::default(),
            batch: BatchConfig::default(),
            timeouts: TimeoutConfig::default(),
            defaults: TaskDefaults::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Translate the file-level sections into the scheduler's runtime knobs.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            idle_interval: Duration::from_millis(self.scheduler.idle_interval_ms),
            grace_period: Duration::from_millis(self.scheduler.grace_period_ms),
            backoff: BackoffPolicy::new(self.backoff.base_ms, self.backoff.cap_ms),
            event_capacity: self.scheduler.event_capacity,
        }
    }
}
