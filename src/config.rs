//! Kernel configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admin::VerifyLevel;
use crate::migration::UpgradeOptions;
use crate::scheduler::{Group, SchedulerOptions, ShutdownPolicy};

/// Settings that govern startup upgrades and background work.
///
/// ```toml
/// allow_upgrade = true
///
/// [migration]
/// verify_level = "full"
/// index_population_batch = 4096
///
/// [scheduler]
/// thread_name_prefix = "sombra"
/// shutdown = "await"
///
/// [scheduler.parallelism]
/// index_population = 4
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Whether an outdated store may be upgraded on startup.
    pub allow_upgrade: bool,
    /// Upgrade tuning.
    pub migration: MigrationConfig,
    /// Background scheduler tuning.
    pub scheduler: SchedulerConfig,
}

/// `[migration]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Check run over staged output before commit.
    pub verify_level: VerifyLevel,
    /// Nodes per label index population job.
    pub index_population_batch: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let defaults = UpgradeOptions::default();
        Self {
            verify_level: defaults.verify_level,
            index_population_batch: defaults.index_population_batch,
        }
    }
}

/// `[scheduler]` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// What happens to queued jobs at shutdown.
    pub shutdown: ShutdownPolicy,
    /// Per-group worker limits; unset groups keep their defaults.
    pub parallelism: GroupParallelism,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: SchedulerOptions::default().thread_name_prefix,
            shutdown: ShutdownPolicy::default(),
            parallelism: GroupParallelism::default(),
        }
    }
}

/// `[scheduler.parallelism]` section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupParallelism {
    /// Limit for [`Group::Migration`].
    pub migration: Option<usize>,
    /// Limit for [`Group::IndexPopulation`].
    pub index_population: Option<usize>,
    /// Limit for [`Group::StorageMaintenance`].
    pub storage_maintenance: Option<usize>,
    /// Limit for [`Group::LogRotation`].
    pub log_rotation: Option<usize>,
}

impl GroupParallelism {
    fn get(&self, group: Group) -> Option<usize> {
        match group {
            Group::Migration => self.migration,
            Group::IndexPopulation => self.index_population,
            Group::StorageMaintenance => self.storage_maintenance,
            Group::LogRotation => self.log_rotation,
        }
    }
}

impl KernelConfig {
    /// Loads `explicit`, or the default path if it exists, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.exists()),
        };
        match path {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let config: Self = toml::from_str(&contents)
                    .map_err(|source| ConfigError::Parse { path, source })?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parses configuration text; used for inline configs and tests.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.index_population_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "migration.index_population_batch",
                reason: "must be at least 1",
            });
        }
        for group in Group::ALL {
            if self.scheduler.parallelism.get(group) == Some(0) {
                return Err(ConfigError::Invalid {
                    field: "scheduler.parallelism",
                    reason: "group limits must be at least 1",
                });
            }
        }
        Ok(())
    }

    /// Scheduler options derived from the `[scheduler]` section.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        let mut options = SchedulerOptions {
            thread_name_prefix: self.scheduler.thread_name_prefix.clone(),
            shutdown: self.scheduler.shutdown,
            ..SchedulerOptions::default()
        };
        for group in Group::ALL {
            if let Some(limit) = self.scheduler.parallelism.get(group) {
                options.parallelism.insert(group, limit);
            }
        }
        options
    }

    /// Upgrade options derived from `allow_upgrade` and `[migration]`.
    pub fn upgrade_options(&self) -> UpgradeOptions {
        UpgradeOptions {
            allow_upgrade: self.allow_upgrade,
            verify_level: self.migration.verify_level,
            index_population_batch: self.migration.index_population_batch,
        }
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`KernelConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying failure.
        source: toml::de::Error,
    },
    /// A value parsed but is out of range.
    #[error("config field {field} is invalid: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// `<config dir>/sombra/upgrade.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sombra").join("upgrade.toml"))
}
