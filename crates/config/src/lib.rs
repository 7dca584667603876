//! Configuration of the backfill engine.
//!
//! [`BackfillConfig`] is request-scoped: the engine takes it by value when a request starts and
//! never mutates it. It can be persisted to a TOML file with [`BackfillConfig::store`] and read
//! back with [`BackfillConfig::load`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Default size of the segments in which store snapshots are written.
pub const DEFAULT_STORE_SNAPSHOTS_SAVE_INTERVAL: u64 = 1_000;

/// Default size of the segments in which map outputs are cached.
pub const DEFAULT_EXEC_OUTPUT_SAVE_INTERVAL: u64 = 1_000;

/// Default maximum size of a sub-request.
pub const DEFAULT_SUBREQUESTS_SPLIT_SIZE: u64 = 10_000;

/// Default number of concurrent sub-requests.
pub const DEFAULT_PARALLEL_SUBREQUESTS: usize = 5;

/// Default maximum size of an appended value.
pub const DEFAULT_APPEND_LIMIT: usize = 8 * 1024;

/// Default maximum size of a stored value.
pub const DEFAULT_VALUE_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Errors of [`BackfillConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config file {path}: {source}")]
    File {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: confy::ConfyError,
    },
    /// A setting is out of range.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Name of the setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Settings of a backfill request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Size of the segments in which store snapshots are written.
    pub store_snapshots_save_interval: u64,
    /// Size of the segments in which map outputs are cached.
    pub exec_output_save_interval: u64,
    /// Maximum number of blocks of a sub-request.
    pub subrequests_split_size: u64,
    /// Maximum number of sub-requests in flight.
    pub parallel_subrequests: usize,
    /// Maximum size of a value written with the append policy.
    pub append_limit: usize,
    /// Maximum size of any stored value.
    pub value_size_limit: usize,
    /// Maximum time to wait for the next message of a sub-request.
    #[serde(with = "humantime_serde")]
    pub worker_receive_timeout: Duration,
    /// Number of attempts of a job before a retryable error becomes fatal.
    pub retry_max_attempts: u32,
    /// Sleep of the linear output reader when a segment is not cached yet.
    #[serde(with = "humantime_serde")]
    pub output_poll_interval: Duration,
    /// Minimum delay between two progress messages.
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Concurrent storage operations of a squasher.
    pub squasher_io_concurrency: usize,
    /// Capacity of the input queue of a squasher.
    pub squasher_input_buffer: usize,
    /// Attempts of a storage listing before a transient failure is reported.
    pub storage_retry_attempts: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            store_snapshots_save_interval: DEFAULT_STORE_SNAPSHOTS_SAVE_INTERVAL,
            exec_output_save_interval: DEFAULT_EXEC_OUTPUT_SAVE_INTERVAL,
            subrequests_split_size: DEFAULT_SUBREQUESTS_SPLIT_SIZE,
            parallel_subrequests: DEFAULT_PARALLEL_SUBREQUESTS,
            append_limit: DEFAULT_APPEND_LIMIT,
            value_size_limit: DEFAULT_VALUE_SIZE_LIMIT,
            worker_receive_timeout: Duration::from_secs(60),
            retry_max_attempts: 3,
            output_poll_interval: Duration::from_secs(5),
            progress_interval: Duration::from_millis(200),
            squasher_io_concurrency: 250,
            squasher_input_buffer: 16,
            storage_retry_attempts: 3,
        }
    }
}

impl BackfillConfig {
    /// Loads the config at `path`, writing the defaults there if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config: Self = confy::load_path(path)
            .map_err(|source| ConfigError::File { path: path.display().to_string(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config to `path` as TOML.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        confy::store_path(path, self)
            .map_err(|source| ConfigError::File { path: path.display().to_string(), source })
    }

    /// Sets the snapshot and output intervals.
    pub const fn with_intervals(mut self, store_snapshots: u64, exec_output: u64) -> Self {
        self.store_snapshots_save_interval = store_snapshots;
        self.exec_output_save_interval = exec_output;
        self
    }

    /// Sets the sub-request split size.
    pub const fn with_split_size(mut self, split_size: u64) -> Self {
        self.subrequests_split_size = split_size;
        self
    }

    /// Sets the number of concurrent sub-requests.
    pub const fn with_parallel_subrequests(mut self, parallel: usize) -> Self {
        self.parallel_subrequests = parallel;
        self
    }

    /// Checks that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("store_snapshots_save_interval", self.store_snapshots_save_interval),
            ("exec_output_save_interval", self.exec_output_save_interval),
            ("subrequests_split_size", self.subrequests_split_size),
            ("parallel_subrequests", self.parallel_subrequests as u64),
            ("append_limit", self.append_limit as u64),
            ("value_size_limit", self.value_size_limit as u64),
            ("retry_max_attempts", self.retry_max_attempts as u64),
            ("squasher_io_concurrency", self.squasher_io_concurrency as u64),
            ("squasher_input_buffer", self.squasher_input_buffer as u64),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid { field, reason: "must be positive".to_string() })
        }
        if self.worker_receive_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "worker_receive_timeout",
                reason: "must be positive".to_string(),
            })
        }
        if self.subrequests_split_size % self.store_snapshots_save_interval != 0 {
            return Err(ConfigError::Invalid {
                field: "subrequests_split_size",
                reason: format!(
                    "{} is not a multiple of the store snapshot interval {}",
                    self.subrequests_split_size, self.store_snapshots_save_interval
                ),
            })
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const EXTENSION: &str = "toml";

    fn with_tempdir(filename: &str, proc: fn(&Path)) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(filename).with_extension(EXTENSION);

        proc(&config_path);

        temp_dir.close().unwrap()
    }

    #[test]
    fn test_store_load_config() {
        with_tempdir("config-store-load-test", |config_path| {
            let config = BackfillConfig::default().with_intervals(100, 50).with_split_size(1_000);
            config.store(config_path).unwrap();

            let loaded = BackfillConfig::load(config_path).unwrap();
            assert_eq!(config, loaded);
        })
    }

    #[test]
    fn test_load_missing_writes_defaults() {
        with_tempdir("config-missing-test", |config_path| {
            let loaded = BackfillConfig::load(config_path).unwrap();
            assert_eq!(loaded, BackfillConfig::default());
            assert!(config_path.exists());
        })
    }

    #[test]
    fn durations_are_human_readable() {
        let config: BackfillConfig = toml::from_str(
            r#"
            worker_receive_timeout = "2m"
            progress_interval = "50ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_receive_timeout, Duration::from_secs(120));
        assert_eq!(config.progress_interval, Duration::from_millis(50));
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        assert!(BackfillConfig::default().validate().is_ok());
        assert_matches!(
            BackfillConfig::default().with_parallel_subrequests(0).validate(),
            Err(ConfigError::Invalid { field: "parallel_subrequests", .. })
        );
        assert_matches!(
            BackfillConfig::default().with_intervals(1_000, 1_000).with_split_size(1_500).validate(),
            Err(ConfigError::Invalid { field: "subrequests_split_size", .. })
        );
    }
}
