//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::worker::{WorkerCommand, DEFAULT_EXECUTABLE, DEFAULT_WORKER_SCRIPT};

/// Configuration for the wrapper.
///
/// Loaded from TOML, then overlaid with environment and command-line values
/// through [`ConfigOverrides`]. Call [`WrapperConfig::validate`] before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapperConfig {
    /// Directory the worker runs in (where debug-mcp is installed).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Program used to launch the worker.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Fixed argument list passed to the worker.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Seconds between scheduled restarts. Zero disables the timer.
    #[serde(default = "default_restart_interval_secs")]
    pub restart_interval_secs: u64,
    /// Chunks of client input retained while a worker is replaced.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Delay between respawn attempts after a crash.
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
}

fn default_executable() -> String {
    DEFAULT_EXECUTABLE.to_string()
}

fn default_args() -> Vec<String> {
    vec![DEFAULT_WORKER_SCRIPT.to_string()]
}

fn default_restart_interval_secs() -> u64 {
    60
}

fn default_buffer_size() -> usize {
    100
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_respawn_delay_ms() -> u64 {
    1000
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            executable: default_executable(),
            args: default_args(),
            restart_interval_secs: default_restart_interval_secs(),
            buffer_size: default_buffer_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
            respawn_delay_ms: default_respawn_delay_ms(),
        }
    }
}

/// Values that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub working_dir: Option<PathBuf>,
    pub executable: Option<String>,
    pub restart_interval_secs: Option<u64>,
    pub buffer_size: Option<usize>,
}

impl WrapperConfig {
    /// Apply overrides, keeping file values where an override is unset.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(dir) = overrides.working_dir {
            self.working_dir = Some(dir);
        }
        if let Some(executable) = overrides.executable {
            self.executable = executable;
        }
        if let Some(secs) = overrides.restart_interval_secs {
            self.restart_interval_secs = secs;
        }
        if let Some(size) = overrides.buffer_size {
            self.buffer_size = size;
        }
        self
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the working directory is unset or missing, or a
    /// value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dir = self
            .working_dir
            .as_deref()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or(ConfigError::MissingWorkingDir)?;

        if !dir.exists() {
            return Err(ConfigError::WorkingDirNotFound(dir.to_path_buf()));
        }
        if !dir.is_dir() {
            return Err(ConfigError::NotADirectory(dir.to_path_buf()));
        }
        if self.executable.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "executable",
                reason: "must not be empty".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must hold at least one chunk".to_string(),
            });
        }
        Ok(())
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    #[must_use]
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    #[must_use]
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    /// Build the command that launches one worker.
    #[must_use]
    pub fn worker_command(&self) -> WorkerCommand {
        let command = WorkerCommand::new(&self.executable).args(self.args.iter().cloned());
        match &self.working_dir {
            Some(dir) => command.working_dir(dir),
            None => command,
        }
    }
}
