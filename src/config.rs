use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::constants::{
    DEFAULT_DENYLIST, DEFAULT_DRAIN_LINGER, DEFAULT_EXCERPT_CHARS, DEFAULT_GRACE_PERIOD,
    DEFAULT_INTERPRETER, DEFAULT_MAX_RUNS_PER_OWNER, DEFAULT_ONE_SHOT_TIMEOUT,
    DEFAULT_OUTPUT_CAP_BYTES, DEFAULT_SCRIPT_FILE_NAME, DEFAULT_WORK_DIR_NAME,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("interpreter must not be empty")]
    EmptyInterpreter,
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("script file name {0:?} must be a bare file name")]
    ScriptFileName(String),
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub interpreter: PathBuf,
    /// Parent of the per-run working directories.
    pub work_root: PathBuf,
    /// Name the artifact is written under inside its run directory.
    pub script_file_name: String,
    pub one_shot_timeout: Duration,
    pub grace_period: Duration,
    pub drain_linger: Duration,
    pub output_cap_bytes: usize,
    pub excerpt_chars: usize,
    pub max_runs_per_owner: usize,
    pub denylist: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from(DEFAULT_INTERPRETER),
            work_root: std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME),
            script_file_name: DEFAULT_SCRIPT_FILE_NAME.to_string(),
            one_shot_timeout: DEFAULT_ONE_SHOT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_linger: DEFAULT_DRAIN_LINGER,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            max_runs_per_owner: DEFAULT_MAX_RUNS_PER_OWNER,
            denylist: DEFAULT_DENYLIST.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.as_os_str().is_empty() {
            return Err(ConfigError::EmptyInterpreter);
        }

        let name = &self.script_file_name;
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ConfigError::ScriptFileName(name.clone()));
        }

        let positive = [
            ("one_shot_timeout", !self.one_shot_timeout.is_zero()),
            ("output_cap_bytes", self.output_cap_bytes > 0),
            ("excerpt_chars", self.excerpt_chars > 0),
            ("max_runs_per_owner", self.max_runs_per_owner > 0),
        ];
        match positive.into_iter().find(|(_, ok)| !ok) {
            Some((name, _)) => Err(ConfigError::Zero { name }),
            None => Ok(()),
        }
    }
}
