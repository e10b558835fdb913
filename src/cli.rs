use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::config::{ConfigError, SupervisorConfig};

/// Command-line arguments for `scriptrunner`.
///
/// Every flag falls back to a `SCRIPTRUNNER_*` environment variable and then
/// to the built-in default.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "scriptrunner",
    version,
    about = "Run user-submitted Python scripts under supervision.",
    long_about = None
)]
pub struct Cli {
    /// Interpreter every script is run with.
    #[arg(long, env = "SCRIPTRUNNER_INTERPRETER", value_name = "PATH")]
    pub interpreter: Option<PathBuf>,

    /// Directory that holds the per-run working directories.
    #[arg(long, env = "SCRIPTRUNNER_WORK_ROOT", value_name = "DIR")]
    pub work_root: Option<PathBuf>,

    #[arg(long, env = "SCRIPTRUNNER_TIMEOUT_SECS", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Wait between SIGTERM and SIGKILL.
    #[arg(long, env = "SCRIPTRUNNER_GRACE_SECS", value_name = "SECS")]
    pub grace_secs: Option<u64>,

    /// How long output is still read after the process exited.
    #[arg(long, env = "SCRIPTRUNNER_DRAIN_LINGER_MS", value_name = "MS")]
    pub drain_linger_ms: Option<u64>,

    /// Bytes kept per output stream.
    #[arg(long, env = "SCRIPTRUNNER_OUTPUT_CAP", value_name = "BYTES")]
    pub output_cap: Option<usize>,

    #[arg(long, env = "SCRIPTRUNNER_EXCERPT_CHARS", value_name = "CHARS")]
    pub excerpt_chars: Option<usize>,

    #[arg(long, env = "SCRIPTRUNNER_MAX_RUNS", value_name = "N")]
    pub max_runs_per_owner: Option<usize>,

    /// Comma-separated top-level modules to reject; replaces the default list.
    #[arg(long, env = "SCRIPTRUNNER_DENY", value_name = "MODULES", value_delimiter = ',')]
    pub deny: Option<Vec<String>>,
}

impl Cli {
    pub fn into_config(self) -> Result<SupervisorConfig, ConfigError> {
        let defaults = SupervisorConfig::default();
        let config = SupervisorConfig {
            interpreter: self.interpreter.unwrap_or(defaults.interpreter),
            work_root: self.work_root.unwrap_or(defaults.work_root),
            script_file_name: defaults.script_file_name,
            one_shot_timeout: self
                .timeout_secs
                .map_or(defaults.one_shot_timeout, Duration::from_secs),
            grace_period: self
                .grace_secs
                .map_or(defaults.grace_period, Duration::from_secs),
            drain_linger: self
                .drain_linger_ms
                .map_or(defaults.drain_linger, Duration::from_millis),
            output_cap_bytes: self.output_cap.unwrap_or(defaults.output_cap_bytes),
            excerpt_chars: self.excerpt_chars.unwrap_or(defaults.excerpt_chars),
            max_runs_per_owner: self.max_runs_per_owner.unwrap_or(defaults.max_runs_per_owner),
            denylist: self
                .deny
                .map(|modules| {
                    modules
                        .into_iter()
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.denylist),
        };

        config.validate()?;
        Ok(config)
    }
}
