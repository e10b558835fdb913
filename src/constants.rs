use std::time::Duration;

pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_WORK_DIR_NAME: &str = "scriptrunner";
pub const DEFAULT_SCRIPT_FILE_NAME: &str = "main.py";

pub const DEFAULT_ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_LINGER: Duration = Duration::from_secs(2);

pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 64 * 1024;
pub const DEFAULT_EXCERPT_CHARS: usize = 4000;
pub const DEFAULT_MAX_RUNS_PER_OWNER: usize = 3;

/// Top-level Python modules whose import rejects an artifact.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "threading",
    "multiprocessing",
    "asyncio",
    "pathlib",
];

pub const ARTIFACT_EXTENSION: &str = ".py";
pub const NO_OUTPUT: &str = "no output";

pub const READ_CHUNK_BYTES: usize = 8 * 1024;
pub const NOTIFY_CHANNEL_SIZE: usize = 128;
