use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{constants::NO_OUTPUT, core::errors::TransitionError};

pub type OwnerId = String;

/// Identifies at most one live run: the owner plus the artifact name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub owner: OwnerId,
    pub artifact: String,
}

impl RunKey {
    pub fn new(owner: impl Into<OwnerId>, artifact: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            artifact: artifact.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.artifact)
    }
}

#[derive(Clone, Debug)]
pub struct Artifact {
    pub key: RunKey,
    pub source: String,
    pub uploaded_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(key: RunKey, source: impl Into<String>) -> Self {
        Self {
            key,
            source: source.into(),
            uploaded_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Terminated automatically once `timeout` elapses.
    OneShot { timeout: Duration },
    /// No deadline; runs until it exits or is stopped.
    Supervised,
}

impl RunMode {
    pub fn deadline(&self) -> Option<Duration> {
        match self {
            RunMode::OneShot { timeout } => Some(*timeout),
            RunMode::Supervised => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::OneShot { timeout } => write!(f, "one-shot({}s)", timeout.as_secs_f64()),
            RunMode::Supervised => write!(f, "supervised"),
        }
    }
}

/// Immutable description of a single run, fixed when the run starts.
#[derive(Clone, Debug)]
pub struct ExecutionDescriptor {
    pub run_id: Uuid,
    pub key: RunKey,
    pub mode: RunMode,
}

impl ExecutionDescriptor {
    pub fn new(key: RunKey, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            key,
            mode,
        }
    }
}

/// Lifecycle of a run.
///
/// ```text
/// PendingGate -> Rejected
/// PendingGate -> Starting -> Running
/// Running     -> Exited
/// Running     -> Stopping -> Stopped
/// Starting    -> StartFailed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunState {
    PendingGate,
    Rejected,
    Starting,
    Running,
    Stopping,
    Exited,
    Stopped,
    StartFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Rejected | RunState::Exited | RunState::Stopped | RunState::StartFailed
        )
    }

    pub fn transition(self, next: RunState) -> Result<RunState, TransitionError> {
        use RunState::*;

        let allowed = matches!(
            (self, next),
            (PendingGate, Rejected)
                | (PendingGate, Starting)
                | (Starting, Running)
                | (Starting, StartFailed)
                | (Running, Exited)
                | (Running, Stopping)
                | (Stopping, Stopped)
        );

        if allowed {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionReason {
    Exited,
    TimedOut,
    Stopped,
}

/// Bytes read from one standard stream, capped at a fixed size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedStream {
    /// Appends as much of `chunk` as fits under `cap`, flagging anything dropped.
    pub fn append(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn excerpt(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.bytes)
            .chars()
            .take(max_chars)
            .collect()
    }
}

/// Final record of a run once its process is gone and its streams are drained.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub key: RunKey,
    pub pid: u32,
    pub reason: CompletionReason,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub forced_kill: bool,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn report(&self, excerpt_chars: usize) -> RunReport {
        RunReport {
            key: self.key.clone(),
            run_id: self.run_id,
            reason: self.reason,
            exit_code: self.exit_code,
            signal: self.signal,
            stdout_excerpt: self.stdout.excerpt(excerpt_chars),
            stderr_excerpt: self.stderr.excerpt(excerpt_chars),
            stdout_truncated: self.stdout.truncated,
            stderr_truncated: self.stderr.truncated,
        }
    }
}

/// User-facing summary of a finished run, sized for a chat reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub key: RunKey,
    pub run_id: Uuid,
    pub reason: CompletionReason,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunReport {
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Stdout followed by stderr, trimmed and cut to `max_chars`.
    pub fn summary(&self, max_chars: usize) -> String {
        let combined = format!("{}{}", self.stdout_excerpt, self.stderr_excerpt);
        let body: String = combined.trim().chars().take(max_chars).collect();
        let body = if body.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            body
        };

        match (self.reason, self.exit_code, self.signal) {
            (CompletionReason::TimedOut, _, _) => format!("[timed out]\n{body}"),
            (CompletionReason::Stopped, _, _) => format!("[stopped]\n{body}"),
            (CompletionReason::Exited, Some(0), _) => body,
            (CompletionReason::Exited, Some(code), _) => format!("[exit code {code}]\n{body}"),
            (CompletionReason::Exited, None, Some(signal)) => {
                format!("[killed by signal {signal}]\n{body}")
            }
            (CompletionReason::Exited, None, None) => body,
        }
    }
}
