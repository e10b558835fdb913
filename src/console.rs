use std::{path::PathBuf, str::FromStr};

use thiserror::Error;
use tokio::{
    sync::mpsc::{Receiver, Sender},
    task::JoinHandle,
};

use crate::{
    core::{
        domain::{RunKey, RunReport},
        traits::notifier::Notification,
    },
    service::{RunReply, ScriptService, StartKind, StartReply, StopReply, SubmitReply},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Submit { owner: String, path: PathBuf },
    Start { owner: String, name: String, kind: StartKind },
    /// One-shot start answered with the run's output once it finishes.
    Run { owner: String, name: String },
    Stop { owner: String, name: String },
    StopAll,
    /// Every live run, or one owner's uploads when `owner` is set.
    List { owner: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid request")]
    Empty,
    #[error("Invalid command {0}")]
    Unknown(String),
    #[error("{0} required")]
    Missing(&'static str),
    #[error("Unknown mode {0}, expected oneshot or supervised")]
    Mode(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let cmd = words.next().ok_or(CommandError::Empty)?;
        let mut arg = |what: &'static str| words.next().ok_or(CommandError::Missing(what));

        match cmd.to_ascii_uppercase().as_str() {
            "SUBMIT" => Ok(Command::Submit {
                owner: arg("Owner")?.to_string(),
                path: arg("File path")?.into(),
            }),
            "START" => {
                let owner = arg("Owner")?.to_string();
                let name = arg("File name")?.to_string();
                let kind = match arg("Mode").ok() {
                    None => StartKind::default(),
                    Some(m) if m.eq_ignore_ascii_case("oneshot") => StartKind::OneShot,
                    Some(m) if m.eq_ignore_ascii_case("supervised") => StartKind::Supervised,
                    Some(m) => return Err(CommandError::Mode(m.to_string())),
                };
                Ok(Command::Start { owner, name, kind })
            }
            "RUN" => Ok(Command::Run {
                owner: arg("Owner")?.to_string(),
                name: arg("File name")?.to_string(),
            }),
            "STOP" => Ok(Command::Stop {
                owner: arg("Owner")?.to_string(),
                name: arg("File name")?.to_string(),
            }),
            "STOPALL" => Ok(Command::StopAll),
            "LIST" => Ok(Command::List {
                owner: arg("Owner").ok().map(str::to_string),
            }),
            _ => Err(CommandError::Unknown(cmd.to_string())),
        }
    }
}

/// Answers one line per incoming command until the input side closes.
pub fn handle_commands(
    service: ScriptService,
    mut lines_rx: Receiver<String>,
    reply_tx: Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines_rx.recv().await {
            if line.trim().is_empty() {
                continue;
            }

            let reply = match line.parse::<Command>() {
                Ok(command) => execute(&service, command).await,
                Err(e) => e.to_string(),
            };

            if reply_tx.send(reply).await.is_err() {
                tracing::warn!("reply receiver dropped, stopping command loop");
                break;
            }
        }
    })
}

pub async fn execute(service: &ScriptService, command: Command) -> String {
    match command {
        Command::Submit { owner, path } => {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                return "File name required".to_string();
            };
            let source = match tokio::fs::read(&path).await {
                Ok(source) => source,
                Err(e) => return format!("Cannot read {}: {}", path.display(), e),
            };

            match service.submit_artifact(&owner, &name, &source) {
                SubmitReply::Accepted => format!("File {} submitted", name),
                SubmitReply::Rejected(reason) => format!("File {} rejected: {}", name, reason),
            }
        }
        Command::Start { owner, name, kind } => {
            match service.request_start(&owner, &name, kind).await {
                StartReply::Started { run_id, pid } => {
                    format!("Started {} (pid {}, run {})", name, pid, run_id)
                }
                StartReply::Rejected(reason) => format!("Cannot start {}: {}", name, reason),
                StartReply::NotFound => format!("File {} not found", name),
            }
        }
        Command::Run { owner, name } => match service.request_run(&owner, &name).await {
            RunReply::Finished(report) => render_report(&report, excerpt_chars(service)),
            RunReply::Rejected(reason) => format!("Cannot run {}: {}", name, reason),
            RunReply::NotFound => format!("File {} not found", name),
        },
        Command::Stop { owner, name } => match service.request_stop(&owner, &name).await {
            StopReply::Stopped => format!("Stopped {}", name),
            StopReply::NotRunning => format!("{} is not running", name),
        },
        Command::StopAll => format!("Stopped {} runs", service.request_stop_all().await),
        Command::List { owner: Some(owner) } => list_uploads(service, &owner),
        Command::List { owner: None } => {
            let runs = service.supervisor().list_runs();
            if runs.is_empty() {
                return "Nothing is running".to_string();
            }
            runs.iter()
                .map(|(key, info)| {
                    format!("{} pid={} {} {:?}", key, info.pid, info.mode, info.state)
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

fn list_uploads(service: &ScriptService, owner: &str) -> String {
    let supervisor = service.supervisor();
    let names = supervisor.store().names_for(owner);
    if names.is_empty() {
        return format!("No files for {}", owner);
    }

    names
        .into_iter()
        .map(|name| {
            let key = RunKey::new(owner, name.as_str());
            let uploaded = supervisor
                .store()
                .get(&key)
                .map(|artifact| artifact.uploaded_at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            match supervisor.lookup(&key) {
                Some(info) => format!("{} uploaded {} running pid={}", name, uploaded, info.pid),
                None => format!("{} uploaded {} idle", name, uploaded),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt_chars(service: &ScriptService) -> usize {
    service.supervisor().config().excerpt_chars
}

fn render_report(report: &RunReport, excerpt_chars: usize) -> String {
    let marker = if report.truncated() {
        " (output truncated)"
    } else {
        ""
    };
    format!(
        "[{}] finished{}\n{}",
        report.key,
        marker,
        report.summary(excerpt_chars)
    )
}

pub fn render_notification(notification: &Notification, excerpt_chars: usize) -> String {
    match notification {
        Notification::RunStarted { key, pid, .. } => format!("[{}] started (pid {})", key, pid),
        Notification::RunCompleted(report) => render_report(report, excerpt_chars),
        Notification::RunStartFailed { key, error } => {
            format!("[{}] failed to start: {}", key, error)
        }
    }
}
