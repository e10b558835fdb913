use std::sync::Arc;

use uuid::Uuid;

use crate::{
    constants::ARTIFACT_EXTENSION,
    core::{
        domain::{Artifact, RunKey, RunMode, RunReport},
        errors::StartRunError,
    },
    supervisor::{RunStarted, Supervisor},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitReply {
    Accepted,
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartReply {
    Started { run_id: Uuid, pid: u32 },
    Rejected(String),
    NotFound,
}

/// Reply to a start that waits for the run to finish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunReply {
    Finished(RunReport),
    Rejected(String),
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReply {
    Stopped,
    NotRunning,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartKind {
    /// Bounded by the configured one-shot timeout.
    #[default]
    OneShot,
    Supervised,
}

/// Entry points used by whatever transport sits in front of the supervisor.
#[derive(Clone, Debug)]
pub struct ScriptService {
    supervisor: Arc<Supervisor>,
}

impl ScriptService {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Checks and stores an uploaded script. Nothing is stored on rejection.
    #[tracing::instrument(skip(self, source))]
    pub fn submit_artifact(&self, owner: &str, name: &str, source: &[u8]) -> SubmitReply {
        if !has_artifact_extension(name) {
            return SubmitReply::Rejected(format!("only {} files are accepted", ARTIFACT_EXTENSION));
        }

        let source = String::from_utf8_lossy(source);
        if let Err(rejection) = self.supervisor.gate().check(&source) {
            tracing::info!(%rejection, "upload rejected");
            return SubmitReply::Rejected(rejection.to_string());
        }

        let key = RunKey::new(owner, name);
        if self
            .supervisor
            .store()
            .put(Artifact::new(key, source))
            .is_some()
        {
            tracing::debug!("replaced previous upload");
        }
        SubmitReply::Accepted
    }

    #[tracing::instrument(skip(self))]
    pub async fn request_start(&self, owner: &str, name: &str, kind: StartKind) -> StartReply {
        match self.start(owner, name, kind).await {
            Ok(started) => StartReply::Started {
                run_id: started.run_id,
                pid: started.pid,
            },
            Err(StartRunError::NotFound { .. }) => StartReply::NotFound,
            Err(e) => StartReply::Rejected(e.to_string()),
        }
    }

    /// Runs the artifact one-shot and answers with its report once it is
    /// done, the way a single chat upload is answered.
    #[tracing::instrument(skip(self))]
    pub async fn request_run(&self, owner: &str, name: &str) -> RunReply {
        let started = match self.start(owner, name, StartKind::OneShot).await {
            Ok(started) => started,
            Err(StartRunError::NotFound { .. }) => return RunReply::NotFound,
            Err(e) => return RunReply::Rejected(e.to_string()),
        };

        match started.completion.wait().await {
            Some(outcome) => {
                RunReply::Finished(outcome.report(self.supervisor.config().excerpt_chars))
            }
            None => RunReply::Rejected(format!("run {} ended without an outcome", started.run_id)),
        }
    }

    async fn start(
        &self,
        owner: &str,
        name: &str,
        kind: StartKind,
    ) -> Result<RunStarted, StartRunError> {
        let mode = match kind {
            StartKind::OneShot => RunMode::OneShot {
                timeout: self.supervisor.config().one_shot_timeout,
            },
            StartKind::Supervised => RunMode::Supervised,
        };

        let started = self.supervisor.start_run(owner, name, mode).await?;
        tracing::info!(run_id = %started.run_id, pid = started.pid, %mode, "run started");
        Ok(started)
    }

    pub async fn request_stop(&self, owner: &str, name: &str) -> StopReply {
        if self.supervisor.stop_run(owner, name).await {
            StopReply::Stopped
        } else {
            StopReply::NotRunning
        }
    }

    pub async fn request_stop_all(&self) -> usize {
        self.supervisor.stop_all().await
    }
}

fn has_artifact_extension(name: &str) -> bool {
    name.len() > ARTIFACT_EXTENSION.len()
        && name
            .get(name.len() - ARTIFACT_EXTENSION.len()..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION))
}
