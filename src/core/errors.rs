use std::io;

use thiserror::Error;

use crate::core::domain::{RunKey, RunState};

/// Why the static gate refused an artifact.
///
/// The gate is a syntactic pre-filter, not an isolation boundary: a
/// rejection means a known-dangerous import was spelled out in the source,
/// while an acceptance proves nothing about what the script can reach.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("denied import: {module}")]
    DeniedImport { module: String },
    #[error("source cannot be parsed: {msg}")]
    Unparseable { msg: String },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("interpreter not found: {interpreter}")]
    InterpreterNotFound { interpreter: String },
    #[error("working directory unavailable: {0}")]
    WorkDir(#[source] io::Error),
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),
    #[error("owner {owner} already has {limit} runs in flight")]
    OwnerLimit { owner: String, limit: usize },
    #[error("spawned process has no pid")]
    MissingPid,
}

/// Registry bookkeeping was about to lose track of a live process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("run {key} already has a live handle")]
    Occupied { key: RunKey },
}

#[derive(Debug, Error)]
pub enum StartRunError {
    #[error("no artifact {key}")]
    NotFound { key: RunKey },
    #[error(transparent)]
    Rejected(#[from] GateRejection),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    RegistryInvariant(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run state transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: RunState,
    pub to: RunState,
}
