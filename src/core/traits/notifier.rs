use uuid::Uuid;

use crate::core::domain::{RunKey, RunReport};

/// Asynchronous events emitted toward the transport layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    RunStarted { key: RunKey, run_id: Uuid, pid: u32 },
    RunCompleted(RunReport),
    RunStartFailed { key: RunKey, error: String },
}

impl Notification {
    pub fn key(&self) -> &RunKey {
        match self {
            Notification::RunStarted { key, .. } => key,
            Notification::RunCompleted(report) => &report.key,
            Notification::RunStartFailed { key, .. } => key,
        }
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Notifier: std::fmt::Debug + Send + Sync {
    async fn notify(&self, notification: Notification);
}
