use std::{os::unix::process::ExitStatusExt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::{
    config::SupervisorConfig,
    core::{
        domain::{
            Artifact, CompletionReason, ExecutionDescriptor, RunKey, RunMode, RunOutcome, RunState,
        },
        errors::{StartError, StartRunError},
        registry::{CompletionSender, CompletionWaiter, ProcessRegistry, RunHandle, RunInfo, StopClaim},
        store::ArtifactStore,
        traits::{
            gate::Gate,
            notifier::{Notification, Notifier},
        },
    },
    native::{
        collector::OutputCollector,
        runner::{ProcessRunner, RunningProcess, Spawned, TerminationCause},
        workdir::WorkDir,
    },
};

/// Returned by a successful start; the run itself proceeds in the background.
#[derive(Debug)]
pub struct RunStarted {
    pub run_id: Uuid,
    pub pid: u32,
    pub completion: CompletionWaiter,
}

/// Starts, stops and tracks script runs.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    gate: Arc<dyn Gate>,
    notifier: Arc<dyn Notifier>,
    runner: ProcessRunner,
    store: ArtifactStore,
    registry: Arc<ProcessRegistry>,
    start_locks: DashMap<RunKey, Arc<Mutex<()>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, gate: Arc<dyn Gate>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            runner: ProcessRunner::new(&config.interpreter),
            config,
            gate,
            notifier,
            store: ArtifactStore::new(),
            registry: Arc::new(ProcessRegistry::new()),
            start_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn gate(&self) -> &dyn Gate {
        self.gate.as_ref()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn lookup(&self, key: &RunKey) -> Option<RunInfo> {
        self.registry.lookup(key)
    }

    pub fn list_runs(&self) -> Vec<(RunKey, RunInfo)> {
        self.registry.list_all()
    }

    /// Starts the stored artifact `artifact_name` of `owner`.
    ///
    /// A run already live under the same key is stopped first, so the latest
    /// start always wins. Returns as soon as the process is spawned and
    /// registered.
    #[tracing::instrument(skip(self))]
    pub async fn start_run(
        &self,
        owner: &str,
        artifact_name: &str,
        mode: RunMode,
    ) -> Result<RunStarted, StartRunError> {
        let key = RunKey::new(owner, artifact_name);
        let lock = self.start_lock(&key);
        let result = {
            let _serialized = lock.lock().await;
            self.start_serialized(key.clone(), mode).await
        };

        drop(lock);
        self.start_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn start_serialized(
        &self,
        key: RunKey,
        mode: RunMode,
    ) -> Result<RunStarted, StartRunError> {
        let artifact = self
            .store
            .get(&key)
            .ok_or_else(|| StartRunError::NotFound { key: key.clone() })?;

        if self.retire(&key, None).await {
            tracing::info!(%key, "previous run superseded");
        }

        let descriptor = ExecutionDescriptor::new(key.clone(), mode);
        let mut state = RunState::PendingGate;

        if let Err(rejection) = self.gate.check(&artifact.source) {
            advance(&descriptor, &mut state, RunState::Rejected);
            tracing::info!(%key, %rejection, "artifact rejected");
            return Err(rejection.into());
        }
        advance(&descriptor, &mut state, RunState::Starting);

        match self.launch(&descriptor, &artifact).await {
            Ok(started) => {
                advance(&descriptor, &mut state, RunState::Running);
                Ok(started)
            }
            Err(e) => {
                advance(&descriptor, &mut state, RunState::StartFailed);
                tracing::warn!(%key, error = %e, "run failed to start");
                self.notifier
                    .notify(Notification::RunStartFailed {
                        key,
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Stops the run under the given key.
    ///
    /// Returns `false` when nothing was running or another caller was already
    /// finishing the run; the entry is gone from the registry either way once
    /// this returns.
    #[tracing::instrument(skip(self))]
    pub async fn stop_run(&self, owner: &str, artifact_name: &str) -> bool {
        self.retire(&RunKey::new(owner, artifact_name), None).await
    }

    /// Stops every run registered at the moment of the call, concurrently.
    /// Runs registered afterwards are left alone.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self) -> usize {
        let snapshot = self.registry.list_all();
        tracing::info!(runs = snapshot.len(), "stopping all runs");

        let stopped = join_all(
            snapshot
                .iter()
                .map(|(key, info)| self.retire(key, Some(info.run_id))),
        )
        .await
        .into_iter()
        .filter(|stopped| *stopped)
        .count();

        tracing::info!(stopped, "all runs stopped");
        stopped
    }

    async fn retire(&self, key: &RunKey, run_id: Option<Uuid>) -> bool {
        match self.registry.claim_stop(key, run_id) {
            StopClaim::Claimed(completion) => {
                tracing::info!(%key, "stopping run");
                completion.wait().await;
                true
            }
            StopClaim::InFlight(completion) => {
                tracing::debug!(%key, "run already finishing");
                completion.wait().await;
                false
            }
            StopClaim::Absent => {
                tracing::debug!(%key, "not running");
                false
            }
        }
    }

    fn start_lock(&self, key: &RunKey) -> Arc<Mutex<()>> {
        self.start_locks
            .entry(key.clone())
            .or_default()
            .value()
            .clone()
    }

    async fn launch(
        &self,
        descriptor: &ExecutionDescriptor,
        artifact: &Artifact,
    ) -> Result<RunStarted, StartRunError> {
        let key = &descriptor.key;
        let reservation = self
            .registry
            .reserve(&key.owner, self.config.max_runs_per_owner)?;

        let workdir = WorkDir::create(
            &self.config.work_root,
            descriptor.run_id,
            &self.config.script_file_name,
            &artifact.source,
        )
        .await
        .map_err(StartError::WorkDir)?;

        let Spawned {
            mut process,
            stdout,
            stderr,
        } = match self.runner.start(descriptor, &workdir) {
            Ok(spawned) => spawned,
            Err(e) => {
                workdir.remove().await;
                return Err(e.into());
            }
        };
        let collector = OutputCollector::attach(stdout, stderr, self.config.output_cap_bytes);

        let pid = process.pid();
        let stop = Arc::new(Notify::new());
        let (done, completion) = CompletionWaiter::channel();
        let handle = RunHandle::new(
            descriptor.run_id,
            pid,
            descriptor.mode,
            Arc::clone(&stop),
            completion.clone(),
        );
        let started_at = handle.started_at;

        if let Err(e) = reservation.register(key.clone(), handle) {
            // Nothing would track this process; take it down before reporting.
            let _ = process.terminate(Duration::ZERO).await;
            process.sweep();
            collector.finish(self.config.drain_linger).await;
            workdir.remove().await;
            return Err(e.into());
        }

        self.notifier
            .notify(Notification::RunStarted {
                key: key.clone(),
                run_id: descriptor.run_id,
                pid,
            })
            .await;

        let run = Run {
            descriptor: descriptor.clone(),
            started_at,
            process,
            collector,
            workdir,
            stop,
            done,
            registry: Arc::clone(&self.registry),
            notifier: Arc::clone(&self.notifier),
            grace: self.config.grace_period,
            linger: self.config.drain_linger,
            excerpt_chars: self.config.excerpt_chars,
        };
        tokio::spawn(run.supervise());

        Ok(RunStarted {
            run_id: descriptor.run_id,
            pid,
            completion,
        })
    }
}

fn advance(descriptor: &ExecutionDescriptor, state: &mut RunState, next: RunState) {
    match state.transition(next) {
        Ok(next) => {
            tracing::debug!(run_id = %descriptor.run_id, from = ?state, to = ?next, "run state changed");
            *state = next;
        }
        Err(e) => tracing::error!(run_id = %descriptor.run_id, error = %e, "invalid run state change"),
    }
}

/// Everything one registered run needs to see itself through to the end.
struct Run {
    descriptor: ExecutionDescriptor,
    started_at: DateTime<Utc>,
    process: RunningProcess,
    collector: OutputCollector,
    workdir: WorkDir,
    stop: Arc<Notify>,
    done: CompletionSender,
    registry: Arc<ProcessRegistry>,
    notifier: Arc<dyn Notifier>,
    grace: Duration,
    linger: Duration,
    excerpt_chars: usize,
}

impl Run {
    async fn supervise(mut self) {
        let key = self.descriptor.key.clone();
        let run_id = self.descriptor.run_id;

        let termination = self
            .process
            .supervise(self.descriptor.mode, self.grace, &self.stop)
            .await;

        // Whoever reaches the registry first decides how the run ended.
        let settled = self.registry.settle(&key, run_id);
        self.process.sweep();

        let (cause, status, forced) = match termination {
            Ok(t) => (t.cause, Some(t.status), t.forced),
            Err(e) => {
                tracing::error!(%key, %run_id, error = %e, "lost track of process exit");
                (TerminationCause::Exited, None, false)
            }
        };
        let reason = match (settled, cause) {
            (Some(RunState::Stopped), _) | (_, TerminationCause::Stopped) => {
                CompletionReason::Stopped
            }
            (_, TerminationCause::TimedOut) => CompletionReason::TimedOut,
            (_, TerminationCause::Exited) => CompletionReason::Exited,
        };

        let (stdout, stderr) = self.collector.finish(self.linger).await;
        self.workdir.remove().await;

        let outcome = RunOutcome {
            run_id,
            key: key.clone(),
            pid: self.process.pid(),
            reason,
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            forced_kill: forced,
            stdout,
            stderr,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            %key,
            %run_id,
            pid = outcome.pid,
            elapsed_ms = (outcome.finished_at - outcome.started_at).num_milliseconds(),
            reason = ?outcome.reason,
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            forced_kill = outcome.forced_kill,
            "run finished"
        );

        self.registry.release(&key, run_id);
        let report = outcome.report(self.excerpt_chars);
        self.done.send_replace(Some(Arc::new(outcome)));
        self.notifier.notify(Notification::RunCompleted(report)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::time::Instant;
    use tokio_stream::{StreamExt, wrappers::ReceiverStream};

    use super::*;
    use crate::{
        core::{
            errors::GateRejection,
            traits::{gate::MockGate, notifier::MockNotifier},
        },
        notifiers::ChannelNotifier,
        stubs::gate::GateStub,
    };

    fn config(root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            interpreter: "sh".into(),
            work_root: root.to_path_buf(),
            script_file_name: "main.sh".to_string(),
            grace_period: Duration::from_secs(1),
            drain_linger: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn supervisor(config: SupervisorConfig) -> (Supervisor, ReceiverStream<Notification>) {
        let (notifier, stream) = ChannelNotifier::new(64);
        let supervisor = Supervisor::new(config, Arc::new(GateStub::allow_all()), Arc::new(notifier));
        (supervisor, stream)
    }

    fn submit(supervisor: &Supervisor, owner: &str, name: &str, source: &str) {
        supervisor
            .store()
            .put(Artifact::new(RunKey::new(owner, name), source));
    }

    async fn next_notification(stream: &mut ReceiverStream<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("no notification")
            .expect("notification stream closed")
    }

    async fn work_root_is_empty(root: &Path) -> bool {
        let mut entries = tokio::fs::read_dir(root).await.unwrap();
        entries.next_entry().await.unwrap().is_none()
    }

    #[tokio::test]
    async fn test_natural_exit_is_reported_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, mut notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "a.sh", "echo hello\necho oops >&2\nexit 3\n");

        let started = supervisor
            .start_run("1", "a.sh", RunMode::Supervised)
            .await
            .unwrap();
        let outcome = started.completion.wait().await.unwrap();

        assert_eq!(outcome.reason, CompletionReason::Exited);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.bytes, b"hello\n");
        assert_eq!(outcome.stderr.bytes, b"oops\n");
        assert_eq!(outcome.pid, started.pid);
        assert!(supervisor.lookup(&RunKey::new("1", "a.sh")).is_none());
        assert!(work_root_is_empty(root.path()).await);

        assert!(matches!(
            next_notification(&mut notifications).await,
            Notification::RunStarted { pid, .. } if pid == started.pid
        ));
        match next_notification(&mut notifications).await {
            Notification::RunCompleted(report) => {
                assert_eq!(report.run_id, started.run_id);
                assert_eq!(report.exit_code, Some(3));
                assert_eq!(report.stdout_excerpt, "hello\n");
                assert!(!report.truncated());
            }
            other => panic!("Expected RunCompleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_one_shot_timeout() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "slow.sh", "echo hello\nsleep 30\n");

        let begin = Instant::now();
        let started = supervisor
            .start_run(
                "1",
                "slow.sh",
                RunMode::OneShot {
                    timeout: Duration::from_secs(1),
                },
            )
            .await
            .unwrap();
        let outcome = started.completion.wait().await.unwrap();

        assert_eq!(outcome.reason, CompletionReason::TimedOut);
        assert_eq!(outcome.stdout.bytes, b"hello\n");
        // timeout + grace, plus slack for a loaded machine
        assert!(begin.elapsed() < Duration::from_secs(4));
        assert!(supervisor.list_runs().is_empty());
    }

    #[tokio::test]
    async fn test_stop_supervised_run() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "daemon.sh", "sleep 60\n");

        let started = supervisor
            .start_run("1", "daemon.sh", RunMode::Supervised)
            .await
            .unwrap();
        let key = RunKey::new("1", "daemon.sh");
        assert_eq!(supervisor.lookup(&key).unwrap().state, RunState::Running);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(supervisor.stop_run("1", "daemon.sh").await);
        assert!(supervisor.lookup(&key).is_none());

        let outcome = started.completion.wait().await.unwrap();
        assert_eq!(outcome.reason, CompletionReason::Stopped);
        assert!(!outcome.forced_kill);

        assert!(!supervisor.stop_run("1", "daemon.sh").await);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "stubborn.sh", "trap '' TERM\nsleep 60\n");

        let started = supervisor
            .start_run("1", "stubborn.sh", RunMode::Supervised)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(supervisor.stop_run("1", "stubborn.sh").await);
        let outcome = started.completion.wait().await.unwrap();

        assert_eq!(outcome.reason, CompletionReason::Stopped);
        assert!(outcome.forced_kill);
        assert!(supervisor.list_runs().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_run_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, mut notifications) = supervisor(config(root.path()));

        assert!(!supervisor.stop_run("1", "nothing.sh").await);
        assert!(supervisor.list_runs().is_empty());
        tokio::time::timeout(Duration::from_millis(100), notifications.next())
            .await
            .expect_err("Should not receive any notifications");
    }

    #[tokio::test]
    async fn test_restart_supersedes_previous_run() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "bot.sh", "sleep 60\n");

        let first = supervisor
            .start_run("1", "bot.sh", RunMode::Supervised)
            .await
            .unwrap();
        let second = supervisor
            .start_run("1", "bot.sh", RunMode::Supervised)
            .await
            .unwrap();

        let first_outcome = first.completion.wait().await.unwrap();
        assert_eq!(first_outcome.reason, CompletionReason::Stopped);

        let runs = supervisor.list_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].1.run_id, second.run_id);

        assert!(supervisor.stop_run("1", "bot.sh").await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_for_one_key_leave_one_live_handle() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "bot.sh", "sleep 60\n");

        let (a, b) = tokio::join!(
            supervisor.start_run("1", "bot.sh", RunMode::Supervised),
            supervisor.start_run("1", "bot.sh", RunMode::Supervised),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let runs = supervisor.list_runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].1.run_id == a.run_id || runs[0].1.run_id == b.run_id);
        assert!(supervisor.start_locks.is_empty());

        assert_eq!(supervisor.stop_all().await, 1);
        let outcomes = [a.completion.wait().await.unwrap(), b.completion.wait().await.unwrap()];
        assert!(outcomes.iter().all(|o| o.reason == CompletionReason::Stopped));
    }

    #[tokio::test]
    async fn test_start_locks_are_dropped_after_use() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        for name in ["a.sh", "b.sh", "c.sh"] {
            submit(&supervisor, "1", name, "exit 0\n");
            let started = supervisor
                .start_run("1", name, RunMode::Supervised)
                .await
                .unwrap();
            started.completion.wait().await.unwrap();
        }
        let _ = supervisor.start_run("1", "ghost.sh", RunMode::Supervised).await;

        assert!(supervisor.start_locks.is_empty());
    }

    #[tokio::test]
    async fn test_unread_notifications_do_not_block_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let (notifier, _unread) = ChannelNotifier::new(1);
        let supervisor = Supervisor::new(
            config(root.path()),
            Arc::new(GateStub::allow_all()),
            Arc::new(notifier),
        );
        submit(&supervisor, "1", "a.sh", "sleep 60\n");
        submit(&supervisor, "1", "b.sh", "sleep 60\n");
        submit(&supervisor, "2", "quick.sh", "exit 0\n");

        tokio::time::timeout(Duration::from_secs(10), async {
            for name in ["a.sh", "b.sh"] {
                supervisor
                    .start_run("1", name, RunMode::Supervised)
                    .await
                    .unwrap();
            }
            assert_eq!(supervisor.stop_all().await, 2);

            let started = supervisor
                .start_run("2", "quick.sh", RunMode::Supervised)
                .await
                .unwrap();
            let outcome = started.completion.wait().await.unwrap();
            assert_eq!(outcome.reason, CompletionReason::Exited);
        })
        .await
        .expect("lifecycle waited on notification delivery");

        assert!(supervisor.list_runs().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_spares_runs_started_while_it_runs() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "stubborn.sh", "trap '' TERM\nsleep 60\n");
        submit(&supervisor, "2", "late.sh", "sleep 60\n");

        let stubborn = supervisor
            .start_run("1", "stubborn.sh", RunMode::Supervised)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // stop_all needs the full grace period for the stubborn run.
        let ((stopped, stop_done), (late, late_started)) = tokio::join!(
            async {
                let stopped = supervisor.stop_all().await;
                (stopped, Instant::now())
            },
            async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let late = supervisor.start_run("2", "late.sh", RunMode::Supervised).await;
                (late, Instant::now())
            },
        );
        let late = late.unwrap();

        assert!(late_started < stop_done);
        assert_eq!(stopped, 1);
        assert_eq!(
            stubborn.completion.wait().await.unwrap().reason,
            CompletionReason::Stopped
        );
        let info = supervisor.lookup(&RunKey::new("2", "late.sh")).unwrap();
        assert_eq!(info.run_id, late.run_id);
        assert_eq!(info.state, RunState::Running);
        assert!(supervisor.lookup(&RunKey::new("1", "stubborn.sh")).is_none());

        assert_eq!(supervisor.stop_all().await, 1);
    }

    #[tokio::test]
    async fn test_stop_all_spares_replacement_under_same_key() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "bot.sh", "trap '' TERM\nsleep 60\n");
        let key = RunKey::new("1", "bot.sh");

        let first = supervisor
            .start_run("1", "bot.sh", RunMode::Supervised)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (stopped, replacement) = tokio::join!(supervisor.stop_all(), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            supervisor.start_run("1", "bot.sh", RunMode::Supervised).await
        });
        let replacement = replacement.unwrap();

        assert_eq!(stopped, 1);
        assert_ne!(replacement.run_id, first.run_id);
        assert_eq!(
            first.completion.wait().await.unwrap().reason,
            CompletionReason::Stopped
        );
        let info = supervisor.lookup(&key).unwrap();
        assert_eq!(info.run_id, replacement.run_id);
        assert_eq!(info.state, RunState::Running);

        assert_eq!(supervisor.stop_all().await, 1);
        assert_eq!(
            replacement.completion.wait().await.unwrap().reason,
            CompletionReason::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_all_stops_every_live_run() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        for (owner, name) in [("1", "a.sh"), ("1", "b.sh"), ("2", "a.sh")] {
            submit(&supervisor, owner, name, "sleep 60\n");
            supervisor
                .start_run(owner, name, RunMode::Supervised)
                .await
                .unwrap();
        }
        assert_eq!(supervisor.list_runs().len(), 3);

        assert_eq!(supervisor.stop_all().await, 3);
        assert!(supervisor.list_runs().is_empty());
        assert!(work_root_is_empty(root.path()).await);

        submit(&supervisor, "3", "late.sh", "sleep 60\n");
        let late = supervisor
            .start_run("3", "late.sh", RunMode::Supervised)
            .await
            .unwrap();
        assert_eq!(supervisor.list_runs().len(), 1);
        assert_eq!(supervisor.stop_all().await, 1);
        assert_eq!(
            late.completion.wait().await.unwrap().reason,
            CompletionReason::Stopped
        );
        assert_eq!(supervisor.stop_all().await, 0);
    }

    #[tokio::test]
    async fn test_owner_limit() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(SupervisorConfig {
            max_runs_per_owner: 1,
            ..config(root.path())
        });
        submit(&supervisor, "1", "a.sh", "sleep 60\n");
        submit(&supervisor, "1", "b.sh", "sleep 60\n");
        submit(&supervisor, "2", "a.sh", "sleep 60\n");

        supervisor
            .start_run("1", "a.sh", RunMode::Supervised)
            .await
            .unwrap();
        let result = supervisor.start_run("1", "b.sh", RunMode::Supervised).await;
        assert!(matches!(
            result,
            Err(StartRunError::Start(StartError::OwnerLimit { limit: 1, .. }))
        ));

        // Replacing the owner's own run does not count against the limit.
        supervisor
            .start_run("1", "a.sh", RunMode::Supervised)
            .await
            .unwrap();
        supervisor
            .start_run("2", "a.sh", RunMode::Supervised)
            .await
            .unwrap();

        assert_eq!(supervisor.stop_all().await, 2);
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, mut notifications) = supervisor(SupervisorConfig {
            interpreter: "/aboba/python3".into(),
            ..config(root.path())
        });
        submit(&supervisor, "1", "a.sh", "echo hi\n");

        let result = supervisor.start_run("1", "a.sh", RunMode::Supervised).await;

        assert!(matches!(
            result,
            Err(StartRunError::Start(StartError::InterpreterNotFound { .. }))
        ));
        assert!(supervisor.list_runs().is_empty());
        assert!(work_root_is_empty(root.path()).await);
        assert!(matches!(
            next_notification(&mut notifications).await,
            Notification::RunStartFailed { .. }
        ));

        // The failed start must not leak the owner's slot.
        let retry = supervisor.start_run("1", "a.sh", RunMode::Supervised).await;
        assert!(matches!(
            retry,
            Err(StartRunError::Start(StartError::InterpreterNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unknown_artifact() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));

        let result = supervisor.start_run("1", "ghost.sh", RunMode::Supervised).await;

        assert!(matches!(result, Err(StartRunError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_gate_rejection_spawns_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut gate = MockGate::new();
        gate.expect_check()
            .times(1)
            .returning(|_| Err(GateRejection::DeniedImport { module: "os".to_string() }));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();
        let supervisor = Supervisor::new(config(root.path()), Arc::new(gate), Arc::new(notifier));
        submit(&supervisor, "1", "evil.py", "import os\n");

        let result = supervisor.start_run("1", "evil.py", RunMode::Supervised).await;

        assert!(matches!(
            result,
            Err(StartRunError::Rejected(GateRejection::DeniedImport { ref module })) if module == "os"
        ));
        assert!(supervisor.list_runs().is_empty());
        assert!(work_root_is_empty(root.path()).await);
    }

    #[tokio::test]
    async fn test_output_cap_applies() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(SupervisorConfig {
            output_cap_bytes: 1000,
            ..config(root.path())
        });
        submit(&supervisor, "1", "noisy.sh", "head -c 5000 /dev/zero\nprintf 'abc'\n");
        submit(&supervisor, "1", "quiet.sh", "printf 'abc'\n");

        let noisy = supervisor
            .start_run("1", "noisy.sh", RunMode::Supervised)
            .await
            .unwrap()
            .completion
            .wait()
            .await
            .unwrap();
        let quiet = supervisor
            .start_run("1", "quiet.sh", RunMode::Supervised)
            .await
            .unwrap()
            .completion
            .wait()
            .await
            .unwrap();

        assert_eq!(noisy.stdout.bytes.len(), 1000);
        assert!(noisy.stdout.truncated);
        assert!(noisy.report(100).truncated());
        assert_eq!(quiet.stdout.bytes, b"abc");
        assert!(!quiet.stdout.truncated);
    }

    #[tokio::test]
    async fn test_stop_racing_natural_exit_resolves_once() {
        let root = tempfile::tempdir().unwrap();
        let (supervisor, _notifications) = supervisor(config(root.path()));
        submit(&supervisor, "1", "quick.sh", "exit 0\n");

        for _ in 0..20 {
            let started = supervisor
                .start_run("1", "quick.sh", RunMode::Supervised)
                .await
                .unwrap();
            let stopped = supervisor.stop_run("1", "quick.sh").await;
            let outcome = started.completion.wait().await.unwrap();

            if stopped {
                assert_eq!(outcome.reason, CompletionReason::Stopped);
            } else {
                assert_eq!(outcome.reason, CompletionReason::Exited);
            }
            assert!(supervisor.list_runs().is_empty());
        }
        assert!(work_root_is_empty(root.path()).await);
    }
}
