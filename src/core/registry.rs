use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::core::{
    domain::{OwnerId, RunKey, RunMode, RunOutcome, RunState},
    errors::{RegistryError, StartError},
};

/// Resolves once the run it belongs to has been fully finalized.
#[derive(Clone, Debug)]
pub struct CompletionWaiter {
    rx: watch::Receiver<Option<Arc<RunOutcome>>>,
}

pub type CompletionSender = watch::Sender<Option<Arc<RunOutcome>>>;

impl CompletionWaiter {
    pub fn channel() -> (CompletionSender, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Returns `None` only if the run's supervising task vanished without
    /// publishing an outcome.
    pub async fn wait(mut self) -> Option<Arc<RunOutcome>> {
        if self.rx.wait_for(Option::is_some).await.is_err() {
            tracing::warn!("run finished without publishing an outcome");
        }
        self.rx.borrow().clone()
    }
}

/// Live tracking object for one run.
///
/// The stdout/stderr endpoints are owned by the run's output collector; the
/// handle keeps the control side: the stop trigger and the completion signal.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub pid: u32,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    state: RunState,
    stop: Arc<Notify>,
    completion: CompletionWaiter,
}

impl RunHandle {
    pub fn new(
        run_id: Uuid,
        pid: u32,
        mode: RunMode,
        stop: Arc<Notify>,
        completion: CompletionWaiter,
    ) -> Self {
        Self {
            run_id,
            pid,
            mode,
            started_at: Utc::now(),
            state: RunState::Running,
            stop,
            completion,
        }
    }

    pub fn info(&self) -> RunInfo {
        RunInfo {
            run_id: self.run_id,
            pid: self.pid,
            mode: self.mode,
            state: self.state,
            started_at: self.started_at,
        }
    }
}

/// Read-only snapshot of a registered handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub pid: u32,
    pub mode: RunMode,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum StopClaim {
    /// The caller moved the run to `Stopping` and owns the stop sequence.
    Claimed(CompletionWaiter),
    /// Someone else is already finishing the run.
    InFlight(CompletionWaiter),
    Absent,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<RunKey, RunHandle>,
    reserved: HashMap<OwnerId, usize>,
}

/// Single source of truth for which processes are alive.
///
/// Every read and write goes through one mutex; nothing is awaited while it
/// is held.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(inner: &mut Inner, key: RunKey, handle: RunHandle) -> Result<(), RegistryError> {
        if let Some(existing) = inner.entries.get(&key) {
            if !existing.state.is_terminal() {
                tracing::error!(
                    key = %key,
                    existing = %existing.run_id,
                    rejected = %handle.run_id,
                    "refusing to register a second live handle"
                );
                return Err(RegistryError::Occupied { key });
            }
        }
        inner.entries.insert(key, handle);
        Ok(())
    }

    pub fn lookup(&self, key: &RunKey) -> Option<RunInfo> {
        self.lock().entries.get(key).map(RunHandle::info)
    }

    /// All entries, oldest first.
    pub fn list_all(&self) -> Vec<(RunKey, RunInfo)> {
        self.lock()
            .entries
            .iter()
            .map(|(key, handle)| (key.clone(), handle.info()))
            .sorted_by(|(ka, a), (kb, b)| a.started_at.cmp(&b.started_at).then_with(|| ka.cmp(kb)))
            .collect()
    }

    /// Holds one of `owner`'s `limit` concurrent slots until it is either
    /// registered or dropped.
    pub fn reserve(&self, owner: &str, limit: usize) -> Result<Reservation<'_>, StartError> {
        let mut inner = self.lock();
        let live = inner
            .entries
            .iter()
            .filter(|(key, handle)| key.owner == owner && !handle.state.is_terminal())
            .count();
        let pending = inner.reserved.get(owner).copied().unwrap_or(0);

        if live + pending >= limit {
            return Err(StartError::OwnerLimit {
                owner: owner.to_string(),
                limit,
            });
        }

        *inner.reserved.entry(owner.to_string()).or_default() += 1;
        Ok(Reservation {
            registry: self,
            owner: owner.to_string(),
            armed: true,
        })
    }

    fn release_slot(inner: &mut Inner, owner: &str) {
        if let Some(count) = inner.reserved.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.reserved.remove(owner);
            }
        }
    }

    /// Moves a running entry to `Stopping` and fires its stop trigger.
    ///
    /// With `run_id` set, an entry belonging to any other run counts as
    /// absent.
    pub fn claim_stop(&self, key: &RunKey, run_id: Option<Uuid>) -> StopClaim {
        let mut inner = self.lock();
        let Some(handle) = inner
            .entries
            .get_mut(key)
            .filter(|handle| run_id.is_none_or(|id| id == handle.run_id))
        else {
            return StopClaim::Absent;
        };

        match handle.state.transition(RunState::Stopping) {
            Ok(next) => {
                handle.state = next;
                handle.stop.notify_one();
                StopClaim::Claimed(handle.completion.clone())
            }
            Err(_) => StopClaim::InFlight(handle.completion.clone()),
        }
    }

    /// Records that the process of `run_id` is gone and returns the terminal
    /// state it landed in. A run already claimed by a stop lands in
    /// `Stopped`, otherwise in `Exited`.
    pub fn settle(&self, key: &RunKey, run_id: Uuid) -> Option<RunState> {
        let mut inner = self.lock();
        let handle = inner
            .entries
            .get_mut(key)
            .filter(|handle| handle.run_id == run_id)?;

        let next = match handle.state {
            RunState::Running => RunState::Exited,
            RunState::Stopping => RunState::Stopped,
            terminal => return Some(terminal),
        };
        handle.state = handle.state.transition(next).ok()?;
        Some(handle.state)
    }

    /// Removes the entry for `key` only if it still belongs to `run_id`.
    pub fn release(&self, key: &RunKey, run_id: Uuid) -> Option<RunHandle> {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(handle) if handle.run_id == run_id => inner.entries.remove(key),
            _ => None,
        }
    }
}

/// A slot counted against an owner's concurrency limit.
#[derive(Debug)]
pub struct Reservation<'a> {
    registry: &'a ProcessRegistry,
    owner: OwnerId,
    armed: bool,
}

impl Reservation<'_> {
    /// Turns the slot into a registered handle under the same lock.
    ///
    /// Fails if `key` already holds a non-terminal handle: callers must stop
    /// and wait out the existing run first. The slot is released either way.
    pub fn register(mut self, key: RunKey, handle: RunHandle) -> Result<(), RegistryError> {
        let mut inner = self.registry.lock();
        ProcessRegistry::release_slot(&mut inner, &self.owner);
        self.armed = false;
        ProcessRegistry::insert(&mut inner, key, handle)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            ProcessRegistry::release_slot(&mut self.registry.lock(), &self.owner);
        }
    }
}
