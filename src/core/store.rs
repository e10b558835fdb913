use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;

use crate::core::domain::{Artifact, RunKey};

/// In-memory home of approved artifacts, keyed like the registry.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    artifacts: DashMap<RunKey, Arc<Artifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `artifact`, returning the one it replaced.
    pub fn put(&self, artifact: Artifact) -> Option<Arc<Artifact>> {
        self.artifacts
            .insert(artifact.key.clone(), Arc::new(artifact))
    }

    pub fn get(&self, key: &RunKey) -> Option<Arc<Artifact>> {
        self.artifacts.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names_for(&self, owner: &str) -> Vec<String> {
        self.artifacts
            .iter()
            .filter(|entry| entry.key().owner == owner)
            .map(|entry| entry.key().artifact.clone())
            .sorted()
            .collect()
    }
}
