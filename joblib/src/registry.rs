use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::job::Job;

/// Process-wide id to job map. Lookups run concurrently; inserts serialize.
/// Jobs are retained for the lifetime of the process so queries and
/// historical output keep working after termination.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are v4 uuids generated at construction, so keys are never reused.
    pub fn insert(&self, job: Arc<Job>) {
        self.jobs.write().unwrap().insert(job.id(), job);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Snapshot of every registered job.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
