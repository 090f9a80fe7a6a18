use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::worker::Job;

/// In-memory job registry, keyed by owner and then job id.
///
/// The registry is shared between all RPC handler tasks; jobs stay
/// registered after they stop, so status queries against finished jobs
/// remain authorized by ownership until the process exits.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, HashMap<String, Arc<Job>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a job under an owner. Returns `None` whether the id is
    /// unknown or belongs to a different owner.
    pub async fn get(&self, owner: &str, id: &str) -> Option<Arc<Job>> {
        let jobs = self.jobs.read().await;
        jobs.get(owner)?.get(id).cloned()
    }

    /// Insert or replace a job under an owner, creating the owner's bucket
    /// on first insert.
    pub async fn upsert(&self, owner: &str, job: Arc<Job>) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(owner.to_string())
            .or_default()
            .insert(job.id().to_string(), job);
    }

    /// Remove a job from an owner's bucket, returning it if present.
    pub async fn remove(&self, owner: &str, id: &str) -> Option<Arc<Job>> {
        let mut jobs = self.jobs.write().await;
        jobs.get_mut(owner)?.remove(id)
    }
}
