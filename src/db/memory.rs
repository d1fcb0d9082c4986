use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::db::{page_offset, HistoryPage, JobStore, StoreError};
use crate::models::job::{Job, JobStatus, OwnerId};

/// Process-local job store. Used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn list(
        &self,
        owner: &OwnerId,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<HistoryPage, StoreError> {
        let mut matching: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.is_owned_by(owner) && job.status.is_terminal())
            .filter(|job| search.map_or(true, |needle| job.matches_search(needle)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let offset = usize::try_from(page_offset(page, page_size)).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();

        Ok(HistoryPage {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.jobs.write().remove(&job_id).is_some())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Processing))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
