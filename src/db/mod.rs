use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{Job, OwnerId};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// One page of an owner's finished jobs.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<Job>,
    pub total: u64,
    /// Page and size the query actually ran with.
    pub page: u32,
    pub page_size: u32,
}

/// Durable record of submitted and finished jobs.
///
/// The orchestrator only writes whole records; the store serializes writes
/// per job id and last writer wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the record for `job.id`.
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Terminal jobs of `owner`, newest first. `page` is 1-based.
    ///
    /// `search` is a case-insensitive substring match over title, tags and
    /// lyrics.
    async fn list(
        &self,
        owner: &OwnerId,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<HistoryPage, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Jobs left `pending` or `processing`, oldest first. Used at startup.
    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored job record is invalid: {0}")]
    Corrupt(String),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// Row offset for a 1-based page.
pub(crate) fn page_offset(page: u32, page_size: u32) -> u64 {
    u64::from(page.max(1) - 1) * u64::from(page_size)
}
