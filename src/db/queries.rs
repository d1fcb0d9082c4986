use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::db::{page_offset, HistoryPage, JobStore, StoreError};
use crate::models::job::{
    FailureReason, GenerationParams, Job, JobProgress, JobResult, JobStatus, OwnerId,
};

const JOB_COLUMNS: &str = r#"
    id, owner_id, status, title, lyrics, tags, max_audio_length_ms, temperature, topk,
    cfg_scale, progress_current, progress_total, audio_path, thumbnail_path, duration_ms,
    failure_reason, error, created_at, started_at, finished_at
"#;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    /// Upsert a job record. Parameters and owner are written once on insert.
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let progress = job.progress.unwrap_or_default();
        let has_progress = job.progress.is_some();
        let result = job.result.as_ref();

        sqlx::query(
            r#"
            INSERT INTO generation_jobs (
                id, owner_id, status, title, lyrics, tags, max_audio_length_ms, temperature,
                topk, cfg_scale, progress_current, progress_total, audio_path, thumbnail_path,
                duration_ms, failure_reason, error, created_at, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                progress_current = EXCLUDED.progress_current,
                progress_total = EXCLUDED.progress_total,
                audio_path = EXCLUDED.audio_path,
                thumbnail_path = EXCLUDED.thumbnail_path,
                duration_ms = EXCLUDED.duration_ms,
                failure_reason = EXCLUDED.failure_reason,
                error = EXCLUDED.error,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id.as_str())
        .bind(job.status.to_string())
        .bind(job.params.title.as_deref())
        .bind(&job.params.lyrics)
        .bind(&job.params.tags)
        .bind(to_i32(job.params.max_audio_length_ms))
        .bind(job.params.temperature)
        .bind(to_i32(job.params.topk))
        .bind(job.params.cfg_scale)
        .bind(has_progress.then(|| to_i32(progress.current)))
        .bind(has_progress.then(|| to_i32(progress.total)))
        .bind(result.map(|r| r.audio_path.as_str()))
        .bind(result.and_then(|r| r.thumbnail_path.as_deref()))
        .bind(result.map(|r| i64::try_from(r.duration_ms).unwrap_or(i64::MAX)))
        .bind(job.failure_reason.map(|r| r.to_string()))
        .bind(job.error.as_deref())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(
        &self,
        owner: &OwnerId,
        page: u32,
        page_size: u32,
        search: Option<&str>,
    ) -> Result<HistoryPage, StoreError> {
        let pattern = search
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM generation_jobs
            WHERE owner_id = $1
              AND status IN ('completed', 'failed', 'cancelled')
              AND ($2::TEXT IS NULL OR title ILIKE $2 OR lyrics ILIKE $2 OR tags ILIKE $2)
            "#,
        )
        .bind(owner.as_str())
        .bind(pattern.as_deref())
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE owner_id = $1
              AND status IN ('completed', 'failed', 'cancelled')
              AND ($2::TEXT IS NULL OR title ILIKE $2 OR lyrics ILIKE $2 OR tags ILIKE $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(owner.as_str())
        .bind(pattern.as_deref())
        .bind(i64::from(page_size))
        .bind(i64::try_from(page_offset(page, page_size)).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage {
            items,
            total: u64::try_from(total).unwrap_or_default(),
            page,
            page_size,
        })
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM generation_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|_| StoreError::Corrupt(format!("unknown status {status:?}")))?;

    let failure_reason = row
        .try_get::<Option<String>, _>("failure_reason")?
        .map(|reason| {
            reason
                .parse::<FailureReason>()
                .map_err(|_| StoreError::Corrupt(format!("unknown failure reason {reason:?}")))
        })
        .transpose()?;

    let progress = match (
        row.try_get::<Option<i32>, _>("progress_current")?,
        row.try_get::<Option<i32>, _>("progress_total")?,
    ) {
        (Some(current), Some(total)) => Some(JobProgress::new(from_i32(current), from_i32(total))),
        _ => None,
    };

    let result = row
        .try_get::<Option<String>, _>("audio_path")?
        .map(|audio_path| -> Result<JobResult, StoreError> {
            Ok(JobResult {
                audio_path,
                thumbnail_path: row.try_get("thumbnail_path")?,
                duration_ms: row
                    .try_get::<Option<i64>, _>("duration_ms")?
                    .and_then(|d| u64::try_from(d).ok())
                    .unwrap_or_default(),
            })
        })
        .transpose()?;

    Ok(Job {
        id: row.try_get("id")?,
        owner_id: OwnerId::new(row.try_get::<String, _>("owner_id")?),
        status,
        params: GenerationParams {
            lyrics: row.try_get("lyrics")?,
            tags: row.try_get("tags")?,
            title: row.try_get("title")?,
            max_audio_length_ms: from_i32(row.try_get("max_audio_length_ms")?),
            temperature: row.try_get("temperature")?,
            topk: from_i32(row.try_get("topk")?),
            cfg_scale: row.try_get("cfg_scale")?,
        },
        progress,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        result,
        failure_reason,
        error: row.try_get("error")?,
    })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

/// Escape `LIKE` wildcards so user input matches literally.
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
