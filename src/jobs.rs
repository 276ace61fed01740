use crate::{
    clock::SharedClock,
    config::QueueConfig,
    models::TriggerKind,
    store::Store,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, sqlite::{SqlitePool, SqliteRow}};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SINGLE_ITEM_PRIORITY: i64 = 1;
pub const BATCH_PRIORITY: i64 = 5;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub shop: String,
    pub trigger: TriggerKind,
    pub product_id: Option<String>,
    pub max_products: Option<u32>,
}

impl JobRequest {
    pub fn batch(shop: &str, trigger: TriggerKind, max_products: Option<u32>) -> Self {
        Self {
            shop: shop.to_string(),
            trigger,
            product_id: None,
            max_products,
        }
    }

    pub fn single(shop: &str, trigger: TriggerKind, product_id: &str) -> Self {
        Self {
            shop: shop.to_string(),
            trigger,
            product_id: Some(product_id.to_string()),
            max_products: Some(1),
        }
    }

    pub fn priority(&self) -> i64 {
        if self.product_id.is_some() {
            SINGLE_ITEM_PRIORITY
        } else {
            BATCH_PRIORITY
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub request: JobRequest,
    pub attempts: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Value },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub shop: String,
    pub trigger: TriggerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub state: JobState,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    Exhausted,
}

/// SQLite-backed job queue shared by the HTTP surface, the scheduler and
/// the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
    clock: SharedClock,
    config: QueueConfig,
}

fn request_from_row(row: &SqliteRow) -> Result<JobRequest, QueueError> {
    let trigger: String = row.try_get("trigger_kind")?;
    Ok(JobRequest {
        shop: row.try_get("shop")?,
        trigger: TriggerKind::parse(&trigger).ok_or_else(|| QueueError::Corrupt(format!("trigger {trigger}")))?,
        product_id: row.try_get("product_id")?,
        max_products: row.try_get("max_products")?,
    })
}

/// `base · 2^(attempt-1)` plus up to a quarter of `base` as jitter.
pub fn backoff_delay(base_ms: u64, attempt: i64) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 16) as u32;
    let delay = base_ms.saturating_mul(1u64 << exponent);
    let jitter = if base_ms >= 4 {
        rand::rng().random_range(0..=base_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay.saturating_add(jitter))
}

impl JobQueue {
    pub fn new(store: &Store, clock: SharedClock, config: QueueConfig) -> Self {
        Self {
            pool: store.pool().clone(),
            notify: Arc::new(Notify::new()),
            clock,
            config,
        }
    }

    pub async fn enqueue(&self, request: JobRequest) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        sqlx::query(
            r#"
            INSERT INTO enrichment_jobs (
                id, shop, trigger_kind, product_id, max_products, priority, status,
                attempts, run_after, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'queued', 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.shop)
        .bind(request.trigger.as_str())
        .bind(&request.product_id)
        .bind(request.max_products)
        .bind(request.priority())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        info!(
            target = "smartenrich.queue",
            job_id = %id,
            shop = %request.shop,
            trigger = request.trigger.as_str(),
            priority = request.priority(),
            "job_enqueued"
        );
        self.notify.notify_one();
        Ok(id)
    }

    /// Leases the next runnable job: lowest priority value, then oldest.
    /// Active jobs whose lease expired are redelivered.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = self.clock.now_millis();
        let exhausted = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'failed', last_error = COALESCE(last_error, 'lease expired on final attempt'),
                locked_until = NULL, updated_at = ?1
            WHERE status = 'active' AND locked_until < ?1 AND attempts >= ?2
            "#,
        )
        .bind(now)
        .bind(self.config.max_attempts)
        .execute(&self.pool)
        .await?;
        if exhausted.rows_affected() > 0 {
            warn!(target = "smartenrich.queue", count = exhausted.rows_affected(), "stalled_jobs_failed");
        }

        let locked_until = now + self.config.lock_secs * 1000;
        let row = sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'active', attempts = attempts + 1, locked_until = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM enrichment_jobs
                WHERE (status = 'queued' AND run_after <= ?2)
                   OR (status = 'active' AND locked_until < ?2)
                ORDER BY priority ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING id, shop, trigger_kind, product_id, max_products, attempts
            "#,
        )
        .bind(locked_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let job = ClaimedJob {
            id: row.try_get("id")?,
            request: request_from_row(&row)?,
            attempts: row.try_get("attempts")?,
        };
        debug!(target = "smartenrich.queue", job_id = %job.id, attempts = job.attempts, "job_claimed");
        Ok(Some(job))
    }

    pub async fn complete(&self, job_id: &str, result: &Value) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE enrichment_jobs
            SET status = 'completed', result = ?, locked_until = NULL, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result.to_string())
        .bind(self.clock.now_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed attempt; requeues with backoff until attempts run out.
    pub async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<Retry, QueueError> {
        let now = self.clock.now_millis();
        let retry = if job.attempts >= self.config.max_attempts {
            Retry::Exhausted
        } else {
            Retry::After(backoff_delay(self.config.backoff_ms, job.attempts))
        };
        match retry {
            Retry::Exhausted => {
                sqlx::query(
                    "UPDATE enrichment_jobs SET status = 'failed', last_error = ?, locked_until = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(error)
                .bind(now)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            }
            Retry::After(delay) => {
                sqlx::query(
                    r#"
                    UPDATE enrichment_jobs
                    SET status = 'queued', last_error = ?, locked_until = NULL, run_after = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(error)
                .bind(now + delay.as_millis() as i64)
                .bind(now)
                .bind(&job.id)
                .execute(&self.pool)
                .await?;
            }
        }
        warn!(
            target = "smartenrich.queue",
            job_id = %job.id,
            attempts = job.attempts,
            retry = ?retry,
            error = error,
            "job_attempt_failed"
        );
        Ok(retry)
    }

    /// Fails a job without further retries (missing credentials and the like).
    pub async fn fail_permanently(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE enrichment_jobs SET status = 'failed', last_error = ?, locked_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(self.clock.now_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobInfo>, QueueError> {
        let row = sqlx::query("SELECT * FROM enrichment_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let request = request_from_row(&row)?;
        let status: String = row.try_get("status")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let state = match status.as_str() {
            "queued" => JobState::Queued,
            "active" => JobState::Running,
            "completed" => {
                let raw: Option<String> = row.try_get("result")?;
                JobState::Completed {
                    result: raw
                        .and_then(|text| serde_json::from_str(&text).ok())
                        .unwrap_or(Value::Null),
                }
            }
            "failed" => JobState::Failed {
                error: last_error.clone().unwrap_or_default(),
            },
            other => return Err(QueueError::Corrupt(format!("status {other}"))),
        };
        Ok(Some(JobInfo {
            id: row.try_get("id")?,
            shop: request.shop,
            trigger: request.trigger,
            product_id: request.product_id,
            attempts: row.try_get("attempts")?,
            last_error,
            state,
        }))
    }

    /// Sleeps until something is enqueued or the poll interval elapses.
    pub async fn wait(&self) {
        let _ = tokio::time::timeout(self.config.poll, self.notify.notified()).await;
    }
}
