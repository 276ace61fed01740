use crate::models::{
    CatalogItem, EnrichmentLog, EnrichmentRun, LogStatus, RunStatus, TenantSettings, TriggerKind,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use std::{collections::HashSet, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// An approval claim older than this is treated as abandoned: the worker or
/// request that stamped it died before settling the log.
pub const CLAIM_STALE_AFTER_SECS: i64 = 15 * 60;

fn claim_cutoff(now: DateTime<Utc>) -> i64 {
    millis(now) - CLAIM_STALE_AFTER_SECS * 1000
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS enrichment_runs (
        id TEXT PRIMARY KEY,
        shop TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        total_products INTEGER NOT NULL DEFAULT 0,
        enriched_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        skipped_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enrichment_logs (
        id TEXT PRIMARY KEY,
        run_id TEXT,
        shop TEXT NOT NULL,
        product_id TEXT NOT NULL,
        product_title TEXT NOT NULL,
        score_before INTEGER NOT NULL,
        score_after INTEGER,
        confidence REAL,
        status TEXT NOT NULL,
        original_data TEXT NOT NULL DEFAULT '{}',
        proposed_changes TEXT,
        applied_changes TEXT,
        ai_model TEXT,
        ai_response_raw TEXT,
        search_data TEXT,
        image_data TEXT,
        error_message TEXT,
        processed_at INTEGER NOT NULL,
        approved_at INTEGER,
        applied_at INTEGER,
        FOREIGN KEY (run_id) REFERENCES enrichment_runs(id)
    )
    "#,
    // At most one pending-or-applied log per item.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_logs_blocking_item
        ON enrichment_logs(shop, product_id)
        WHERE status IN ('pending', 'applied')
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_run ON enrichment_logs(run_id, processed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_runs_shop ON enrichment_runs(shop, started_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS enrichment_jobs (
        id TEXT PRIMARY KEY,
        shop TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        product_id TEXT,
        max_products INTEGER,
        priority INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        attempts INTEGER NOT NULL DEFAULT 0,
        run_after INTEGER NOT NULL,
        locked_until INTEGER,
        last_error TEXT,
        result TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON enrichment_jobs(status, priority, run_after)",
    r#"
    CREATE TABLE IF NOT EXISTS tenant_settings (
        shop TEXT PRIMARY KEY,
        cron_schedule TEXT NOT NULL,
        cron_enabled INTEGER NOT NULL,
        auto_apply INTEGER NOT NULL,
        max_products_per_run INTEGER NOT NULL,
        min_confidence REAL NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tenant_credentials (
        shop TEXT PRIMARY KEY,
        access_token TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

/// Run counters, rewritten after every item.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RunCounters {
    pub total: i64,
    pub enriched: i64,
    pub failed: i64,
    pub skipped: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogInsert {
    Inserted(String),
    /// Another pending or applied log already holds the item.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct NewLog {
    pub run_id: Option<String>,
    pub shop: String,
    pub product_id: String,
    pub product_title: String,
    pub score_before: i64,
    pub score_after: Option<i64>,
    pub confidence: Option<f64>,
    pub status: LogStatus,
    pub original_data: Value,
    pub proposed_changes: Option<Value>,
    pub ai_model: Option<String>,
    pub ai_response_raw: Option<String>,
    pub search_data: Option<Value>,
    pub image_data: Option<Value>,
    pub error_message: Option<String>,
    /// Set when the log is written already approved (auto-apply claims).
    pub pre_approved: bool,
}

impl NewLog {
    pub fn for_item(run_id: Option<&str>, shop: &str, item: &CatalogItem, status: LogStatus) -> Self {
        Self {
            run_id: run_id.map(str::to_string),
            shop: shop.to_string(),
            product_id: item.id.clone(),
            product_title: item.title.clone(),
            score_before: 0,
            score_after: None,
            confidence: None,
            status,
            original_data: item.snapshot(),
            proposed_changes: None,
            ai_model: None,
            ai_response_raw: None,
            search_data: None,
            image_data: None,
            error_message: None,
            pre_approved: false,
        }
    }
}

/// Final state for a log that was written as pending.
#[derive(Debug, Clone)]
pub struct LogTransition {
    pub status: LogStatus,
    pub score_after: Option<i64>,
    pub applied_changes: Option<Value>,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_column(row: &SqliteRow, column: &str) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.and_then(|text| serde_json::from_str(&text).ok()))
}

fn json_text(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database; the connection is never
    /// recycled so the schema survives for the life of the pool.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    // ---- runs ----

    pub async fn create_run(
        &self,
        shop: &str,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<EnrichmentRun, StoreError> {
        let run = EnrichmentRun {
            id: Uuid::new_v4().to_string(),
            shop: shop.to_string(),
            triggered_by: trigger,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            total_products: 0,
            enriched_count: 0,
            failed_count: 0,
            skipped_count: 0,
            error_message: None,
        };
        sqlx::query(
            "INSERT INTO enrichment_runs (id, shop, triggered_by, status, started_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.shop)
        .bind(trigger.as_str())
        .bind(run.status.as_str())
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    pub async fn update_run_progress(&self, run_id: &str, counters: RunCounters) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE enrichment_runs
            SET total_products = ?, enriched_count = ?, failed_count = ?, skipped_count = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(counters.total)
        .bind(counters.enriched)
        .bind(counters.failed)
        .bind(counters.skipped)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves a running run to a terminal status. Terminal runs are not touched.
    pub async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: RunCounters,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE enrichment_runs
            SET status = ?, completed_at = ?, total_products = ?, enriched_count = ?,
                failed_count = ?, skipped_count = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(millis(now))
        .bind(counters.total)
        .bind(counters.enriched)
        .bind(counters.failed)
        .bind(counters.skipped)
        .bind(error_message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<EnrichmentRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM enrichment_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn latest_run(&self, shop: &str) -> Result<Option<EnrichmentRun>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM enrichment_runs WHERE shop = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .bind(shop)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    // ---- logs ----

    pub async fn insert_log(&self, log: &NewLog, now: DateTime<Utc>) -> Result<LogInsert, StoreError> {
        let id = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO enrichment_logs (
                id, run_id, shop, product_id, product_title, score_before, score_after,
                confidence, status, original_data, proposed_changes, ai_model, ai_response_raw,
                search_data, image_data, error_message, processed_at, approved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&log.run_id)
        .bind(&log.shop)
        .bind(&log.product_id)
        .bind(&log.product_title)
        .bind(log.score_before)
        .bind(log.score_after)
        .bind(log.confidence)
        .bind(log.status.as_str())
        .bind(log.original_data.to_string())
        .bind(json_text(log.proposed_changes.as_ref()))
        .bind(&log.ai_model)
        .bind(&log.ai_response_raw)
        .bind(json_text(log.search_data.as_ref()))
        .bind(json_text(log.image_data.as_ref()))
        .bind(&log.error_message)
        .bind(millis(now))
        .bind(log.pre_approved.then(|| millis(now)))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(LogInsert::Inserted(id)),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Ok(LogInsert::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn has_blocking_log(&self, shop: &str, product_id: &str) -> Result<bool, StoreError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT id FROM enrichment_logs WHERE shop = ? AND product_id = ? AND status IN ('pending', 'applied') LIMIT 1",
        )
        .bind(shop)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Subset of `product_ids` that already hold a pending or applied log.
    pub async fn blocking_item_ids(&self, shop: &str, product_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if product_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; product_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT product_id FROM enrichment_logs WHERE shop = ? AND status IN ('pending', 'applied') AND product_id IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(shop);
        for id in product_ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?.into_iter().collect())
    }

    /// Settles a pending log. Returns false if it was no longer pending.
    pub async fn finish_log(
        &self,
        log_id: &str,
        transition: &LogTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let applied_at = (transition.status == LogStatus::Applied).then(|| millis(now));
        let done = sqlx::query(
            r#"
            UPDATE enrichment_logs
            SET status = ?, score_after = COALESCE(?, score_after), applied_changes = ?,
                error_message = ?, applied_at = COALESCE(?, applied_at)
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(transition.status.as_str())
        .bind(transition.score_after)
        .bind(json_text(transition.applied_changes.as_ref()))
        .bind(&transition.error_message)
        .bind(applied_at)
        .bind(log_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn get_log(&self, log_id: &str) -> Result<Option<EnrichmentLog>, StoreError> {
        let row = sqlx::query("SELECT * FROM enrichment_logs WHERE id = ?")
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    pub async fn logs_for_run(&self, run_id: &str, limit: i64) -> Result<Vec<EnrichmentLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM enrichment_logs WHERE run_id = ? ORDER BY processed_at DESC, rowid DESC LIMIT ?",
        )
        .bind(run_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    /// Stamps `approved_at` on a pending log that is unclaimed or whose claim
    /// went stale. Only one caller wins.
    pub async fn claim_approval(&self, log_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE enrichment_logs SET approved_at = ?
            WHERE id = ? AND status = 'pending' AND (approved_at IS NULL OR approved_at < ?)
            "#,
        )
        .bind(millis(now))
        .bind(log_id)
        .bind(claim_cutoff(now))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn mark_rejected(&self, log_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE enrichment_logs SET status = 'rejected'
            WHERE id = ? AND status = 'pending' AND (approved_at IS NULL OR approved_at < ?)
            "#,
        )
        .bind(log_id)
        .bind(claim_cutoff(now))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    // ---- tenants ----

    pub async fn tenant_settings(&self, shop: &str) -> Result<TenantSettings, StoreError> {
        let row = sqlx::query("SELECT * FROM tenant_settings WHERE shop = ?")
            .bind(shop)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => settings_from_row(&row),
            None => Ok(TenantSettings::defaults_for(shop)),
        }
    }

    pub async fn upsert_tenant_settings(
        &self,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> Result<TenantSettings, StoreError> {
        let settings = settings.clone().normalized();
        sqlx::query(
            r#"
            INSERT INTO tenant_settings (
                shop, cron_schedule, cron_enabled, auto_apply, max_products_per_run, min_confidence, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(shop) DO UPDATE SET
                cron_schedule = excluded.cron_schedule,
                cron_enabled = excluded.cron_enabled,
                auto_apply = excluded.auto_apply,
                max_products_per_run = excluded.max_products_per_run,
                min_confidence = excluded.min_confidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&settings.shop)
        .bind(&settings.cron_schedule)
        .bind(settings.cron_enabled)
        .bind(settings.auto_apply)
        .bind(settings.max_products_per_run)
        .bind(settings.min_confidence)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(settings)
    }

    pub async fn cron_tenants(&self) -> Result<Vec<TenantSettings>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tenant_settings WHERE cron_enabled = 1 ORDER BY shop")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(settings_from_row).collect()
    }

    pub async fn access_token(&self, shop: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT access_token FROM tenant_credentials WHERE shop = ?")
                .bind(shop)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn upsert_access_token(&self, shop: &str, token: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_credentials (shop, access_token, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(shop) DO UPDATE SET access_token = excluded.access_token, updated_at = excluded.updated_at
            "#,
        )
        .bind(shop)
        .bind(token)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn run_from_row(row: &SqliteRow) -> Result<EnrichmentRun, StoreError> {
    let trigger: String = row.try_get("triggered_by")?;
    let status: String = row.try_get("status")?;
    Ok(EnrichmentRun {
        id: row.try_get("id")?,
        shop: row.try_get("shop")?,
        triggered_by: TriggerKind::parse(&trigger)
            .ok_or_else(|| StoreError::Corrupt(format!("run trigger {trigger}")))?,
        status: RunStatus::parse(&status).ok_or_else(|| StoreError::Corrupt(format!("run status {status}")))?,
        started_at: from_millis(row.try_get("started_at")?),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
        total_products: row.try_get("total_products")?,
        enriched_count: row.try_get("enriched_count")?,
        failed_count: row.try_get("failed_count")?,
        skipped_count: row.try_get("skipped_count")?,
        error_message: row.try_get("error_message")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<EnrichmentLog, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(EnrichmentLog {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        shop: row.try_get("shop")?,
        product_id: row.try_get("product_id")?,
        product_title: row.try_get("product_title")?,
        score_before: row.try_get("score_before")?,
        score_after: row.try_get("score_after")?,
        confidence: row.try_get("confidence")?,
        status: LogStatus::parse(&status).ok_or_else(|| StoreError::Corrupt(format!("log status {status}")))?,
        original_data: json_column(row, "original_data")?.unwrap_or(Value::Null),
        proposed_changes: json_column(row, "proposed_changes")?,
        applied_changes: json_column(row, "applied_changes")?,
        ai_model: row.try_get("ai_model")?,
        ai_response_raw: row.try_get("ai_response_raw")?,
        search_data: json_column(row, "search_data")?,
        image_data: json_column(row, "image_data")?,
        error_message: row.try_get("error_message")?,
        processed_at: from_millis(row.try_get("processed_at")?),
        approved_at: row.try_get::<Option<i64>, _>("approved_at")?.map(from_millis),
        applied_at: row.try_get::<Option<i64>, _>("applied_at")?.map(from_millis),
    })
}

fn settings_from_row(row: &SqliteRow) -> Result<TenantSettings, StoreError> {
    Ok(TenantSettings {
        shop: row.try_get("shop")?,
        cron_schedule: row.try_get("cron_schedule")?,
        cron_enabled: row.try_get("cron_enabled")?,
        auto_apply: row.try_get("auto_apply")?,
        max_products_per_run: row.try_get::<i64, _>("max_products_per_run")?.clamp(1, i64::from(u32::MAX)) as u32,
        min_confidence: row.try_get("min_confidence")?,
    }
    .normalized())
}
