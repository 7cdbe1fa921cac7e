//! Response Cache (C2): append-only fetch history, used both as an
//! audit trail and as the idempotent-cache lookup for fresh GETs.
//!
//! Grounded on `request_history_model.py`'s `RequestHistoryModel`,
//! `get_hashed_url`, and `get_request_history` (status_code == 200,
//! browser_type match, `created_at > now - 1 day`). Persistence itself
//! is new: the original uses SQLModel over whatever `database_url`
//! points at; this workspace is fully tokio-async, so `sqlx`'s sqlite
//! driver is the natural fit (cross-grounded against other pack repos'
//! `sqlx`/`rusqlite` usage, see DESIGN.md).

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fetchgate_core::{Engine, Error, HistoryRecord, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Cache freshness window per §4.2: a prior 200 response is reusable
/// if it was recorded within the last 24 hours.
pub const CACHE_FRESHNESS_WINDOW_HOURS: i64 = 24;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn find_fresh(&self, url_hash: &str, engine: Engine) -> Result<Option<HistoryRecord>>;
    async fn insert(&self, record: &HistoryRecord) -> Result<i64>;
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// `database_url` follows the original's `service_database_url` env
    /// var; `sqlite::memory:` and `sqlite:///path/to/file.db` both work.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::NotConfigured(format!("invalid database_url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(|e| Error::Cache(format!("failed to connect history store: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                url_hash TEXT NOT NULL,
                engine TEXT NOT NULL,
                status_code INTEGER NOT NULL DEFAULT 0,
                response_time_s REAL NOT NULL DEFAULT 0,
                response_size INTEGER NOT NULL DEFAULT 0,
                response_headers_json TEXT NOT NULL DEFAULT '',
                response_body TEXT NOT NULL DEFAULT '',
                request_headers_json TEXT NOT NULL DEFAULT '',
                request_body_json TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Cache(format!("migration failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_history_lookup \
             ON request_history (url_hash, engine, status_code, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Cache(format!("index creation failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn find_fresh(&self, url_hash: &str, engine: Engine) -> Result<Option<HistoryRecord>> {
        let cutoff = Utc::now() - ChronoDuration::hours(CACHE_FRESHNESS_WINDOW_HOURS);
        let row = sqlx::query(
            r#"
            SELECT id, url, url_hash, engine, status_code, response_time_s, response_size,
                   response_headers_json, response_body, request_headers_json,
                   request_body_json, created_at, updated_at
            FROM request_history
            WHERE url_hash = ?1 AND engine = ?2 AND status_code = 200 AND created_at > ?3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(url_hash)
        .bind(engine.as_str())
        .bind(cutoff.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Cache(format!("find_fresh query failed: {e}")))?;

        row.map(row_to_record).transpose()
    }

    async fn insert(&self, record: &HistoryRecord) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO request_history
                (url, url_hash, engine, status_code, response_time_s, response_size,
                 response_headers_json, response_body, request_headers_json,
                 request_body_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&record.url)
        .bind(&record.url_hash)
        .bind(record.engine.as_str())
        .bind(record.status_code)
        .bind(record.response_time_s)
        .bind(record.response_size)
        .bind(&record.response_headers_json)
        .bind(&record.response_body)
        .bind(&record.request_headers_json)
        .bind(&record.request_body_json)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Cache(format!("insert failed: {e}")))?;

        Ok(res.last_insert_rowid())
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<HistoryRecord> {
    let engine_str: String = row.try_get("engine").map_err(to_cache_err)?;
    let engine = Engine::from_str(&engine_str)
        .map_err(|e| Error::Cache(format!("stored engine column unparsable: {e}")))?;
    let created_at: String = row.try_get("created_at").map_err(to_cache_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(to_cache_err)?;

    Ok(HistoryRecord {
        id: row.try_get::<i64, _>("id").map_err(to_cache_err).map(Some)?,
        url: row.try_get("url").map_err(to_cache_err)?,
        url_hash: row.try_get("url_hash").map_err(to_cache_err)?,
        engine,
        status_code: row.try_get("status_code").map_err(to_cache_err)?,
        response_time_s: row.try_get("response_time_s").map_err(to_cache_err)?,
        response_size: row.try_get("response_size").map_err(to_cache_err)?,
        response_headers_json: row.try_get("response_headers_json").map_err(to_cache_err)?,
        response_body: row.try_get("response_body").map_err(to_cache_err)?,
        request_headers_json: row.try_get("request_headers_json").map_err(to_cache_err)?,
        request_body_json: row.try_get("request_body_json").map_err(to_cache_err)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Cache(format!("bad created_at: {e}")))?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Cache(format!("bad updated_at: {e}")))?
            .with_timezone(&Utc),
    })
}

fn to_cache_err(e: sqlx::Error) -> Error {
    Error::Cache(format!("row decode failed: {e}"))
}
