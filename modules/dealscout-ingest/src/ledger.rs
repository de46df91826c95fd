//! Dedup ledger — identity of every ingested record plus per-scope watermarks.
//!
//! The ledger is the sole correctness mechanism against two lanes racing on
//! the same record key: `remember` is atomic and returns true exactly once
//! per key, so only the winning lane goes on to write storage.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Whether this record key has already been ingested, in this run or any
    /// earlier one.
    async fn seen(&self, key: &str) -> Result<bool>;

    /// Atomically claim a record key. Returns true for exactly one caller per
    /// key; everyone else gets false and must treat the record as a duplicate.
    /// A claimed publication timestamp also feeds the scope's watermark.
    async fn remember(
        &self,
        key: &str,
        published_at: Option<DateTime<Utc>>,
        scope: &str,
    ) -> Result<bool>;

    /// Newest publication timestamp remembered under this scope, if any.
    async fn current_watermark(&self, scope: &str) -> Result<Option<DateTime<Utc>>>;
}

// --- In-memory ledger ---

/// Ledger backed by process memory. Used in tests and when running without
/// a database; identity does not survive restarts.
#[derive(Default)]
pub struct MemoryLedger {
    keys: Mutex<HashSet<String>>,
    watermarks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupLedger for MemoryLedger {
    async fn seen(&self, key: &str) -> Result<bool> {
        Ok(self.keys.lock().expect("ledger lock").contains(key))
    }

    async fn remember(
        &self,
        key: &str,
        published_at: Option<DateTime<Utc>>,
        scope: &str,
    ) -> Result<bool> {
        let first = self.keys.lock().expect("ledger lock").insert(key.to_string());
        if first {
            if let Some(ts) = published_at {
                let mut marks = self.watermarks.lock().expect("watermark lock");
                // Strict greater-than: ties never advance the watermark.
                match marks.get(scope) {
                    Some(current) if ts <= *current => {}
                    _ => {
                        marks.insert(scope.to_string(), ts);
                    }
                }
            }
        }
        Ok(first)
    }

    async fn current_watermark(&self, scope: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .watermarks
            .lock()
            .expect("watermark lock")
            .get(scope)
            .copied())
    }
}

// --- Postgres ledger ---

/// Durable ledger on the `ingested_records` table. The primary-key insert
/// makes `remember` atomic across lanes and across process restarts.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupLedger for PgLedger {
    async fn seen(&self, key: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM ingested_records WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn remember(
        &self,
        key: &str,
        published_at: Option<DateTime<Utc>>,
        scope: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO ingested_records (key, scope, published_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(scope)
        .bind(published_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn current_watermark(&self, scope: &str) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MAX(published_at) FROM ingested_records WHERE scope = $1",
        )
        .bind(scope)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
