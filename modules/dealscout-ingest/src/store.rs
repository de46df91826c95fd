//! Listing store boundary — the relational store consumed as
//! `upsert(listing) → inserted | duplicate`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use dealscout_common::{listing_key, Listing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome>;
}

// --- In-memory store ---

/// Store backed by process memory. First write per key wins.
#[derive(Default)]
pub struct MemoryListingStore {
    rows: Mutex<HashMap<String, Listing>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.lock().expect("store lock").contains_key(key)
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome> {
        let key = listing_key(listing);
        let mut rows = self.rows.lock().expect("store lock");
        if rows.contains_key(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }
        rows.insert(key, listing.clone());
        Ok(UpsertOutcome::Inserted)
    }
}

// --- Postgres store ---

/// Durable listing store on the `listings` table. The unique key column
/// turns racing inserts into duplicates instead of errors.
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome> {
        let key = listing_key(listing);
        let result = sqlx::query(
            "INSERT INTO listings (key, title, price, description, location, url, image_urls, published_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(&key)
        .bind(&listing.title)
        .bind(listing.price)
        .bind(&listing.description)
        .bind(&listing.location)
        .bind(&listing.url)
        .bind(&listing.image_urls)
        .bind(listing.published_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Duplicate)
        }
    }
}
