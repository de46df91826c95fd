//! Idempotent Postgres schema for the durable pieces: ingested-record
//! identity, listings, and schedules. Run once at startup.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS listings (
           id BIGSERIAL PRIMARY KEY,
           key TEXT UNIQUE NOT NULL,
           title TEXT NOT NULL,
           price DOUBLE PRECISION NOT NULL,
           description TEXT,
           location TEXT,
           url TEXT NOT NULL,
           image_urls TEXT[] NOT NULL DEFAULT '{}',
           published_at TIMESTAMPTZ,
           first_seen_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS listings_price_idx ON listings(price)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS listings_published_idx ON listings(published_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ingested_records (
           key TEXT PRIMARY KEY,
           scope TEXT NOT NULL,
           published_at TIMESTAMPTZ,
           remembered_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ingested_records_scope_idx
           ON ingested_records(scope, published_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schedules (
           id UUID PRIMARY KEY,
           name TEXT NOT NULL,
           start_urls TEXT[] NOT NULL,
           cadence_minutes INTEGER NOT NULL CHECK (cadence_minutes > 0),
           max_pages INTEGER,
           worker_count INTEGER,
           concurrency INTEGER,
           newest_first BOOLEAN NOT NULL DEFAULT FALSE,
           enabled BOOLEAN NOT NULL DEFAULT TRUE,
           last_run_at TIMESTAMPTZ,
           watermark TIMESTAMPTZ,
           created_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    info!("Database schema ready");
    Ok(())
}
