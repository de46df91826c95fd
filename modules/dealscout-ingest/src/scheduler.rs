//! Schedule manager — persisted recurring scrape definitions and the loop
//! that fires them through the worker pool.
//!
//! At most one job group is ever in flight per schedule: a due schedule
//! whose previous run is still going is skipped, and a manual run-now
//! against it gets `ScheduleBusy` instead of a second group. Disabling a
//! schedule only suppresses future automatic firings; deleting one detaches
//! the record and lets the in-flight group finish as an orphan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use dealscout_common::{DealScoutError, Schedule, ScheduleDraft};

use crate::ledger::DedupLedger;
use crate::pool::{GroupSpec, WorkerPool};
use crate::tracker::GroupTracker;

// --- Schedule persistence ---

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Schedule>>;
    async fn get(&self, id: Uuid) -> Result<Option<Schedule>>;
    async fn insert(&self, schedule: &Schedule) -> Result<()>;
    async fn update(&self, schedule: &Schedule) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Store backed by process memory, for tests and database-less runs.
#[derive(Default)]
pub struct MemoryScheduleStore {
    rows: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn list(&self) -> Result<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self
            .rows
            .lock()
            .expect("schedule lock")
            .values()
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.rows.lock().expect("schedule lock").get(&id).cloned())
    }

    async fn insert(&self, schedule: &Schedule) -> Result<()> {
        self.rows
            .lock()
            .expect("schedule lock")
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> Result<()> {
        self.rows
            .lock()
            .expect("schedule lock")
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .expect("schedule lock")
            .remove(&id)
            .is_some())
    }
}

/// Durable schedule store on the `schedules` table.
pub struct PgScheduleStore {
    pool: PgPool,
}

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> Result<Schedule> {
        Ok(Schedule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            start_urls: row.try_get("start_urls")?,
            cadence_minutes: row.try_get::<i32, _>("cadence_minutes")? as u32,
            max_pages: row.try_get::<Option<i32>, _>("max_pages")?.map(|v| v as u32),
            worker_count: row
                .try_get::<Option<i32>, _>("worker_count")?
                .map(|v| v as usize),
            concurrency: row
                .try_get::<Option<i32>, _>("concurrency")?
                .map(|v| v as usize),
            newest_first: row.try_get("newest_first")?,
            enabled: row.try_get("enabled")?,
            last_run_at: row.try_get("last_run_at")?,
            watermark: row.try_get("watermark")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn list(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn insert(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules
               (id, name, start_urls, cadence_minutes, max_pages, worker_count,
                concurrency, newest_first, enabled, last_run_at, watermark, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.start_urls)
        .bind(schedule.cadence_minutes as i32)
        .bind(schedule.max_pages.map(|v| v as i32))
        .bind(schedule.worker_count.map(|v| v as i32))
        .bind(schedule.concurrency.map(|v| v as i32))
        .bind(schedule.newest_first)
        .bind(schedule.enabled)
        .bind(schedule.last_run_at)
        .bind(schedule.watermark)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET
               name = $2, start_urls = $3, cadence_minutes = $4, max_pages = $5,
               worker_count = $6, concurrency = $7, newest_first = $8,
               enabled = $9, last_run_at = $10, watermark = $11
             WHERE id = $1",
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.start_urls)
        .bind(schedule.cadence_minutes as i32)
        .bind(schedule.max_pages.map(|v| v as i32))
        .bind(schedule.worker_count.map(|v| v as i32))
        .bind(schedule.concurrency.map(|v| v as i32))
        .bind(schedule.newest_first)
        .bind(schedule.enabled)
        .bind(schedule.last_run_at)
        .bind(schedule.watermark)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

// --- Manager ---

/// Worker/concurrency defaults applied when a schedule carries no override.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerDefaults {
    pub worker_count: usize,
    pub concurrency: usize,
}

struct InFlight {
    group_id: Uuid,
    fired_at: DateTime<Utc>,
}

pub struct ScheduleManager {
    store: Arc<dyn ScheduleStore>,
    pool: Arc<WorkerPool>,
    tracker: Arc<GroupTracker>,
    ledger: Arc<dyn DedupLedger>,
    defaults: SchedulerDefaults,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    /// When each schedule last fired, successful or not. Keeps a failing
    /// schedule on its cadence instead of hot-looping every tick.
    last_attempt: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl ScheduleManager {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        pool: Arc<WorkerPool>,
        tracker: Arc<GroupTracker>,
        ledger: Arc<dyn DedupLedger>,
        defaults: SchedulerDefaults,
    ) -> Self {
        Self {
            store,
            pool,
            tracker,
            ledger,
            defaults,
            in_flight: Mutex::new(HashMap::new()),
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, draft: ScheduleDraft, now: DateTime<Utc>) -> Result<Schedule, DealScoutError> {
        if draft.cadence_minutes == 0 {
            return Err(DealScoutError::Validation(
                "cadence_minutes must be greater than zero".to_string(),
            ));
        }
        if draft.start_urls.is_empty() {
            return Err(DealScoutError::Validation(
                "start_urls must not be empty".to_string(),
            ));
        }
        let schedule = draft.into_schedule(now);
        self.store.insert(&schedule).await?;
        info!(schedule_id = %schedule.id, name = schedule.name.as_str(), "Schedule created");
        Ok(schedule)
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, DealScoutError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Schedule, DealScoutError> {
        self.store
            .get(id)
            .await?
            .ok_or(DealScoutError::ScheduleNotFound(id))
    }

    /// Toggle automatic firing. An in-flight run is left alone either way.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<Schedule, DealScoutError> {
        let mut schedule = self.get(id).await?;
        schedule.enabled = enabled;
        self.store.update(&schedule).await?;
        info!(schedule_id = %id, enabled, "Schedule toggled");
        Ok(schedule)
    }

    /// Delete a schedule. An in-flight group keeps running as an orphan,
    /// still observable through the tracker.
    pub async fn delete(&self, id: Uuid) -> Result<bool, DealScoutError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!(schedule_id = %id, "Schedule deleted");
        }
        Ok(removed)
    }

    /// Fire a schedule immediately, regardless of cadence or the enabled
    /// flag. Refused with `ScheduleBusy` while a group for it is in flight.
    pub async fn run_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Uuid, DealScoutError> {
        self.reap_finished().await;
        let schedule = self.get(id).await?;
        let group_id = self.fire(&schedule, now)?;
        info!(schedule_id = %id, group_id = %group_id, "Schedule fired manually");
        Ok(group_id)
    }

    /// One scheduler pass: settle finished runs, then fire whatever is due.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.reap_finished().await;

        let schedules = match self.store.list().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "Failed to list schedules");
                return;
            }
        };

        for schedule in schedules {
            if !schedule.enabled || !self.is_due(&schedule, now) {
                continue;
            }
            match self.fire(&schedule, now) {
                Ok(group_id) => {
                    info!(
                        schedule_id = %schedule.id,
                        name = schedule.name.as_str(),
                        group_id = %group_id,
                        "Schedule fired"
                    );
                }
                Err(DealScoutError::ScheduleBusy) => {
                    info!(
                        schedule_id = %schedule.id,
                        "Schedule due but previous run still in flight, skipping"
                    );
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Failed to fire schedule");
                }
            }
        }
    }

    /// Drive `tick` forever. Spawn this on the runtime next to the server.
    pub async fn run_loop(self: Arc<Self>, tick_secs: u64) {
        info!(tick_secs, "Schedule manager loop starting");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    fn is_due(&self, schedule: &Schedule, now: DateTime<Utc>) -> bool {
        let last_attempt = self
            .last_attempt
            .lock()
            .expect("attempt lock")
            .get(&schedule.id)
            .copied();
        let basis = match (schedule.last_run_at, last_attempt) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match basis {
            None => true,
            Some(t) => now - t >= Duration::minutes(i64::from(schedule.cadence_minutes)),
        }
    }

    /// Atomically claim the schedule's single in-flight slot and start a
    /// group for it.
    fn fire(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Uuid, DealScoutError> {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock");
        if in_flight.contains_key(&schedule.id) {
            return Err(DealScoutError::ScheduleBusy);
        }

        let spec = GroupSpec::builder()
            .start_urls(schedule.start_urls.clone())
            .worker_count(schedule.worker_count.unwrap_or(self.defaults.worker_count))
            .concurrency(schedule.concurrency.unwrap_or(self.defaults.concurrency))
            .max_pages(schedule.max_pages)
            .newest_first(schedule.newest_first)
            .stop_before(schedule.watermark)
            .watermark_scope(Some(schedule.watermark_scope()))
            .schedule_id(Some(schedule.id))
            .build();
        let group_id = self.pool.start(spec)?;

        in_flight.insert(
            schedule.id,
            InFlight {
                group_id,
                fired_at: now,
            },
        );
        self.last_attempt
            .lock()
            .expect("attempt lock")
            .insert(schedule.id, now);
        Ok(group_id)
    }

    /// Settle in-flight entries whose groups reached a terminal state:
    /// advance `last_run` and the watermark on completion, and detach
    /// orphaned groups whose schedule is gone.
    async fn reap_finished(&self) {
        let finished: Vec<(Uuid, InFlight)> = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock");
            let done_ids: Vec<Uuid> = in_flight
                .iter()
                .filter(|(_, entry)| {
                    self.tracker
                        .get(entry.group_id)
                        .map(|snap| snap.status.is_terminal())
                        .unwrap_or(true)
                })
                .map(|(id, _)| *id)
                .collect();
            done_ids
                .into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (schedule_id, entry) in finished {
            let status = match self.tracker.get(entry.group_id) {
                Some(snap) => snap.status,
                None => continue,
            };

            let mut schedule = match self.store.get(schedule_id).await {
                Ok(Some(schedule)) => schedule,
                Ok(None) => {
                    info!(
                        schedule_id = %schedule_id,
                        group_id = %entry.group_id,
                        "Schedule deleted mid-run; group finished as orphan"
                    );
                    self.last_attempt
                        .lock()
                        .expect("attempt lock")
                        .remove(&schedule_id);
                    continue;
                }
                Err(e) => {
                    warn!(schedule_id = %schedule_id, error = %e, "Failed to load schedule for settling");
                    continue;
                }
            };

            if status == dealscout_common::GroupStatus::Completed {
                schedule.last_run_at = Some(entry.fired_at);
                match self.ledger.current_watermark(&schedule.watermark_scope()).await {
                    Ok(Some(mark)) => {
                        // Strictly newer timestamps only; never regress.
                        if schedule.watermark.map_or(true, |current| mark > current) {
                            schedule.watermark = Some(mark);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(schedule_id = %schedule_id, error = %e, "Watermark lookup failed");
                    }
                }
                if let Err(e) = self.store.update(&schedule).await {
                    warn!(schedule_id = %schedule_id, error = %e, "Failed to persist schedule after run");
                } else {
                    info!(
                        schedule_id = %schedule_id,
                        group_id = %entry.group_id,
                        watermark = ?schedule.watermark,
                        "Schedule run settled"
                    );
                }
            } else {
                info!(
                    schedule_id = %schedule_id,
                    group_id = %entry.group_id,
                    status = %status,
                    "Schedule run ended without completing"
                );
            }
        }
    }
}
