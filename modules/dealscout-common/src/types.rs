use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One marketplace listing as yielded by a fetch-and-parse pass.
///
/// `published_at` is the source's own publication timestamp when the page
/// exposes one; it feeds the per-source watermark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Canonical URL of the listing detail page.
    pub url: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// Stable identity key for a listing, used by the dedup ledger and the
/// listing store's unique constraint. Hashes the fields that survive
/// re-scrapes; image URLs and timestamps churn, so they stay out.
pub fn listing_key(listing: &Listing) -> String {
    let desc_prefix: String = listing
        .description
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(64)
        .collect();
    let basis = format!(
        "{}|{}|{}|{}",
        listing.title, listing.price, desc_prefix, listing.url
    );
    let digest = Sha256::digest(basis.as_bytes());
    hex::encode(digest)
}

/// Lifecycle of a single worker lane's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Lifecycle of a job group. Always derived from member job states plus
/// the group's cancellation flag, never assigned directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GroupStatus::Completed | GroupStatus::Failed | GroupStatus::Canceled
        )
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupStatus::Starting => "starting",
            GroupStatus::Running => "running",
            GroupStatus::Completed => "completed",
            GroupStatus::Failed => "failed",
            GroupStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// When a group counts as `failed` rather than `completed` with errors.
/// Explicit policy input on every group spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed only when every lane ended in `error` and nothing was inserted.
    #[default]
    AllLanesFailed,
    /// Failed as soon as any lane ends in `error`.
    AnyLaneFailed,
    /// Never escalate; lane errors leave the group `completed`.
    Never,
}

/// A persisted recurring scrape definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub start_urls: Vec<String>,
    /// Minutes between automatic firings. Must be > 0.
    pub cadence_minutes: u32,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub newest_first: bool,
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Newest publication timestamp already ingested for this schedule.
    /// Monotonically non-decreasing.
    #[serde(default)]
    pub watermark: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Watermark scope key under which this schedule's lanes remember records.
    pub fn watermark_scope(&self) -> String {
        format!("schedule:{}", self.id)
    }
}

/// Operator input for creating a schedule. Everything optional takes the
/// engine's defaults at fire time.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDraft {
    pub name: String,
    pub start_urls: Vec<String>,
    pub cadence_minutes: u32,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub newest_first: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleDraft {
    pub fn into_schedule(self, now: DateTime<Utc>) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: self.name,
            start_urls: self.start_urls,
            cadence_minutes: self.cadence_minutes,
            max_pages: self.max_pages,
            worker_count: self.worker_count,
            concurrency: self.concurrency,
            newest_first: self.newest_first,
            enabled: self.enabled,
            last_run_at: None,
            watermark: None,
            created_at: now,
        }
    }
}
