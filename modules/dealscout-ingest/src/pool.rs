//! Worker pool — a bounded set of concurrent fetch-parse-ingest lanes
//! answering one scrape request.
//!
//! `worker_count` controls how many lanes are spawned; `concurrency` bounds
//! in-flight fetches across the whole group through a semaphore shared by
//! every lane. Lanes pull URLs from a shared frontier, consult the dedup
//! ledger before writing storage, and observe the group's cancellation flag
//! at the top of each fetch iteration and before every store write. A
//! canceled lane reports its partial counts, not an error.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use dealscout_common::{listing_key, DealScoutError, FailurePolicy, JobStatus};

use crate::fetch::{newest_first_url, FetchedPage, PageFetcher};
use crate::ledger::DedupLedger;
use crate::store::{ListingStore, UpsertOutcome};
use crate::tracker::GroupTracker;

/// How long an idle lane waits before re-checking a momentarily empty
/// frontier while sibling fetches are still in flight.
const FRONTIER_POLL: Duration = Duration::from_millis(25);

/// Everything that defines one scrape run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct GroupSpec {
    pub start_urls: Vec<String>,
    #[builder(default = 1)]
    pub worker_count: usize,
    #[builder(default = 2)]
    pub concurrency: usize,
    #[builder(default)]
    pub max_pages: Option<u32>,
    #[builder(default)]
    pub newest_first: bool,
    /// Watermark from the owning schedule; newest-first lanes stop paging
    /// once a whole page is at or below it. Records on revisited older
    /// pages still short-circuit through the ledger.
    #[builder(default)]
    pub stop_before: Option<DateTime<Utc>>,
    #[builder(default)]
    pub watermark_scope: Option<String>,
    #[builder(default)]
    pub failure_policy: FailurePolicy,
    #[builder(default)]
    pub schedule_id: Option<Uuid>,
}

impl GroupSpec {
    /// Scope under which lanes remember records. Schedules pass their own;
    /// manual runs fall back to the first start URL's host.
    fn effective_scope(&self) -> String {
        if let Some(scope) = &self.watermark_scope {
            return scope.clone();
        }
        self.start_urls
            .first()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "default".to_string())
    }
}

// --- Shared URL frontier ---

struct FrontierInner {
    queue: VecDeque<String>,
    enqueued: HashSet<String>,
    /// Remaining page-fetch budget; i64::MAX when uncapped.
    pages_left: i64,
    /// URLs handed out and not yet fully processed. While nonzero, an empty
    /// queue means "wait", not "drained" — a sibling may still add follow-ups.
    active: usize,
}

enum FrontierNext {
    Url(String),
    Wait,
    Drained,
}

struct Frontier {
    inner: Mutex<FrontierInner>,
    newest_first: bool,
}

impl Frontier {
    fn new(start_urls: Vec<String>, max_pages: Option<u32>, newest_first: bool) -> Self {
        let mut enqueued = HashSet::new();
        let mut queue = VecDeque::new();
        for url in start_urls {
            if enqueued.insert(url.clone()) {
                queue.push_back(url);
            }
        }
        Self {
            inner: Mutex::new(FrontierInner {
                queue,
                enqueued,
                pages_left: max_pages.map(i64::from).unwrap_or(i64::MAX),
                active: 0,
            }),
            newest_first,
        }
    }

    fn next(&self) -> FrontierNext {
        let mut inner = self.inner.lock().expect("frontier lock");
        if inner.pages_left <= 0 {
            return FrontierNext::Drained;
        }
        match inner.queue.pop_front() {
            Some(url) => {
                inner.pages_left -= 1;
                inner.active += 1;
                FrontierNext::Url(url)
            }
            None if inner.active > 0 => FrontierNext::Wait,
            None => FrontierNext::Drained,
        }
    }

    /// Add follow-up URLs. Newest-first groups push them to the front so the
    /// frontier stays ordered by inferred recency; otherwise breadth-first.
    fn extend(&self, urls: &[String]) {
        let mut inner = self.inner.lock().expect("frontier lock");
        if self.newest_first {
            for url in urls.iter().rev() {
                if inner.enqueued.insert(url.clone()) {
                    inner.queue.push_front(url.clone());
                }
            }
        } else {
            for url in urls {
                if inner.enqueued.insert(url.clone()) {
                    inner.queue.push_back(url.clone());
                }
            }
        }
    }

    /// Must be called exactly once per URL handed out by `next`, after its
    /// follow-ups (if any) have been enqueued.
    fn complete_one(&self) {
        let mut inner = self.inner.lock().expect("frontier lock");
        inner.active = inner.active.saturating_sub(1);
    }
}

// --- Worker pool ---

pub struct WorkerPool {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ListingStore>,
    ledger: Arc<dyn DedupLedger>,
    tracker: Arc<GroupTracker>,
    /// Consecutive fetch failures before a lane reports `error` and stops.
    max_consecutive_failures: u32,
}

impl WorkerPool {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ListingStore>,
        ledger: Arc<dyn DedupLedger>,
        tracker: Arc<GroupTracker>,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            fetcher,
            store,
            ledger,
            tracker,
            max_consecutive_failures,
        }
    }

    /// Create a job group and spawn its lanes. Returns the group id
    /// immediately; progress is observed through the tracker.
    pub fn start(&self, spec: GroupSpec) -> Result<Uuid, DealScoutError> {
        if spec.start_urls.is_empty() {
            return Err(DealScoutError::Validation(
                "start_urls must not be empty".to_string(),
            ));
        }
        if spec.worker_count == 0 {
            return Err(DealScoutError::Validation(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if spec.concurrency == 0 {
            return Err(DealScoutError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let start_urls: Vec<String> = if spec.newest_first {
            spec.start_urls.iter().map(|u| newest_first_url(u)).collect()
        } else {
            spec.start_urls.clone()
        };

        let (group_id, job_ids) =
            self.tracker
                .create(start_urls.clone(), spec.worker_count, spec.failure_policy, spec.schedule_id);
        let cancel = self
            .tracker
            .cancel_flag(group_id)
            .expect("group registered above");

        let frontier = Arc::new(Frontier::new(start_urls, spec.max_pages, spec.newest_first));
        let semaphore = Arc::new(Semaphore::new(spec.concurrency));
        let scope = spec.effective_scope();

        info!(
            group_id = %group_id,
            workers = spec.worker_count,
            concurrency = spec.concurrency,
            newest_first = spec.newest_first,
            "Starting scrape group"
        );

        for (lane, job_id) in job_ids.into_iter().enumerate() {
            let lane = Lane {
                group_id,
                job_id,
                lane,
                fetcher: self.fetcher.clone(),
                store: self.store.clone(),
                ledger: self.ledger.clone(),
                tracker: self.tracker.clone(),
                frontier: frontier.clone(),
                semaphore: semaphore.clone(),
                cancel: cancel.clone(),
                scope: scope.clone(),
                stop_before: spec.stop_before,
                newest_first: spec.newest_first,
                max_consecutive_failures: self.max_consecutive_failures,
            };
            tokio::spawn(lane.run());
        }

        Ok(group_id)
    }
}

// --- Lane ---

struct Lane {
    group_id: Uuid,
    job_id: Uuid,
    lane: usize,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ListingStore>,
    ledger: Arc<dyn DedupLedger>,
    tracker: Arc<GroupTracker>,
    frontier: Arc<Frontier>,
    semaphore: Arc<Semaphore>,
    cancel: Arc<AtomicBool>,
    scope: String,
    stop_before: Option<DateTime<Utc>>,
    newest_first: bool,
    max_consecutive_failures: u32,
}

/// What one page's ingest produced.
#[derive(Default)]
struct PageCounts {
    inserted: u64,
    errors: u64,
    duplicates: u64,
    /// Cancellation was observed mid-page; the lane must wind down.
    canceled: bool,
    /// Every dated record sat at or below the watermark — stop paging.
    watermark_reached: bool,
}

impl Lane {
    async fn run(self) {
        self.tracker.mark_job_running(self.group_id, self.job_id);

        let mut consecutive_failures = 0u32;
        let mut lane_failed = false;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }

            let url = match self.frontier.next() {
                FrontierNext::Url(url) => url,
                FrontierNext::Wait => {
                    tokio::time::sleep(FRONTIER_POLL).await;
                    continue;
                }
                FrontierNext::Drained => break,
            };

            // Group-wide admission gate, shared across all lanes.
            let permit = match self.semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    self.frontier.complete_one();
                    break;
                }
            };
            // The wait for a permit can be long; re-check before fetching.
            if self.cancel.load(Ordering::Relaxed) {
                self.frontier.complete_one();
                break;
            }

            let fetched = self.fetcher.fetch(&url).await;
            drop(permit);

            match fetched {
                Ok(page) => {
                    consecutive_failures = 0;
                    let counts = self.ingest_page(&page).await;
                    if !counts.canceled && !counts.watermark_reached {
                        self.frontier.extend(&page.next_urls);
                    }
                    self.frontier.complete_one();
                    self.tracker.report(
                        self.group_id,
                        self.job_id,
                        counts.inserted,
                        counts.errors,
                        counts.duplicates,
                        None,
                    );
                    if counts.canceled {
                        break;
                    }
                }
                Err(e) => {
                    self.frontier.complete_one();
                    consecutive_failures += 1;
                    warn!(
                        url = url.as_str(),
                        lane = self.lane,
                        attempt_streak = consecutive_failures,
                        error = %e,
                        "Fetch failed"
                    );
                    self.tracker
                        .report(self.group_id, self.job_id, 0, 1, 0, None);
                    if consecutive_failures >= self.max_consecutive_failures {
                        error!(
                            lane = self.lane,
                            failures = consecutive_failures,
                            "Lane exceeded consecutive failure threshold"
                        );
                        lane_failed = true;
                        break;
                    }
                }
            }
        }

        let terminal = if lane_failed {
            JobStatus::Error
        } else {
            JobStatus::Done
        };
        self.tracker
            .report(self.group_id, self.job_id, 0, 0, 0, Some(terminal));
    }

    async fn ingest_page(&self, page: &FetchedPage) -> PageCounts {
        let mut counts = PageCounts::default();
        let mut dated_records = 0usize;
        let mut stale_records = 0usize;

        for listing in &page.listings {
            // Cancellation is observed before any store write.
            if self.cancel.load(Ordering::Relaxed) {
                counts.canceled = true;
                return counts;
            }

            if let Some(published) = listing.published_at {
                dated_records += 1;
                if self.stop_before.is_some_and(|wm| published <= wm) {
                    stale_records += 1;
                }
            }

            let key = listing_key(listing);
            match self.ledger.seen(&key).await {
                Ok(true) => {
                    counts.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(lane = self.lane, error = %e, "Ledger lookup failed");
                    counts.errors += 1;
                    continue;
                }
            }

            match self
                .ledger
                .remember(&key, listing.published_at, &self.scope)
                .await
            {
                Ok(true) => match self.store.upsert(listing).await {
                    Ok(UpsertOutcome::Inserted) => counts.inserted += 1,
                    Ok(UpsertOutcome::Duplicate) => counts.duplicates += 1,
                    Err(e) => {
                        warn!(lane = self.lane, error = %e, "Listing upsert failed");
                        counts.errors += 1;
                    }
                },
                // Lost the race to a sibling lane — a duplicate, not an error.
                Ok(false) => counts.duplicates += 1,
                Err(e) => {
                    warn!(lane = self.lane, error = %e, "Ledger write failed");
                    counts.errors += 1;
                }
            }
        }

        counts.watermark_reached = self.newest_first
            && dated_records > 0
            && stale_records == dated_records
            && !page.listings.is_empty();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use dealscout_common::{GroupStatus, Listing};

    use crate::ledger::MemoryLedger;
    use crate::store::MemoryListingStore;
    use crate::tracker::GroupSnapshot;

    fn listing(title: &str, url: &str) -> Listing {
        Listing {
            title: title.to_string(),
            price: 100.0,
            description: None,
            location: None,
            url: url.to_string(),
            image_urls: vec![],
            published_at: None,
        }
    }

    fn dated(title: &str, url: &str, published_at: DateTime<Utc>) -> Listing {
        Listing {
            published_at: Some(published_at),
            ..listing(title, url)
        }
    }

    /// Fetcher that serves a fixed page per URL and errors on anything else.
    struct ScriptedFetcher {
        pages: HashMap<String, FetchedPage>,
        fetches: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(pages: HashMap<String, FetchedPage>) -> Self {
            Self {
                pages,
                fetches: AtomicU32::new(0),
            }
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no page scripted for {url}"))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Fetcher whose every page links to the next one, forever.
    struct EndlessFetcher {
        delay: Duration,
        fetches: AtomicU32,
    }

    impl EndlessFetcher {
        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PageFetcher for EndlessFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage> {
            let n = self.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.delay).await;
            Ok(FetchedPage {
                listings: vec![listing(
                    &format!("item-{n}"),
                    &format!("https://endless.example.com/item/{n}"),
                )],
                next_urls: vec![format!("{url}x")],
            })
        }

        fn name(&self) -> &str {
            "endless"
        }
    }

    struct Harness {
        pool: WorkerPool,
        tracker: Arc<GroupTracker>,
        store: Arc<MemoryListingStore>,
        ledger: Arc<MemoryLedger>,
    }

    fn harness(fetcher: Arc<dyn PageFetcher>, max_consecutive_failures: u32) -> Harness {
        let tracker = Arc::new(GroupTracker::new());
        let store = Arc::new(MemoryListingStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let pool = WorkerPool::new(
            fetcher,
            store.clone(),
            ledger.clone(),
            tracker.clone(),
            max_consecutive_failures,
        );
        Harness {
            pool,
            tracker,
            store,
            ledger,
        }
    }

    async fn wait_all_terminal(tracker: &GroupTracker, group_id: Uuid) -> GroupSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(snap) = tracker.get(group_id) {
                    if snap.jobs.iter().all(|j| j.status.is_terminal()) {
                        return snap;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("group did not reach a terminal state in time")
    }

    #[tokio::test]
    async fn two_lanes_shared_ledger_end_to_end() {
        // Two start URLs, three records each, one record repeated across
        // them: 5 inserts, 1 duplicate, completed.
        let shared = listing("shared", "https://shop.example.com/l/shared");
        let mut pages = HashMap::new();
        pages.insert(
            "https://shop.example.com/a".to_string(),
            FetchedPage {
                listings: vec![
                    listing("a1", "https://shop.example.com/l/a1"),
                    listing("a2", "https://shop.example.com/l/a2"),
                    shared.clone(),
                ],
                next_urls: vec![],
            },
        );
        pages.insert(
            "https://shop.example.com/b".to_string(),
            FetchedPage {
                listings: vec![
                    listing("b1", "https://shop.example.com/l/b1"),
                    listing("b2", "https://shop.example.com/l/b2"),
                    shared.clone(),
                ],
                next_urls: vec![],
            },
        );

        let h = harness(Arc::new(ScriptedFetcher::new(pages)), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec![
                        "https://shop.example.com/a".to_string(),
                        "https://shop.example.com/b".to_string(),
                    ])
                    .worker_count(2)
                    .concurrency(1)
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.status, GroupStatus::Completed);
        assert_eq!(snap.inserted, 5);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.errors, 0);
        assert_eq!(h.store.len(), 5);
        assert!(snap.jobs.iter().all(|j| j.status == JobStatus::Done));
    }

    #[tokio::test]
    async fn follow_up_urls_are_crawled() {
        let mut pages = HashMap::new();
        pages.insert(
            "https://shop.example.com/p1".to_string(),
            FetchedPage {
                listings: vec![listing("one", "https://shop.example.com/l/1")],
                next_urls: vec!["https://shop.example.com/p2".to_string()],
            },
        );
        pages.insert(
            "https://shop.example.com/p2".to_string(),
            FetchedPage {
                listings: vec![listing("two", "https://shop.example.com/l/2")],
                next_urls: vec![],
            },
        );

        let h = harness(Arc::new(ScriptedFetcher::new(pages)), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://shop.example.com/p1".to_string()])
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.status, GroupStatus::Completed);
        assert_eq!(snap.inserted, 2);
    }

    #[tokio::test]
    async fn page_cap_bounds_the_crawl() {
        let fetcher = Arc::new(EndlessFetcher {
            delay: Duration::from_millis(1),
            fetches: AtomicU32::new(0),
        });
        let h = harness(fetcher.clone(), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://endless.example.com/p".to_string()])
                    .max_pages(Some(4))
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.status, GroupStatus::Completed);
        assert_eq!(fetcher.fetch_count(), 4);
        assert_eq!(snap.inserted, 4);
    }

    #[tokio::test]
    async fn stop_drives_running_group_to_canceled() {
        let fetcher = Arc::new(EndlessFetcher {
            delay: Duration::from_millis(10),
            fetches: AtomicU32::new(0),
        });
        let h = harness(fetcher, 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://endless.example.com/p".to_string()])
                    .worker_count(2)
                    .concurrency(2)
                    .build(),
            )
            .unwrap();

        // Let it make some progress first.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.tracker.get(group_id).unwrap().inserted > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("group never made progress");

        h.tracker.stop(group_id).unwrap();
        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.status, GroupStatus::Canceled);
        // Partial counts preserved, lanes report done rather than error.
        assert!(snap.inserted > 0);
        assert!(snap.jobs.iter().all(|j| j.status == JobStatus::Done));

        // Terminal means terminal: counts and status are frozen.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = h.tracker.get(group_id).unwrap();
        assert_eq!(later.status, GroupStatus::Canceled);
        assert_eq!(later.inserted, snap.inserted);
    }

    #[tokio::test]
    async fn consecutive_failures_end_the_lane() {
        let h = harness(Arc::new(ScriptedFetcher::new(HashMap::new())), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(
                        (0..6)
                            .map(|i| format!("https://down.example.com/{i}"))
                            .collect::<Vec<_>>(),
                    )
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        // Third straight failure stops the lane; all lanes errored with zero
        // inserts, so the group is failed.
        assert_eq!(snap.errors, 3);
        assert_eq!(snap.inserted, 0);
        assert_eq!(snap.status, GroupStatus::Failed);
        assert!(snap.jobs.iter().all(|j| j.status == JobStatus::Error));
    }

    #[tokio::test]
    async fn failing_lane_does_not_abort_siblings() {
        let mut pages = HashMap::new();
        for i in 0..3 {
            pages.insert(
                format!("https://shop.example.com/ok/{i}"),
                FetchedPage {
                    listings: vec![listing(
                        &format!("ok-{i}"),
                        &format!("https://shop.example.com/l/ok-{i}"),
                    )],
                    next_urls: vec![],
                },
            );
        }
        // One URL with no scripted page → fetch error; threshold 1 makes the
        // lane that draws it terminal immediately.
        let h = harness(Arc::new(ScriptedFetcher::new(pages)), 1);
        let mut urls = vec!["https://shop.example.com/broken".to_string()];
        urls.extend((0..3).map(|i| format!("https://shop.example.com/ok/{i}")));

        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(urls)
                    .worker_count(2)
                    .concurrency(2)
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.inserted, 3, "good URLs all ingested");
        assert_eq!(
            snap.jobs
                .iter()
                .filter(|j| j.status == JobStatus::Error)
                .count(),
            1,
            "exactly the lane that drew the broken URL errors"
        );
        // One lane inserted something, so the default policy completes.
        assert_eq!(snap.status, GroupStatus::Completed);
    }

    #[tokio::test]
    async fn newest_first_rewrites_start_urls() {
        let mut pages = HashMap::new();
        pages.insert(
            "https://shop.example.com/search?q=omega&sort=PUBLISHED_DESC".to_string(),
            FetchedPage {
                listings: vec![listing("one", "https://shop.example.com/l/1")],
                next_urls: vec![],
            },
        );
        let h = harness(Arc::new(ScriptedFetcher::new(pages)), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://shop.example.com/search?q=omega".to_string()])
                    .newest_first(true)
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(snap.status, GroupStatus::Completed);
        assert_eq!(snap.inserted, 1);
    }

    #[tokio::test]
    async fn watermark_stops_pagination_but_not_ingest() {
        let watermark = Utc::now();
        let stale = watermark - ChronoDuration::hours(1);
        let fetcher = Arc::new(ScriptedFetcher::new(HashMap::from([(
            "https://shop.example.com/p1?sort=PUBLISHED_DESC".to_string(),
            FetchedPage {
                listings: vec![
                    dated("old-1", "https://shop.example.com/l/o1", stale),
                    dated("old-2", "https://shop.example.com/l/o2", stale),
                ],
                next_urls: vec!["https://shop.example.com/p2".to_string()],
            },
        )])));
        let h = harness(fetcher.clone(), 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://shop.example.com/p1".to_string()])
                    .newest_first(true)
                    .stop_before(Some(watermark))
                    .build(),
            )
            .unwrap();

        let snap = wait_all_terminal(&h.tracker, group_id).await;
        // The stale page itself is still ingested through the ledger…
        assert_eq!(snap.inserted, 2);
        // …but its next page is never fetched.
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(snap.status, GroupStatus::Completed);
    }

    #[tokio::test]
    async fn watermark_scope_feeds_ledger() {
        let ts = Utc::now();
        let fetcher = Arc::new(ScriptedFetcher::new(HashMap::from([(
            "https://shop.example.com/p1".to_string(),
            FetchedPage {
                listings: vec![dated("one", "https://shop.example.com/l/1", ts)],
                next_urls: vec![],
            },
        )])));
        let h = harness(fetcher, 3);
        let group_id = h
            .pool
            .start(
                GroupSpec::builder()
                    .start_urls(vec!["https://shop.example.com/p1".to_string()])
                    .watermark_scope(Some("schedule:test".to_string()))
                    .build(),
            )
            .unwrap();

        wait_all_terminal(&h.tracker, group_id).await;
        assert_eq!(
            h.ledger.current_watermark("schedule:test").await.unwrap(),
            Some(ts)
        );
    }

    #[tokio::test]
    async fn invalid_specs_are_rejected() {
        let h = harness(Arc::new(ScriptedFetcher::new(HashMap::new())), 3);
        assert!(matches!(
            h.pool.start(GroupSpec::builder().start_urls(vec![]).build()),
            Err(DealScoutError::Validation(_))
        ));
        assert!(matches!(
            h.pool.start(
                GroupSpec::builder()
                    .start_urls(vec!["https://x.example.com".to_string()])
                    .worker_count(0)
                    .build()
            ),
            Err(DealScoutError::Validation(_))
        ));
        assert!(matches!(
            h.pool.start(
                GroupSpec::builder()
                    .start_urls(vec!["https://x.example.com".to_string()])
                    .concurrency(0)
                    .build()
            ),
            Err(DealScoutError::Validation(_))
        ));
    }
}
