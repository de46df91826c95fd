pub mod extract;
pub mod fetch;
pub mod ledger;
pub mod pool;
pub mod schema;
pub mod scheduler;
pub mod store;
pub mod tracker;

pub use fetch::{FetchedPage, HttpPageFetcher, PageFetcher};
pub use ledger::{DedupLedger, MemoryLedger, PgLedger};
pub use pool::{GroupSpec, WorkerPool};
pub use scheduler::{MemoryScheduleStore, PgScheduleStore, ScheduleManager, ScheduleStore};
pub use store::{ListingStore, MemoryListingStore, PgListingStore, UpsertOutcome};
pub use tracker::{GroupSnapshot, GroupTracker, JobSummary};
