//! Job group tracker — the unit of observability for one scrape request.
//!
//! A group is created atomically with all member jobs pre-registered as
//! `pending`. Lanes report count deltas as they go and a terminal state
//! exactly once; group status is always derived from member job states plus
//! the cancellation flag, never assigned directly. Snapshots are immutable
//! value copies taken under a brief lock, so the polling read path never
//! blocks on in-flight mutations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use dealscout_common::{DealScoutError, FailurePolicy, GroupStatus, JobStatus};

const EVENT_BUFFER: usize = 256;

struct JobState {
    id: Uuid,
    status: JobStatus,
    inserted: u64,
    errors: u64,
    duplicates: u64,
}

struct GroupState {
    id: Uuid,
    start_urls: Vec<String>,
    worker_count: usize,
    failure_policy: FailurePolicy,
    schedule_id: Option<Uuid>,
    cancel_requested: bool,
    cancel_flag: Arc<AtomicBool>,
    jobs: Vec<JobState>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl GroupState {
    fn derive_status(&self) -> GroupStatus {
        let all_terminal = self.jobs.iter().all(|j| j.status.is_terminal());
        if self.cancel_requested {
            return GroupStatus::Canceled;
        }
        if all_terminal {
            let any_error = self.jobs.iter().any(|j| j.status == JobStatus::Error);
            let all_error = self.jobs.iter().all(|j| j.status == JobStatus::Error);
            let inserted: u64 = self.jobs.iter().map(|j| j.inserted).sum();
            return match self.failure_policy {
                FailurePolicy::AllLanesFailed if all_error && inserted == 0 => GroupStatus::Failed,
                FailurePolicy::AnyLaneFailed if any_error => GroupStatus::Failed,
                _ => GroupStatus::Completed,
            };
        }
        if self.jobs.iter().any(|j| j.status != JobStatus::Pending) {
            GroupStatus::Running
        } else {
            GroupStatus::Starting
        }
    }

    fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id,
            status: self.derive_status(),
            inserted: self.jobs.iter().map(|j| j.inserted).sum(),
            errors: self.jobs.iter().map(|j| j.errors).sum(),
            duplicates: self.jobs.iter().map(|j| j.duplicates).sum(),
            start_urls: self.start_urls.clone(),
            worker_count: self.worker_count,
            member_count: self.jobs.len(),
            jobs: self
                .jobs
                .iter()
                .map(|j| JobSummary {
                    id: j.id,
                    status: j.status,
                    inserted: j.inserted,
                    errors: j.errors,
                    duplicates: j.duplicates,
                })
                .collect(),
            schedule_id: self.schedule_id,
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Immutable view of one member job.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub inserted: u64,
    pub errors: u64,
    pub duplicates: u64,
}

/// Immutable view of a group, safe to hand to any number of pollers.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: Uuid,
    pub status: GroupStatus,
    pub inserted: u64,
    pub errors: u64,
    pub duplicates: u64,
    pub start_urls: Vec<String>,
    pub worker_count: usize,
    pub member_count: usize,
    pub jobs: Vec<JobSummary>,
    pub schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The registry lock only guards the id → group map; every group carries
/// its own mutex, so lanes of one group never contend with another's.
pub struct GroupTracker {
    groups: RwLock<HashMap<Uuid, Arc<Mutex<GroupState>>>>,
    events: broadcast::Sender<GroupSnapshot>,
}

impl Default for GroupTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            groups: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn group(&self, group_id: Uuid) -> Option<Arc<Mutex<GroupState>>> {
        self.groups
            .read()
            .expect("tracker registry lock")
            .get(&group_id)
            .cloned()
    }

    /// Register a new group with `worker_count` member jobs in `pending`.
    /// Returns the group id and the member job ids, in lane order.
    pub fn create(
        &self,
        start_urls: Vec<String>,
        worker_count: usize,
        failure_policy: FailurePolicy,
        schedule_id: Option<Uuid>,
    ) -> (Uuid, Vec<Uuid>) {
        let group_id = Uuid::new_v4();
        let jobs: Vec<JobState> = (0..worker_count)
            .map(|_| JobState {
                id: Uuid::new_v4(),
                status: JobStatus::Pending,
                inserted: 0,
                errors: 0,
                duplicates: 0,
            })
            .collect();
        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();

        let state = GroupState {
            id: group_id,
            start_urls,
            worker_count,
            failure_policy,
            schedule_id,
            cancel_requested: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            jobs,
            created_at: Utc::now(),
            finished_at: None,
        };
        let snapshot = state.snapshot();
        self.groups
            .write()
            .expect("tracker registry lock")
            .insert(group_id, Arc::new(Mutex::new(state)));

        info!(group_id = %group_id, workers = worker_count, "Job group created");
        let _ = self.events.send(snapshot);
        (group_id, job_ids)
    }

    /// The group's shared cancellation flag, checked by lanes at suspension
    /// points.
    pub fn cancel_flag(&self, group_id: Uuid) -> Option<Arc<AtomicBool>> {
        self.group(group_id)
            .map(|g| g.lock().expect("group lock").cancel_flag.clone())
    }

    /// Mark a member job as running. Ignored once the job is terminal.
    pub fn mark_job_running(&self, group_id: Uuid, job_id: Uuid) {
        let Some(group) = self.group(group_id) else {
            return;
        };
        let snapshot = {
            let mut group = group.lock().expect("group lock");
            if let Some(job) = group.jobs.iter_mut().find(|j| j.id == job_id) {
                if !job.status.is_terminal() {
                    job.status = JobStatus::Running;
                }
            }
            group.snapshot()
        };
        let _ = self.events.send(snapshot);
    }

    /// Apply a lane's count deltas and, optionally, its terminal transition.
    /// Reports against a job that already reached a terminal state are
    /// dropped, which makes each terminal transition apply at most once.
    pub fn report(
        &self,
        group_id: Uuid,
        job_id: Uuid,
        delta_inserted: u64,
        delta_errors: u64,
        delta_duplicates: u64,
        terminal: Option<JobStatus>,
    ) {
        let Some(group) = self.group(group_id) else {
            return;
        };
        let snapshot = {
            let mut group = group.lock().expect("group lock");
            let Some(job) = group.jobs.iter_mut().find(|j| j.id == job_id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }

            job.inserted += delta_inserted;
            job.errors += delta_errors;
            job.duplicates += delta_duplicates;
            if let Some(state) = terminal {
                debug_assert!(state.is_terminal(), "report terminal must be done or error");
                job.status = state;
            }

            if group.finished_at.is_none()
                && group.jobs.iter().all(|j| j.status.is_terminal())
            {
                group.finished_at = Some(Utc::now());
                info!(
                    group_id = %group_id,
                    status = %group.derive_status(),
                    inserted = group.jobs.iter().map(|j| j.inserted).sum::<u64>(),
                    errors = group.jobs.iter().map(|j| j.errors).sum::<u64>(),
                    "Job group finished"
                );
            }
            group.snapshot()
        };
        let _ = self.events.send(snapshot);
    }

    /// Request group-wide cancellation. Returns immediately without waiting
    /// for lanes to exit; a no-op on groups that already reached a terminal
    /// state.
    pub fn stop(&self, group_id: Uuid) -> Result<(), DealScoutError> {
        let group = self
            .group(group_id)
            .ok_or(DealScoutError::GroupNotFound(group_id))?;
        let snapshot = {
            let mut group = group.lock().expect("group lock");
            if group.derive_status().is_terminal() {
                return Ok(());
            }
            group.cancel_requested = true;
            group.cancel_flag.store(true, Ordering::Relaxed);
            info!(group_id = %group_id, "Cancellation requested");
            group.snapshot()
        };
        let _ = self.events.send(snapshot);
        Ok(())
    }

    pub fn get(&self, group_id: Uuid) -> Option<GroupSnapshot> {
        self.group(group_id)
            .map(|g| g.lock().expect("group lock").snapshot())
    }

    /// All groups, newest first.
    pub fn list(&self, limit: usize) -> Vec<GroupSnapshot> {
        let handles: Vec<Arc<Mutex<GroupState>>> = self
            .groups
            .read()
            .expect("tracker registry lock")
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<GroupSnapshot> = handles
            .iter()
            .map(|g| g.lock().expect("group lock").snapshot())
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        snapshots.truncate(limit);
        snapshots
    }

    /// Live feed of snapshots, one per tracker mutation. Lossy under slow
    /// consumers; pollers stay correct via `get`/`list`.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupSnapshot> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_group(workers: usize, policy: FailurePolicy) -> (GroupTracker, Uuid, Vec<Uuid>) {
        let tracker = GroupTracker::new();
        let (group_id, job_ids) = tracker.create(
            vec!["https://example.com/search".to_string()],
            workers,
            policy,
            None,
        );
        (tracker, group_id, job_ids)
    }

    #[test]
    fn create_registers_pending_members() {
        let (tracker, group_id, job_ids) = tracker_with_group(3, FailurePolicy::default());
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.status, GroupStatus::Starting);
        assert_eq!(snap.member_count, 3);
        assert_eq!(job_ids.len(), 3);
        assert!(snap.jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert_eq!(snap.inserted, 0);
    }

    #[test]
    fn running_job_makes_group_running() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::default());
        tracker.mark_job_running(group_id, job_ids[0]);
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Running);
    }

    #[test]
    fn deltas_accumulate_and_aggregate() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::default());
        tracker.report(group_id, job_ids[0], 3, 1, 0, None);
        tracker.report(group_id, job_ids[1], 2, 0, 4, None);
        tracker.report(group_id, job_ids[0], 1, 0, 0, None);
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.inserted, 6);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.duplicates, 4);
    }

    #[test]
    fn reports_after_terminal_are_dropped() {
        let (tracker, group_id, job_ids) = tracker_with_group(1, FailurePolicy::default());
        tracker.report(group_id, job_ids[0], 5, 0, 0, Some(JobStatus::Done));
        // A straggler report must not double-apply
        tracker.report(group_id, job_ids[0], 5, 2, 0, None);
        tracker.report(group_id, job_ids[0], 0, 0, 0, Some(JobStatus::Error));
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.inserted, 5);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.status, GroupStatus::Completed);
    }

    #[test]
    fn all_done_completes_group() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::default());
        tracker.report(group_id, job_ids[0], 1, 0, 0, Some(JobStatus::Done));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Running);
        tracker.report(group_id, job_ids[1], 1, 0, 0, Some(JobStatus::Done));
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.status, GroupStatus::Completed);
        assert!(snap.finished_at.is_some());
    }

    #[test]
    fn all_lanes_failed_with_zero_inserts_fails_group() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::AllLanesFailed);
        tracker.report(group_id, job_ids[0], 0, 3, 0, Some(JobStatus::Error));
        tracker.report(group_id, job_ids[1], 0, 3, 0, Some(JobStatus::Error));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Failed);
    }

    #[test]
    fn lane_error_with_inserts_still_completes() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::AllLanesFailed);
        tracker.report(group_id, job_ids[0], 4, 0, 0, Some(JobStatus::Done));
        tracker.report(group_id, job_ids[1], 0, 3, 0, Some(JobStatus::Error));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Completed);
    }

    #[test]
    fn any_lane_failed_policy_escalates_single_error() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::AnyLaneFailed);
        tracker.report(group_id, job_ids[0], 4, 0, 0, Some(JobStatus::Done));
        tracker.report(group_id, job_ids[1], 2, 3, 0, Some(JobStatus::Error));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Failed);
    }

    #[test]
    fn never_policy_ignores_all_errors() {
        let (tracker, group_id, job_ids) = tracker_with_group(1, FailurePolicy::Never);
        tracker.report(group_id, job_ids[0], 0, 9, 0, Some(JobStatus::Error));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Completed);
    }

    #[test]
    fn stop_cancels_and_preserves_partial_counts() {
        let (tracker, group_id, job_ids) = tracker_with_group(2, FailurePolicy::default());
        tracker.mark_job_running(group_id, job_ids[0]);
        tracker.report(group_id, job_ids[0], 2, 0, 1, None);
        tracker.stop(group_id).unwrap();
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.status, GroupStatus::Canceled);
        assert_eq!(snap.inserted, 2);
        assert_eq!(snap.duplicates, 1);

        // Lanes wind down with partial counts; status stays canceled
        tracker.report(group_id, job_ids[0], 1, 0, 0, Some(JobStatus::Done));
        tracker.report(group_id, job_ids[1], 0, 0, 0, Some(JobStatus::Done));
        let snap = tracker.get(group_id).unwrap();
        assert_eq!(snap.status, GroupStatus::Canceled);
        assert_eq!(snap.inserted, 3);
    }

    #[test]
    fn stop_on_terminal_group_is_a_noop() {
        let (tracker, group_id, job_ids) = tracker_with_group(1, FailurePolicy::default());
        tracker.report(group_id, job_ids[0], 1, 0, 0, Some(JobStatus::Done));
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Completed);
        tracker.stop(group_id).unwrap();
        assert_eq!(tracker.get(group_id).unwrap().status, GroupStatus::Completed);
    }

    #[test]
    fn stop_unknown_group_errors() {
        let tracker = GroupTracker::new();
        assert!(matches!(
            tracker.stop(Uuid::new_v4()),
            Err(DealScoutError::GroupNotFound(_))
        ));
    }

    #[test]
    fn stop_sets_shared_cancel_flag() {
        let (tracker, group_id, _) = tracker_with_group(1, FailurePolicy::default());
        let flag = tracker.cancel_flag(group_id).unwrap();
        assert!(!flag.load(Ordering::Relaxed));
        tracker.stop(group_id).unwrap();
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn list_is_newest_first_and_capped() {
        let tracker = GroupTracker::new();
        for _ in 0..5 {
            tracker.create(vec![], 1, FailurePolicy::default(), None);
        }
        let listed = tracker.list(3);
        assert_eq!(listed.len(), 3);
        // Same-instant timestamps fall back to id ordering; just check the
        // newest-created id is first among groups sharing its timestamp set.
        assert!(listed
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn mutations_are_offered_to_the_event_stream() {
        let tracker = GroupTracker::new();
        let mut rx = tracker.subscribe();
        let (group_id, job_ids) = tracker.create(vec![], 1, FailurePolicy::default(), None);

        let created = rx.recv().await.unwrap();
        assert_eq!(created.id, group_id);
        assert_eq!(created.status, GroupStatus::Starting);

        tracker.report(group_id, job_ids[0], 2, 0, 0, None);
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.inserted, 2);
    }
}
