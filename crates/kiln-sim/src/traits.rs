//! Contracts the harness requires of its collaborators.
//!
//! The backing store and the mock cluster are owned by the caller; the harness only
//! submits jobs and reads state back for convergence checks.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::Host;
use crate::types::Job;
use crate::types::Share;
use crate::types::TaskInstance;
use crate::types::TaskRecord;

/// Transactional job store shared by the harness and the scheduler under test.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Install per-user quotas.
    async fn set_shares(&self, shares: &[Share]) -> Result<(), StoreError>;

    /// Insert a job (and its group membership) in one transaction.
    ///
    /// `job.submit_time_ms` is the instant recorded for the submission.
    async fn submit(&self, job: Job) -> Result<(), StoreError>;

    /// Whether a submission recorded at exactly `submit_time_ms` is visible.
    async fn submission_exists_at(&self, submit_time_ms: u64) -> Result<bool, StoreError>;

    /// Task ids the store believes are running.
    async fn running_task_ids(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Task instances the store believes are running.
    async fn running_instances(&self) -> Result<Vec<TaskInstance>, StoreError>;

    /// Records whose end time falls in `[start_ms, end_ms)`.
    async fn instances_ended_between(&self, start_ms: u64, end_ms: u64) -> Result<Vec<TaskRecord>, StoreError>;

    /// Whether any submitted job is still waiting or running.
    async fn has_unfinished_jobs(&self) -> Result<bool, StoreError>;

    /// Every task instance in the store, joined with its job.
    async fn task_records(&self) -> Result<Vec<TaskRecord>, StoreError>;
}

/// The harness's view of the (mock) cluster.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Make hosts available for offers.
    async fn register_hosts(&self, hosts: &[Host]) -> Result<(), StoreError>;

    /// Task ids the cluster believes are running.
    async fn running_task_ids(&self) -> Result<BTreeSet<String>, StoreError>;
}
