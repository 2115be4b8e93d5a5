//! In-memory [`JobStore`] shared by the harness and the reference scheduler.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;
use kiln_sim::InstanceStatus;
use kiln_sim::Job;
use kiln_sim::JobState;
use kiln_sim::JobStore;
use kiln_sim::Resources;
use kiln_sim::Share;
use kiln_sim::StoreError;
use kiln_sim::TaskInstance;
use kiln_sim::TaskRecord;
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    state: JobState,
    attempts: u32,
    /// Submission sequence, for stable ordering.
    sequence: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: BTreeMap<String, StoredJob>,
    instances: BTreeMap<String, TaskInstance>,
    shares: BTreeMap<String, Share>,
    submit_times: BTreeSet<u64>,
    next_sequence: u64,
}

/// What happened to a job after an instance finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The job is finished for good.
    Completed,
    /// The job went back to waiting for another attempt.
    Retrying,
}

/// Job store kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<StoreState>,
}

fn not_found(kind: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

impl InMemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiting jobs in submission order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.read();
        let mut waiting: Vec<&StoredJob> = state.jobs.values().filter(|s| s.state == JobState::Waiting).collect();
        waiting.sort_by_key(|s| s.sequence);
        waiting.into_iter().map(|s| s.job.clone()).collect()
    }

    /// Current state of a job.
    pub fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.state.read().jobs.get(job_id).map(|s| s.state)
    }

    /// Number of instances launched for a job so far.
    pub fn attempts(&self, job_id: &str) -> u32 {
        self.state.read().jobs.get(job_id).map_or(0, |s| s.attempts)
    }

    /// Share installed for `user`.
    pub fn share(&self, user: &str) -> Option<Share> {
        self.state.read().shares.get(user).cloned()
    }

    /// Resources held by running instances, per user.
    pub fn running_usage(&self) -> BTreeMap<String, Resources> {
        let state = self.state.read();
        let mut usage: BTreeMap<String, Resources> = BTreeMap::new();
        for instance in state.instances.values().filter(|i| i.status == InstanceStatus::Running) {
            if let Some(stored) = state.jobs.get(&instance.job_id) {
                let entry = usage.entry(stored.job.user.clone()).or_default();
                *entry = entry.plus(&stored.job.resources);
            }
        }
        usage
    }

    /// Record that `instance` was launched for its job.
    ///
    /// The job must be waiting. The instance is stored as running and unconfirmed.
    pub fn record_launch(&self, instance: TaskInstance) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.instances.contains_key(&instance.task_id) {
            return Err(StoreError::Duplicate {
                kind: "task".to_string(),
                id: instance.task_id,
            });
        }
        let stored = state.jobs.get_mut(&instance.job_id).ok_or_else(|| not_found("job", &instance.job_id))?;
        if stored.state != JobState::Waiting {
            return Err(StoreError::Unavailable {
                reason: format!("job {} is not waiting", instance.job_id),
            });
        }
        stored.state = JobState::Running;
        stored.attempts += 1;
        debug!(task_id = %instance.task_id, job_id = %instance.job_id, "launch recorded");
        let task_id = instance.task_id.clone();
        state.instances.insert(
            task_id,
            TaskInstance {
                status: InstanceStatus::Running,
                scheduled_at_ms: None,
                end_time_ms: None,
                ..instance
            },
        );
        Ok(())
    }

    /// Record the cluster's confirmation that a task is running.
    pub fn record_scheduled(&self, task_id: &str, at_ms: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let instance = state.instances.get_mut(task_id).ok_or_else(|| not_found("task", task_id))?;
        instance.scheduled_at_ms.get_or_insert(at_ms);
        Ok(())
    }

    /// Record that a task finished.
    ///
    /// A failed attempt sends its job back to waiting while attempts remain below
    /// `max_retries`; otherwise the job completes.
    pub fn record_completion(
        &self,
        task_id: &str,
        status: InstanceStatus,
        end_ms: u64,
        reason: Option<String>,
    ) -> Result<CompletionOutcome, StoreError> {
        let mut state = self.state.write();
        let instance = state.instances.get_mut(task_id).ok_or_else(|| not_found("task", task_id))?;
        if instance.status.is_terminal() {
            return Err(StoreError::Duplicate {
                kind: "completion".to_string(),
                id: task_id.to_string(),
            });
        }
        instance.status = status;
        instance.end_time_ms = Some(end_ms);
        instance.reason = reason;
        let job_id = instance.job_id.clone();

        let stored = state.jobs.get_mut(&job_id).ok_or_else(|| not_found("job", &job_id))?;
        let outcome = if status == InstanceStatus::Failed && stored.attempts < stored.job.max_retries {
            stored.state = JobState::Waiting;
            CompletionOutcome::Retrying
        } else {
            stored.state = JobState::Completed;
            CompletionOutcome::Completed
        };
        debug!(task_id, job_id = %job_id, %status, ?outcome, "completion recorded");
        Ok(outcome)
    }

    /// Complete a waiting job without running it, for jobs no host can ever take.
    pub fn record_rejected(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let stored = state.jobs.get_mut(job_id).ok_or_else(|| not_found("job", job_id))?;
        stored.state = JobState::Completed;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn set_shares(&self, shares: &[Share]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for share in shares {
            state.shares.insert(share.user.clone(), share.clone());
        }
        Ok(())
    }

    async fn submit(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate {
                kind: "job".to_string(),
                id: job.id,
            });
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.submit_times.insert(job.submit_time_ms);
        state.jobs.insert(
            job.id.clone(),
            StoredJob {
                job,
                state: JobState::Waiting,
                attempts: 0,
                sequence,
            },
        );
        Ok(())
    }

    async fn submission_exists_at(&self, submit_time_ms: u64) -> Result<bool, StoreError> {
        Ok(self.state.read().submit_times.contains(&submit_time_ms))
    }

    async fn running_task_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.read();
        Ok(state
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .map(|i| i.task_id.clone())
            .collect())
    }

    async fn running_instances(&self) -> Result<Vec<TaskInstance>, StoreError> {
        let state = self.state.read();
        Ok(state.instances.values().filter(|i| i.status == InstanceStatus::Running).cloned().collect())
    }

    async fn instances_ended_between(&self, start_ms: u64, end_ms: u64) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.read();
        Ok(state
            .instances
            .values()
            .filter(|i| i.end_time_ms.is_some_and(|t| t >= start_ms && t < end_ms))
            .filter_map(|i| {
                state.jobs.get(&i.job_id).map(|s| TaskRecord {
                    job: s.job.clone(),
                    instance: i.clone(),
                })
            })
            .collect())
    }

    async fn has_unfinished_jobs(&self) -> Result<bool, StoreError> {
        Ok(self.state.read().jobs.values().any(|s| s.state != JobState::Completed))
    }

    async fn task_records(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.read();
        state
            .instances
            .values()
            .map(|i| {
                let stored = state.jobs.get(&i.job_id).ok_or_else(|| not_found("job", &i.job_id))?;
                Ok(TaskRecord {
                    job: stored.job.clone(),
                    instance: i.clone(),
                })
            })
            .collect()
    }
}
