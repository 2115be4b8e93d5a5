//! Mock cluster: fixed hosts, resource offers and simulated task execution.
//!
//! Tasks run for their intended duration in logical time. Launch confirmations and
//! completions are not applied to any store directly; they are published on a status
//! channel and whoever consumes it (the reference scheduler) applies them. That gives
//! the harness's convergence polls something real to wait for.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;
use kiln_sim::ClusterView;
use kiln_sim::Host;
use kiln_sim::InstanceStatus;
use kiln_sim::IntendedStatus;
use kiln_sim::Resources;
use kiln_sim::StoreError;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

/// Reason recorded when a task is stopped at its job's runtime limit.
pub const MAX_RUNTIME_EXCEEDED: &str = "max-runtime-exceeded";

/// A status change published by the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The task was accepted and is running.
    Running {
        /// Task id.
        task_id: String,
        /// Logical confirmation instant.
        at_ms: u64,
    },
    /// The task finished.
    Finished {
        /// Task id.
        task_id: String,
        /// Terminal status.
        status: InstanceStatus,
        /// Logical end instant.
        at_ms: u64,
        /// Failure reason, if any.
        reason: Option<String>,
    },
}

/// Free capacity on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    /// Hostname.
    pub hostname: String,
    /// Agent id.
    pub slave_id: String,
    /// Unused resources.
    pub available: Resources,
}

/// Everything the cluster needs to run one task.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Task id.
    pub task_id: String,
    /// Host to run on.
    pub hostname: String,
    /// Resources the task holds while running.
    pub resources: Resources,
    /// How long the task runs.
    pub run_time_ms: u64,
    /// Runtime limit; the task fails when it would run longer.
    pub max_runtime_ms: u64,
    /// How the task ends.
    pub status: IntendedStatus,
}

#[derive(Debug, Clone)]
struct RunningTask {
    request: LaunchRequest,
    start_ms: u64,
}

impl RunningTask {
    /// Logical end instant, terminal status and reason.
    fn outcome(&self) -> (u64, InstanceStatus, Option<String>) {
        let request = &self.request;
        if request.run_time_ms > request.max_runtime_ms {
            return (
                self.start_ms.saturating_add(request.max_runtime_ms),
                InstanceStatus::Failed,
                Some(MAX_RUNTIME_EXCEEDED.to_string()),
            );
        }
        let end_ms = self.start_ms.saturating_add(request.run_time_ms);
        match request.status {
            IntendedStatus::Success => (end_ms, InstanceStatus::Success, None),
            IntendedStatus::Failed => (end_ms, InstanceStatus::Failed, Some("simulated-failure".to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    hosts: BTreeMap<String, Host>,
    used: BTreeMap<String, Resources>,
    running: BTreeMap<String, RunningTask>,
}

/// In-process stand-in for a resource manager.
#[derive(Debug)]
pub struct MockCluster {
    state: RwLock<ClusterState>,
    updates: mpsc::UnboundedSender<StatusUpdate>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StatusUpdate>>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create a cluster with no hosts.
    pub fn new() -> Self {
        let (updates, receiver) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(ClusterState::default()),
            updates,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Take the status update stream. Only the first caller gets it.
    pub fn take_status_updates(&self) -> Option<mpsc::UnboundedReceiver<StatusUpdate>> {
        self.receiver.lock().take()
    }

    /// Free capacity per host, in hostname order. Hosts with nothing free are omitted.
    pub fn offers(&self) -> Vec<Offer> {
        let state = self.state.read();
        state
            .hosts
            .values()
            .map(|host| {
                let used = state.used.get(&host.hostname).copied().unwrap_or_default();
                Offer {
                    hostname: host.hostname.clone(),
                    slave_id: host.slave_id.clone(),
                    available: host.resources.subtract(&used),
                }
            })
            .filter(|offer| offer.available.cpus > 0.0 && offer.available.mem > 0.0)
            .collect()
    }

    /// Whether any registered host could ever hold `request`.
    pub fn could_ever_fit(&self, request: &Resources) -> bool {
        self.state.read().hosts.values().any(|host| host.resources.fits(request))
    }

    /// Start a task at `now_ms` and publish its confirmation.
    pub fn launch(&self, request: LaunchRequest, now_ms: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let host = state.hosts.get(&request.hostname).ok_or_else(|| StoreError::NotFound {
            kind: "host".to_string(),
            id: request.hostname.clone(),
        })?;
        let used = state.used.get(&request.hostname).copied().unwrap_or_default();
        if !host.resources.subtract(&used).fits(&request.resources) {
            return Err(StoreError::Unavailable {
                reason: format!("task {} does not fit on {}", request.task_id, request.hostname),
            });
        }
        if state.running.contains_key(&request.task_id) {
            return Err(StoreError::Duplicate {
                kind: "task".to_string(),
                id: request.task_id,
            });
        }

        state.used.insert(request.hostname.clone(), used.plus(&request.resources));
        let task_id = request.task_id.clone();
        debug!(task_id = %task_id, hostname = %request.hostname, now_ms, "task launched");
        state.running.insert(
            task_id.clone(),
            RunningTask {
                request,
                start_ms: now_ms,
            },
        );
        self.publish(StatusUpdate::Running { task_id, at_ms: now_ms });
        Ok(())
    }

    /// Finish every task whose end instant is at or before `now_ms`.
    ///
    /// Returns the number of tasks finished. Completions are published in end-time
    /// order, ties broken by task id.
    pub fn advance(&self, now_ms: u64) -> usize {
        let mut state = self.state.write();
        let mut finished: Vec<(u64, String, InstanceStatus, Option<String>)> = state
            .running
            .iter()
            .filter_map(|(task_id, task)| {
                let (end_ms, status, reason) = task.outcome();
                (end_ms <= now_ms).then(|| (end_ms, task_id.clone(), status, reason))
            })
            .collect();
        finished.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (end_ms, task_id, status, reason) in &finished {
            if let Some(task) = state.running.remove(task_id) {
                let hostname = task.request.hostname.clone();
                if let Some(used) = state.used.get_mut(&hostname) {
                    *used = used.subtract(&task.request.resources);
                }
            }
            self.publish(StatusUpdate::Finished {
                task_id: task_id.clone(),
                status: *status,
                at_ms: *end_ms,
                reason: reason.clone(),
            });
        }
        finished.len()
    }

    /// Number of tasks currently running.
    pub fn running_count(&self) -> usize {
        self.state.read().running.len()
    }

    fn publish(&self, update: StatusUpdate) {
        if self.updates.send(update).is_err() {
            warn!("status update dropped: no consumer");
        }
    }
}

#[async_trait]
impl ClusterView for MockCluster {
    async fn register_hosts(&self, hosts: &[Host]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for host in hosts {
            state.hosts.insert(host.hostname.clone(), host.clone());
        }
        Ok(())
    }

    async fn running_task_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.state.read().running.keys().cloned().collect())
    }
}
