//! Jobs, task instances, hosts and shares as seen by the replay harness.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::SIM_RUN_TIME_LABEL;
use crate::constants::SIM_STATUS_LABEL;

/// Resource vector requested by a job or offered by a host.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores.
    pub cpus: f64,
    /// Memory in MB.
    pub mem: f64,
    /// GPUs, when the job or host has any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<f64>,
}

impl Resources {
    /// Resource vector without GPUs.
    pub fn new(cpus: f64, mem: f64) -> Self {
        Self { cpus, mem, gpus: None }
    }

    /// Whether `request` fits inside `self`.
    pub fn fits(&self, request: &Resources) -> bool {
        let gpus_fit = match request.gpus {
            Some(wanted) if wanted > 0.0 => self.gpus.unwrap_or(0.0) >= wanted,
            _ => true,
        };
        self.cpus >= request.cpus && self.mem >= request.mem && gpus_fit
    }

    /// `self - request`, element-wise.
    pub fn subtract(&self, request: &Resources) -> Resources {
        Resources {
            cpus: self.cpus - request.cpus,
            mem: self.mem - request.mem,
            gpus: match (self.gpus, request.gpus) {
                (Some(have), Some(wanted)) => Some(have - wanted),
                (have, _) => have,
            },
        }
    }

    /// `self + other`, element-wise.
    pub fn plus(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus + other.cpus,
            mem: self.mem + other.mem,
            gpus: match (self.gpus, other.gpus) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            },
        }
    }
}

/// Terminal status a simulated job is intended to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntendedStatus {
    /// The task exits cleanly.
    #[default]
    Success,
    /// The task exits with a failure.
    Failed,
}

impl std::str::FromStr for IntendedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(IntendedStatus::Success),
            "failed" | "failure" => Ok(IntendedStatus::Failed),
            _ => Err(format!("invalid intended status: {s}, expected: success, failed")),
        }
    }
}

/// A schedulable unit of work.
///
/// The open `labels` map carries simulation-only metadata: the intended run duration
/// ([`SIM_RUN_TIME_LABEL`]) and the intended terminal status ([`SIM_STATUS_LABEL`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Command line.
    #[serde(default)]
    pub command: String,
    /// Owner.
    pub user: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Larger is more important.
    #[serde(default)]
    pub priority: u32,
    /// Attempts allowed before the job is failed for good.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on a single attempt's run time.
    #[serde(default = "default_max_runtime_ms")]
    pub max_runtime_ms: u64,
    /// Count every failure against `max_retries`, even ones that are not the job's fault.
    #[serde(default)]
    pub disable_mea_culpa_retries: bool,
    /// Requested resources.
    pub resources: Resources,
    /// Logical submission instant in milliseconds.
    pub submit_time_ms: u64,
    /// Run time the submitter expects.
    #[serde(default)]
    pub expected_runtime_ms: Option<u64>,
    /// Group the job belongs to.
    #[serde(default)]
    pub group: Option<String>,
    /// Open key/value labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_runtime_ms() -> u64 {
    u64::MAX
}

impl Job {
    /// Intended run duration recovered from the labels.
    pub fn sim_run_time_ms(&self) -> Option<u64> {
        self.labels.get(SIM_RUN_TIME_LABEL).and_then(|v| v.parse().ok())
    }

    /// Intended terminal status recovered from the labels; success when absent.
    pub fn sim_status(&self) -> IntendedStatus {
        self.labels.get(SIM_STATUS_LABEL).and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

/// Lifecycle of a job inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Submitted, not running.
    Waiting,
    /// An instance is running.
    Running,
    /// No further instances will be launched.
    Completed,
}

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Launched and not yet finished.
    Running,
    /// Finished cleanly.
    Success,
    /// Finished with a failure.
    Failed,
}

impl InstanceStatus {
    /// Whether the attempt has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    /// Stable lowercase name, as written to trace files.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Success => "success",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Unique task id.
    pub task_id: String,
    /// Owning job.
    pub job_id: String,
    /// Host the task ran on.
    pub hostname: String,
    /// Agent id of that host.
    pub slave_id: String,
    /// When the cluster confirmed the launch.
    pub scheduled_at_ms: Option<u64>,
    /// When the task was launched.
    pub start_time_ms: u64,
    /// When the task finished.
    pub end_time_ms: Option<u64>,
    /// Current status.
    pub status: InstanceStatus,
    /// Failure reason, if any.
    pub reason: Option<String>,
}

/// A task instance joined with its job (and through it, its group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Job as stored at submission.
    pub job: Job,
    /// The attempt.
    pub instance: TaskInstance,
}

/// A host of the simulated cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Hostname.
    pub hostname: String,
    /// Unique agent id.
    pub slave_id: String,
    /// Capacities.
    pub resources: Resources,
}

/// Per-user quota handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    /// User the share applies to.
    pub user: String,
    /// CPU share.
    pub cpus: f64,
    /// Memory share in MB.
    pub mem: f64,
    /// GPU share.
    #[serde(default)]
    pub gpus: f64,
}
