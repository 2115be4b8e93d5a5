//! Simulation configuration.
//!
//! Loaded from TOML. `cycle_step_ms` is the only required option; everything else has
//! a default. The nested [`SchedulerConfig`] is handed to the scheduler under test
//! untouched by the harness.
//!
//! ```toml
//! cycle_step_ms = 30000
//! time_ms_between_optimizer_calls = 60000
//!
//! [[shares]]
//! user = "alice"
//! cpus = 10.0
//! mem = 10240.0
//!
//! [scheduler.matching]
//! max_jobs_considered = 500
//! ```

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::constants::DEFAULT_INCREMENTAL_OUTPUT_INTERVAL_MS;
use crate::constants::DEFAULT_OPTIMIZER_INTERVAL_MS;
use crate::constants::DEFAULT_POLL_INTERVAL_MS;
use crate::constants::DEFAULT_POLL_TIMEOUT_MS;
use crate::constants::DEFAULT_RECLAIM_PROBABILITY;
use crate::constants::DEFAULT_REBALANCE_INTERVAL_MS;
use crate::error::InvalidConfigSnafu;
use crate::error::MissingConfigSnafu;
use crate::error::ParseConfigSnafu;
use crate::error::ReadConfigSnafu;
use crate::error::Result;
use crate::types::Share;

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Logical milliseconds per cycle. Required.
    #[serde(default)]
    pub cycle_step_ms: Option<u64>,

    /// Per-user quotas installed in the store before the first cycle.
    #[serde(default)]
    pub shares: Vec<Share>,

    /// Wall-clock interval between incremental trace writes.
    #[serde(default = "default_incremental_output_interval_ms")]
    pub time_ms_between_incremental_output: u64,

    /// Logical interval between optimizer invocations.
    #[serde(default = "default_optimizer_interval_ms")]
    pub time_ms_between_optimizer_calls: u64,

    /// Logical interval between rebalancer invocations.
    #[serde(default = "default_rebalance_interval_ms")]
    pub time_ms_between_rebalancing: u64,

    /// Seed for the harness's own randomness (reclamation sampling).
    #[serde(default)]
    pub seed: u64,

    /// Probability in `[0, 1]` of requesting memory reclamation after a cycle.
    #[serde(default = "default_reclaim_probability")]
    pub reclaim_probability: f64,

    /// Upper bound on cycles; the run stops with a warning when reached.
    #[serde(default)]
    pub max_cycles: Option<u64>,

    /// Convergence poll spacing and timeout.
    #[serde(default)]
    pub poll: PollOptions,

    /// Configuration for the scheduler under test.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_incremental_output_interval_ms() -> u64 {
    DEFAULT_INCREMENTAL_OUTPUT_INTERVAL_MS
}

fn default_optimizer_interval_ms() -> u64 {
    DEFAULT_OPTIMIZER_INTERVAL_MS
}

fn default_rebalance_interval_ms() -> u64 {
    DEFAULT_REBALANCE_INTERVAL_MS
}

fn default_reclaim_probability() -> f64 {
    DEFAULT_RECLAIM_PROBABILITY
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cycle_step_ms: None,
            shares: Vec::new(),
            time_ms_between_incremental_output: DEFAULT_INCREMENTAL_OUTPUT_INTERVAL_MS,
            time_ms_between_optimizer_calls: DEFAULT_OPTIMIZER_INTERVAL_MS,
            time_ms_between_rebalancing: DEFAULT_REBALANCE_INTERVAL_MS,
            seed: 0,
            reclaim_probability: DEFAULT_RECLAIM_PROBABILITY,
            max_cycles: None,
            poll: PollOptions::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl SimConfig {
    /// Config with the required cycle step set and everything else defaulted.
    pub fn with_cycle_step_ms(cycle_step_ms: u64) -> Self {
        Self {
            cycle_step_ms: Some(cycle_step_ms),
            ..Self::default()
        }
    }

    /// Parse TOML text. Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context(ParseConfigSnafu)
    }

    /// Read and parse a TOML file. Does not validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        Self::from_toml_str(&text)
    }

    /// Check required options and value ranges.
    ///
    /// Returns the cycle step so callers cannot forget it was optional.
    pub fn validate(&self) -> Result<u64> {
        let Some(cycle_step_ms) = self.cycle_step_ms else {
            return MissingConfigSnafu { option: "cycle_step_ms" }.fail();
        };
        if cycle_step_ms == 0 {
            return InvalidConfigSnafu {
                reason: "cycle_step_ms must be greater than zero",
            }
            .fail();
        }
        if !(0.0..=1.0).contains(&self.reclaim_probability) {
            return InvalidConfigSnafu {
                reason: format!("reclaim_probability must be within [0, 1], got {}", self.reclaim_probability),
            }
            .fail();
        }
        if self.time_ms_between_incremental_output == 0 {
            return InvalidConfigSnafu {
                reason: "time_ms_between_incremental_output must be greater than zero",
            }
            .fail();
        }
        self.poll.validate()?;
        Ok(cycle_step_ms)
    }
}

/// Spacing and timeout for convergence polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptions {
    /// Milliseconds between attempts.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Milliseconds before giving up.
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
        }
    }
}

impl PollOptions {
    /// Reject a zero interval, which would make the attempt bound meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return InvalidConfigSnafu {
                reason: "poll.interval_ms must be greater than zero",
            }
            .fail();
        }
        Ok(())
    }
}

/// Configuration passed through to the scheduler under test.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-task limits.
    #[serde(default)]
    pub task_constraints: TaskConstraints,
    /// Fair-share rebalancer thresholds.
    #[serde(default)]
    pub rebalancer: RebalancerConfig,
    /// Matching engine limits.
    #[serde(default)]
    pub matching: MatchingConfig,
    /// External optimizer, if any.
    #[serde(default)]
    pub optimizer: Option<OptimizerConfig>,
}

/// Per-task limits enforced by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConstraints {
    /// Largest CPU request a single task may make.
    pub cpus: f64,
    /// Largest memory request (MB) a single task may make.
    pub memory_mb: f64,
    /// Upper bound applied to each job's `max_retries`.
    pub retry_limit: u32,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            cpus: 64.0,
            memory_mb: 256.0 * 1024.0,
            retry_limit: 20,
        }
    }
}

/// DRU-based rebalancer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    /// DRU below which a user's tasks are never preempted.
    pub safe_dru_threshold: f64,
    /// Smallest DRU improvement worth a preemption.
    pub min_dru_diff: f64,
    /// Most preemptions per rebalance cycle.
    pub max_preemption: u32,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            safe_dru_threshold: 1.0,
            min_dru_diff: 0.5,
            max_preemption: 64,
        }
    }
}

/// Matching engine limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Most waiting jobs considered per match cycle.
    pub max_jobs_considered: usize,
    /// Fitness at which the matcher stops looking for a better host.
    pub good_enough_fitness: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_jobs_considered: 1_000,
            good_enough_fitness: 0.8,
        }
    }
}

/// External optimizer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// URL the scheduler posts optimization requests to.
    pub endpoint: String,
}
