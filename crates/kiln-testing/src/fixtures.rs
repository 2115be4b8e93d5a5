//! Builders for hosts, jobs and traces used across tests and the binary's demos.

use std::collections::BTreeMap;

use kiln_sim::Host;
use kiln_sim::Job;
use kiln_sim::Resources;
use kiln_sim::constants::SIM_RUN_TIME_LABEL;
use kiln_sim::constants::SIM_STATUS_LABEL;

/// Priority given to fixture jobs.
pub const DEFAULT_PRIORITY: u32 = 50;

/// `n` identical hosts named `host-{i}` with agent ids `agent-{i}`.
pub fn hosts(n: usize, cpus: f64, mem: f64) -> Vec<Host> {
    (0..n)
        .map(|i| Host {
            hostname: format!("host-{i}"),
            slave_id: format!("agent-{i}"),
            resources: Resources::new(cpus, mem),
        })
        .collect()
}

/// A one-cpu, 128 MB job that runs for `run_time_ms` and succeeds.
pub fn job(id: &str, user: &str, submit_time_ms: u64, run_time_ms: u64) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(SIM_RUN_TIME_LABEL.to_string(), run_time_ms.to_string());
    Job {
        id: id.to_string(),
        command: format!("sleep {}", run_time_ms / 1_000),
        user: user.to_string(),
        name: Some(format!("{id}-name")),
        priority: DEFAULT_PRIORITY,
        max_retries: 1,
        max_runtime_ms: u64::MAX,
        disable_mea_culpa_retries: false,
        resources: Resources::new(1.0, 128.0),
        submit_time_ms,
        expected_runtime_ms: Some(run_time_ms),
        group: None,
        labels,
    }
}

/// [`job`] that fails every attempt, with `max_retries` attempts allowed.
pub fn failing_job(id: &str, user: &str, submit_time_ms: u64, run_time_ms: u64, max_retries: u32) -> Job {
    let mut failing = job(id, user, submit_time_ms, run_time_ms);
    failing.labels.insert(SIM_STATUS_LABEL.to_string(), "failed".to_string());
    failing.max_retries = max_retries;
    failing
}

/// `n` jobs submitted `spacing_ms` apart, round-robin over `users` users, each running
/// `run_time_ms`. Sorted by submit time.
pub fn uniform_trace(n: usize, users: usize, spacing_ms: u64, run_time_ms: u64) -> Vec<Job> {
    let users = users.max(1);
    (0..n)
        .map(|i| job(&format!("job-{i:05}"), &format!("user-{}", i % users), i as u64 * spacing_ms, run_time_ms))
        .collect()
}
