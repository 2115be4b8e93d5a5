//! A small phase-signalled scheduler to drive the harness end to end.
//!
//! One tokio task per phase waits on its channel, does its per-tick work against the
//! [`InMemoryJobStore`] and the [`MockCluster`], and acknowledges. A separate task
//! applies the cluster's status updates to the store. All timestamps come from the
//! shared [`SimulatedClock`].
//!
//! The policies are deliberately simple:
//!
//! - rank: least share-normalised usage first, then higher priority, earlier submit,
//!   smaller id
//! - match: first fit over offers in hostname order, at most `max_jobs_considered`
//!   jobs per tick
//! - optimize / rebalance: log and acknowledge

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use kiln_sim::Job;
use kiln_sim::PhaseAck;
use kiln_sim::PhaseReceivers;
use kiln_sim::Resources;
use kiln_sim::SchedulerConfig;
use kiln_sim::TaskInstance;
use kiln_time::Clock;
use kiln_time::SimulatedClock;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::LaunchRequest;
use crate::cluster::MockCluster;
use crate::cluster::Offer;
use crate::cluster::StatusUpdate;
use crate::store::InMemoryJobStore;

/// Run time used for jobs that carry neither a simulated nor an expected run time.
pub const DEFAULT_RUN_TIME_MS: u64 = 1;

/// How many times each phase ran, and what the match phase did.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Completion ticks handled.
    pub completion: AtomicU64,
    /// Rank ticks handled.
    pub rank: AtomicU64,
    /// Optimize ticks handled.
    pub optimize: AtomicU64,
    /// Offer ticks handled.
    pub offer: AtomicU64,
    /// Match ticks handled.
    pub matching: AtomicU64,
    /// Rebalance ticks handled.
    pub rebalance: AtomicU64,
    /// Tasks launched.
    pub launched: AtomicU64,
    /// Jobs rejected as unplaceable.
    pub rejected: AtomicU64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Work handed from one phase to a later one within a cycle.
#[derive(Debug, Default)]
struct TickState {
    ranked: Vec<Job>,
    offers: Vec<Offer>,
}

#[derive(Clone)]
struct Shared {
    store: Arc<InMemoryJobStore>,
    cluster: Arc<MockCluster>,
    clock: SimulatedClock,
    config: SchedulerConfig,
    tick: Arc<Mutex<TickState>>,
    stats: Arc<SchedulerStats>,
}

/// Handle to the running scheduler tasks.
pub struct ReferenceScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<SchedulerStats>,
}

impl ReferenceScheduler {
    /// Start one task per phase plus the status-update task.
    ///
    /// Must be called inside a tokio runtime. If the cluster's status stream was already
    /// taken, completions and confirmations never reach the store and the harness's
    /// polls will time out.
    pub fn spawn(
        store: Arc<InMemoryJobStore>,
        cluster: Arc<MockCluster>,
        receivers: PhaseReceivers,
        clock: SimulatedClock,
        config: SchedulerConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(SchedulerStats::default());
        let shared = Shared {
            store,
            cluster,
            clock,
            config,
            tick: Arc::new(Mutex::new(TickState::default())),
            stats: Arc::clone(&stats),
        };

        let PhaseReceivers {
            completion,
            rank,
            optimize,
            offer,
            matching,
            rebalance,
        } = receivers;

        let mut tasks = vec![
            spawn_phase(completion, cancel.clone(), shared.clone(), handle_completion),
            spawn_phase(rank, cancel.clone(), shared.clone(), handle_rank),
            spawn_phase(optimize, cancel.clone(), shared.clone(), handle_optimize),
            spawn_phase(offer, cancel.clone(), shared.clone(), handle_offer),
            spawn_phase(matching, cancel.clone(), shared.clone(), handle_match),
            spawn_phase(rebalance, cancel.clone(), shared.clone(), handle_rebalance),
        ];

        match shared.cluster.take_status_updates() {
            Some(updates) => tasks.push(tokio::spawn(apply_status_updates(updates, shared.store.clone(), cancel.clone()))),
            None => warn!("cluster status updates already taken; store will not see completions"),
        }

        info!(tasks = tasks.len(), "reference scheduler started");
        Self { cancel, tasks, stats }
    }

    /// Phase and launch counters.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Stop every task and wait for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task failed");
            }
        }
    }
}

fn spawn_phase(
    mut signals: mpsc::Receiver<PhaseAck>,
    cancel: CancellationToken,
    shared: Shared,
    handler: fn(&Shared),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(ack) => {
                        handler(&shared);
                        ack.complete();
                    }
                    None => break,
                },
            }
        }
    })
}

async fn apply_status_updates(
    mut updates: mpsc::UnboundedReceiver<StatusUpdate>,
    store: Arc<InMemoryJobStore>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };
        let applied = match update {
            StatusUpdate::Running { task_id, at_ms } => store.record_scheduled(&task_id, at_ms),
            StatusUpdate::Finished {
                task_id,
                status,
                at_ms,
                reason,
            } => store.record_completion(&task_id, status, at_ms, reason).map(|_| ()),
        };
        if let Err(e) = applied {
            warn!(error = %e, "failed to apply status update");
        }
    }
}

// ============================================================================
// Phase handlers
// ============================================================================

fn handle_completion(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.completion);
    let finished = shared.cluster.advance(shared.clock.now_ms());
    debug!(finished, "completion phase");
}

fn handle_rank(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.rank);
    let usage = shared.store.running_usage();
    let mut ranked = shared.store.pending_jobs();
    ranked.sort_by(|a, b| compare_for_rank(a, b, &usage, &shared.store));
    debug!(waiting = ranked.len(), "rank phase");
    shared.tick.lock().ranked = ranked;
}

fn handle_optimize(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.optimize);
    match &shared.config.optimizer {
        Some(optimizer) => debug!(endpoint = %optimizer.endpoint, "optimize phase"),
        None => debug!("optimize phase (no optimizer configured)"),
    }
}

fn handle_offer(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.offer);
    let offers = shared.cluster.offers();
    debug!(offers = offers.len(), "offer phase");
    shared.tick.lock().offers = offers;
}

fn handle_match(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.matching);
    let now_ms = shared.clock.now_ms();
    let (ranked, mut offers) = {
        let mut tick = shared.tick.lock();
        (std::mem::take(&mut tick.ranked), std::mem::take(&mut tick.offers))
    };

    let limit = shared.config.matching.max_jobs_considered;
    let mut launched = 0usize;
    for job in ranked.iter().take(limit) {
        let exhausted = shared.store.attempts(&job.id) >= shared.config.task_constraints.retry_limit;
        if exhausted || !within_constraints(&job.resources, shared) || !shared.cluster.could_ever_fit(&job.resources) {
            warn!(job_id = %job.id, exhausted, "job can never be placed; rejecting");
            if let Err(e) = shared.store.record_rejected(&job.id) {
                warn!(job_id = %job.id, error = %e, "failed to reject job");
            }
            SchedulerStats::bump(&shared.stats.rejected);
            continue;
        }

        let Some(offer) = offers.iter_mut().find(|offer| offer.available.fits(&job.resources)) else {
            continue;
        };
        if launch(shared, job, offer, now_ms) {
            offer.available = offer.available.subtract(&job.resources);
            launched += 1;
        }
    }
    debug!(considered = ranked.len().min(limit), launched, "match phase");
}

fn handle_rebalance(shared: &Shared) {
    SchedulerStats::bump(&shared.stats.rebalance);
    let rebalancer = &shared.config.rebalancer;
    debug!(
        safe_dru_threshold = rebalancer.safe_dru_threshold,
        max_preemption = rebalancer.max_preemption,
        "rebalance phase"
    );
}

// ============================================================================
// Policy helpers
// ============================================================================

/// Usage divided by share, taking the larger of the cpu and mem fractions.
///
/// Users without a share are ranked by raw usage.
fn dominant_share(user: &str, usage: &BTreeMap<String, Resources>, store: &InMemoryJobStore) -> f64 {
    let used = usage.get(user).copied().unwrap_or_default();
    match store.share(user) {
        Some(share) if share.cpus > 0.0 && share.mem > 0.0 => (used.cpus / share.cpus).max(used.mem / share.mem),
        _ => used.cpus.max(used.mem),
    }
}

fn compare_for_rank(a: &Job, b: &Job, usage: &BTreeMap<String, Resources>, store: &InMemoryJobStore) -> CmpOrdering {
    dominant_share(&a.user, usage, store)
        .total_cmp(&dominant_share(&b.user, usage, store))
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.submit_time_ms.cmp(&b.submit_time_ms))
        .then_with(|| a.id.cmp(&b.id))
}

fn within_constraints(request: &Resources, shared: &Shared) -> bool {
    let constraints = &shared.config.task_constraints;
    request.cpus <= constraints.cpus && request.mem <= constraints.memory_mb
}

fn run_time_ms(job: &Job) -> u64 {
    job.sim_run_time_ms().or(job.expected_runtime_ms).unwrap_or(DEFAULT_RUN_TIME_MS)
}

/// Record and start one attempt of `job` on `offer`. Returns whether it launched.
fn launch(shared: &Shared, job: &Job, offer: &Offer, now_ms: u64) -> bool {
    let task_id = format!("{}-{}", job.id, shared.store.attempts(&job.id));
    let instance = TaskInstance {
        task_id: task_id.clone(),
        job_id: job.id.clone(),
        hostname: offer.hostname.clone(),
        slave_id: offer.slave_id.clone(),
        scheduled_at_ms: None,
        start_time_ms: now_ms,
        end_time_ms: None,
        status: kiln_sim::InstanceStatus::Running,
        reason: None,
    };
    if let Err(e) = shared.store.record_launch(instance) {
        warn!(job_id = %job.id, error = %e, "failed to record launch");
        return false;
    }

    let request = LaunchRequest {
        task_id,
        hostname: offer.hostname.clone(),
        resources: job.resources,
        run_time_ms: run_time_ms(job),
        max_runtime_ms: job.max_runtime_ms,
        status: job.sim_status(),
    };
    if let Err(e) = shared.cluster.launch(request, now_ms) {
        // The store already counts the task as running; the next running-set check
        // will surface the disagreement.
        warn!(job_id = %job.id, error = %e, "cluster refused launch");
        return false;
    }
    SchedulerStats::bump(&shared.stats.launched);
    true
}
