//! The replay loop.
//!
//! [`Simulator::simulate`] drives the scheduler under test one discrete time step at a
//! time. Each cycle:
//!
//! 1. freezes the shared clock at the cycle instant,
//! 2. takes the due head of the trace and checks it is sorted,
//! 3. submits it, bumping the clock between submissions,
//! 4. waits until the last submission is visible in the store,
//! 5. signals *completion*,
//! 6. waits until the store and the cluster agree on the running task set,
//! 7. signals *rank*,
//! 8. signals *optimize* when its interval has elapsed,
//! 9. signals *offer* and *match*, then waits until every running task is confirmed,
//! 10. signals *rebalance* when its interval has elapsed,
//! 11. occasionally requests memory reclamation,
//! 12. advances nominal time by one step.
//!
//! Once the trace is drained the loop keeps cycling while the store still has
//! unfinished jobs, bounded by `max_cycles` when configured.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use kiln_time::Clock;
use kiln_time::SimulatedClock;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::SimConfig;
use crate::constants::CLOCK_BUMP_MS;
use crate::constants::MAX_DIAGNOSTIC_IDS;
use crate::constants::MAX_ORDERING_VIOLATIONS_REPORTED;
use crate::error::OrderingViolationSnafu;
use crate::error::Result;
use crate::error::SimError;
use crate::incremental::IncrementalTraceWriter;
use crate::phase::Phase;
use crate::phase::PhaseTriggers;
use crate::poller::ConvergencePoller;
use crate::traits::ClusterView;
use crate::traits::JobStore;
use crate::types::Host;
use crate::types::Job;
use crate::types::TaskRecord;
use crate::verified::advance_interval;
use crate::verified::cycle_instant_ms;
use crate::verified::describe_set_mismatch;
use crate::verified::due_batch_len;
use crate::verified::ordering_violations;
use crate::verified::should_continue;
use crate::verified::should_reclaim;

/// Callback invoked when a cycle samples a memory reclamation request.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Drives a phase-signalled scheduler through a recorded trace.
pub struct Simulator {
    store: Arc<dyn JobStore>,
    cluster: Arc<dyn ClusterView>,
    triggers: PhaseTriggers,
    clock: SimulatedClock,
    reclaim_hook: Option<ReclaimHook>,
}

/// Loop state carried between cycles.
#[derive(Debug, Default)]
struct CycleState {
    nominal_ms: u64,
    previous_instant_ms: Option<u64>,
    optimizer_elapsed_ms: u64,
    rebalance_elapsed_ms: u64,
    cycles_run: u64,
}

impl Simulator {
    /// Create a simulator.
    ///
    /// `clock` must be the same clock the scheduler under test reads; the simulator is
    /// its only writer.
    pub fn new(
        store: Arc<dyn JobStore>,
        cluster: Arc<dyn ClusterView>,
        triggers: PhaseTriggers,
        clock: SimulatedClock,
    ) -> Self {
        Self {
            store,
            cluster,
            triggers,
            clock,
            reclaim_hook: None,
        }
    }

    /// Run `hook` whenever a cycle samples a reclamation request.
    pub fn with_reclaim_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.reclaim_hook = Some(Arc::new(hook));
        self
    }

    /// The clock this simulator drives.
    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    /// Replay `trace` against the scheduler and return every task record in the store.
    ///
    /// `trace` must be sorted by submit time. Any poll timeout, ordering violation or
    /// closed phase channel aborts the run. When `incremental_output` is given, a
    /// background writer appends finished rows to it while the run progresses; it is
    /// stopped before this returns, on success and on error.
    #[instrument(skip_all, fields(hosts = hosts.len(), jobs = trace.len()))]
    pub async fn simulate(
        &self,
        hosts: &[Host],
        trace: Vec<Job>,
        config: &SimConfig,
        incremental_output: Option<&Path>,
    ) -> Result<Vec<TaskRecord>> {
        let step_ms = config.validate()?;

        self.cluster.register_hosts(hosts).await?;
        self.store.set_shares(&config.shares).await?;

        let writer = incremental_output.map(|path| {
            IncrementalTraceWriter::new(Arc::clone(&self.store), path, config.time_ms_between_incremental_output)
                .with_clock(Arc::new(self.clock.clone()))
                .spawn()
        });

        let outcome = self.run_cycles(trace, config, step_ms).await;

        if let Some(writer) = writer {
            writer.shutdown().await;
        }
        let cycles = outcome?;

        let records = self.store.task_records().await?;
        info!(cycles, records = records.len(), "simulation finished");
        Ok(records)
    }

    async fn run_cycles(&self, trace: Vec<Job>, config: &SimConfig, step_ms: u64) -> Result<u64> {
        let poller = ConvergencePoller::new(config.poll);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut state = CycleState {
            nominal_ms: trace.iter().map(|job| job.submit_time_ms).min().unwrap_or(0),
            ..CycleState::default()
        };
        let mut trace: VecDeque<Job> = trace.into();

        info!(start_ms = state.nominal_ms, step_ms, "starting replay");

        loop {
            let unfinished = trace.is_empty() && self.store.has_unfinished_jobs().await?;
            if !should_continue(trace.len(), unfinished, state.cycles_run, config.max_cycles) {
                if !trace.is_empty() || unfinished {
                    warn!(
                        cycles = state.cycles_run,
                        remaining = trace.len(),
                        unfinished,
                        "stopping at max_cycles with work outstanding"
                    );
                }
                break;
            }
            self.run_cycle(&mut state, &mut trace, config, step_ms, &poller, &mut rng).await?;
        }

        Ok(state.cycles_run)
    }

    async fn run_cycle(
        &self,
        state: &mut CycleState,
        trace: &mut VecDeque<Job>,
        config: &SimConfig,
        step_ms: u64,
        poller: &ConvergencePoller,
        rng: &mut StdRng,
    ) -> Result<()> {
        let instant_ms = cycle_instant_ms(state.nominal_ms, state.previous_instant_ms);
        self.clock.freeze(instant_ms);

        let due = due_batch_len(trace.iter().map(|job| job.submit_time_ms), state.nominal_ms);
        let batch: Vec<Job> = trace.drain(..due).collect();
        let submit_times: Vec<u64> = batch.iter().map(|job| job.submit_time_ms).collect();
        let offending = ordering_violations(&submit_times, MAX_ORDERING_VIOLATIONS_REPORTED);
        if !offending.is_empty() {
            return OrderingViolationSnafu { offending }.fail();
        }

        debug!(
            cycle = state.cycles_run,
            nominal_ms = state.nominal_ms,
            instant_ms,
            batch = batch.len(),
            "cycle started"
        );

        self.submit_batch(batch, poller).await?;

        self.clock.bump(CLOCK_BUMP_MS);
        self.triggers.trigger(Phase::Completion).await?;
        self.await_running_sets_agree(poller).await?;

        self.clock.bump(CLOCK_BUMP_MS);
        self.triggers.trigger(Phase::Rank).await?;

        let optimize = advance_interval(state.optimizer_elapsed_ms, step_ms, config.time_ms_between_optimizer_calls);
        if optimize.fire {
            self.triggers.trigger(Phase::Optimize).await?;
        }
        state.optimizer_elapsed_ms = optimize.elapsed_ms;

        self.clock.bump(CLOCK_BUMP_MS);
        self.triggers.trigger(Phase::Offer).await?;
        self.triggers.trigger(Phase::Match).await?;
        self.await_launches_confirmed(poller).await?;

        let rebalance = advance_interval(state.rebalance_elapsed_ms, step_ms, config.time_ms_between_rebalancing);
        if rebalance.fire {
            self.triggers.trigger(Phase::Rebalance).await?;
        }
        state.rebalance_elapsed_ms = rebalance.elapsed_ms;

        if should_reclaim(rng.random::<f64>(), config.reclaim_probability) {
            debug!(cycle = state.cycles_run, "requesting memory reclamation");
            if let Some(hook) = &self.reclaim_hook {
                hook();
            }
        }

        state.previous_instant_ms = Some(self.clock.now_ms());
        state.nominal_ms = state.nominal_ms.saturating_add(step_ms);
        state.cycles_run += 1;
        Ok(())
    }

    /// Submit jobs at distinct instants and wait for the last one to be visible.
    async fn submit_batch(&self, batch: Vec<Job>, poller: &ConvergencePoller) -> Result<()> {
        let mut last_submit_ms = None;
        for (index, mut job) in batch.into_iter().enumerate() {
            if index > 0 {
                self.clock.bump(CLOCK_BUMP_MS);
            }
            let submit_ms = self.clock.now_ms();
            job.submit_time_ms = submit_ms;
            debug!(job_id = %job.id, submit_ms, "submitting job");
            self.store.submit(job).await?;
            last_submit_ms = Some(submit_ms);
        }

        let Some(submit_ms) = last_submit_ms else {
            return Ok(());
        };
        let store = &self.store;
        poller
            .poll("submission visible", move || async move {
                store.submission_exists_at(submit_ms).await.map_err(SimError::from)
            })
            .await
    }

    async fn running_sets(&self) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let in_store = self.store.running_task_ids().await?;
        let in_cluster = self.cluster.running_task_ids().await?;
        Ok((in_store, in_cluster))
    }

    async fn await_running_sets_agree(&self, poller: &ConvergencePoller) -> Result<()> {
        poller
            .poll_with_diagnostics(
                "store and cluster agree on running tasks",
                move || async move {
                    let (in_store, in_cluster) = self.running_sets().await?;
                    Ok(in_store == in_cluster)
                },
                move || async move {
                    match self.running_sets().await {
                        Ok((in_store, in_cluster)) => {
                            describe_set_mismatch("store", &in_store, "cluster", &in_cluster, MAX_DIAGNOSTIC_IDS)
                        }
                        Err(e) => format!("running sets unavailable: {e}"),
                    }
                },
            )
            .await
    }

    async fn await_launches_confirmed(&self, poller: &ConvergencePoller) -> Result<()> {
        let store = &self.store;
        poller
            .poll_with_diagnostics(
                "running tasks confirmed",
                move || async move {
                    let running = store.running_instances().await?;
                    Ok(running.iter().all(|instance| instance.scheduled_at_ms.is_some()))
                },
                move || async move {
                    match store.running_instances().await {
                        Ok(running) => {
                            let unconfirmed: Vec<&str> = running
                                .iter()
                                .filter(|instance| instance.scheduled_at_ms.is_none())
                                .map(|instance| instance.task_id.as_str())
                                .take(MAX_DIAGNOSTIC_IDS)
                                .collect();
                            format!("{} running, unconfirmed: {unconfirmed:?}", running.len())
                        }
                        Err(e) => format!("running instances unavailable: {e}"),
                    }
                },
            )
            .await
    }
}
