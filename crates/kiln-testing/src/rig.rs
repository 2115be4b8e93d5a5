//! Everything needed for one end-to-end replay, wired together.

use std::path::Path;
use std::sync::Arc;

use kiln_sim::Host;
use kiln_sim::Job;
use kiln_sim::Result;
use kiln_sim::SimConfig;
use kiln_sim::Simulator;
use kiln_sim::TaskRecord;
use kiln_sim::phase_channels;
use kiln_time::SimulatedClock;

use crate::cluster::MockCluster;
use crate::scheduler::ReferenceScheduler;
use crate::store::InMemoryJobStore;

/// A fresh store, cluster, reference scheduler and simulator sharing one clock.
pub struct ReplayRig {
    /// Backing store.
    pub store: Arc<InMemoryJobStore>,
    /// Mock cluster.
    pub cluster: Arc<MockCluster>,
    /// Scheduler under test.
    pub scheduler: ReferenceScheduler,
    /// Harness.
    pub simulator: Simulator,
}

impl ReplayRig {
    /// Build a rig whose scheduler uses `config.scheduler`. Needs a tokio runtime.
    pub fn new(config: &SimConfig) -> Self {
        let clock = SimulatedClock::new(0);
        let store = Arc::new(InMemoryJobStore::new());
        let cluster = Arc::new(MockCluster::new());
        let (triggers, receivers) = phase_channels();
        let scheduler = ReferenceScheduler::spawn(
            Arc::clone(&store),
            Arc::clone(&cluster),
            receivers,
            clock.clone(),
            config.scheduler.clone(),
        );
        let simulator = Simulator::new(store.clone(), cluster.clone(), triggers, clock);
        Self {
            store,
            cluster,
            scheduler,
            simulator,
        }
    }

    /// Replay `trace` and stop the scheduler afterwards, whatever the outcome.
    pub async fn run(
        self,
        hosts: &[Host],
        trace: Vec<Job>,
        config: &SimConfig,
        incremental_output: Option<&Path>,
    ) -> Result<Vec<TaskRecord>> {
        let outcome = self.simulator.simulate(hosts, trace, config, incremental_output).await;
        self.scheduler.shutdown().await;
        outcome
    }
}
