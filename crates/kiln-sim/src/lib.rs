//! Deterministic replay harness for a phase-signalled batch scheduler.
//!
//! A [`Simulator`] replays a recorded job trace against a scheduler whose phases
//! (completion, rank, optimize, offer, match, rebalance) each listen on their own
//! channel. Time is a [`kiln_time::SimulatedClock`] the simulator freezes and bumps,
//! and every phase is acknowledged before the next one starts, so two runs of the same
//! trace produce equivalent schedules.
//!
//! # Example
//!
//! ```ignore
//! let (triggers, receivers) = kiln_sim::phase_channels();
//! // hand `receivers` and a clone of `clock` to the scheduler under test...
//! let sim = Simulator::new(store, cluster, triggers, clock);
//! let records = sim.simulate(&hosts, trace, &SimConfig::with_cycle_step_ms(1_000), None).await?;
//! kiln_sim::write_rows(Path::new("out.csv"), &kiln_sim::to_rows(&records))?;
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod harness;
pub mod incremental;
pub mod phase;
pub mod poller;
pub mod trace;
pub mod traits;
pub mod types;
pub mod verified;

pub use config::MatchingConfig;
pub use config::OptimizerConfig;
pub use config::PollOptions;
pub use config::RebalancerConfig;
pub use config::SchedulerConfig;
pub use config::SimConfig;
pub use config::TaskConstraints;
pub use error::Result;
pub use error::SimError;
pub use error::StoreError;
pub use harness::ReclaimHook;
pub use harness::Simulator;
pub use incremental::IncrementalTraceWriter;
pub use incremental::IncrementalWriterHandle;
pub use phase::Phase;
pub use phase::PhaseAck;
pub use phase::PhaseReceivers;
pub use phase::PhaseTriggers;
pub use phase::phase_channels;
pub use poller::ConvergencePoller;
pub use trace::ReducedJob;
pub use trace::TraceComparison;
pub use trace::TraceDiff;
pub use trace::TraceRow;
pub use trace::TraceSide;
pub use trace::append_rows;
pub use trace::equivalent;
pub use trace::equivalent_records;
pub use trace::read_rows;
pub use trace::to_row;
pub use trace::to_rows;
pub use trace::write_rows;
pub use traits::ClusterView;
pub use traits::JobStore;
pub use types::Host;
pub use types::InstanceStatus;
pub use types::IntendedStatus;
pub use types::Job;
pub use types::JobState;
pub use types::Resources;
pub use types::Share;
pub use types::TaskInstance;
pub use types::TaskRecord;
