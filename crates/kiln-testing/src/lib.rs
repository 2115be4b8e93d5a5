//! Test doubles for the kiln replay harness.
//!
//! [`InMemoryJobStore`] and [`MockCluster`] implement the harness's collaborator
//! traits; [`ReferenceScheduler`] is a minimal phase-signalled scheduler that reads the
//! shared simulated clock. [`ReplayRig`] wires all of them to a
//! [`kiln_sim::Simulator`].

pub mod cluster;
pub mod fixtures;
pub mod rig;
pub mod scheduler;
pub mod store;

pub use cluster::LaunchRequest;
pub use cluster::MockCluster;
pub use cluster::Offer;
pub use cluster::StatusUpdate;
pub use rig::ReplayRig;
pub use scheduler::ReferenceScheduler;
pub use scheduler::SchedulerStats;
pub use store::CompletionOutcome;
pub use store::InMemoryJobStore;
