//! Phase signalling between the harness and the scheduler under test.
//!
//! Each scheduler phase listens on its own channel. The harness posts a fresh
//! one-shot [`PhaseAck`] and then waits for the scheduler to fulfil it, which turns
//! independently running phase handlers into a strictly sequential pipeline.
//!
//! ```text
//!  Simulator                    scheduler under test
//!  ---------                    --------------------
//!  trigger(Rank) ── PhaseAck ──> rank handler
//!       │                           │ per-tick work
//!       ◄──────── complete() ───────┘
//!  trigger(Offer) ...
//! ```

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::constants::PHASE_CHANNEL_CAPACITY;
use crate::error::PhaseChannelClosedSnafu;
use crate::error::Result;

/// A sub-step of a scheduling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Process task completions reported by the cluster.
    Completion,
    /// Rank waiting jobs.
    Rank,
    /// Call the external optimizer.
    Optimize,
    /// Collect resource offers.
    Offer,
    /// Match ranked jobs to offers and launch them.
    Match,
    /// Preempt to restore fair share.
    Rebalance,
}

impl Phase {
    /// All phases, in cycle order.
    pub const ALL: [Phase; 6] = [
        Phase::Completion,
        Phase::Rank,
        Phase::Optimize,
        Phase::Offer,
        Phase::Match,
        Phase::Rebalance,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Completion => "completion",
            Phase::Rank => "rank",
            Phase::Optimize => "optimize",
            Phase::Offer => "offer",
            Phase::Match => "match",
            Phase::Rebalance => "rebalance",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot acknowledgement handle for a single phase tick.
///
/// Dropping it without calling [`complete`](Self::complete) makes the harness fail the
/// run with [`crate::SimError::PhaseChannelClosed`].
#[derive(Debug)]
pub struct PhaseAck {
    phase: Phase,
    done: oneshot::Sender<()>,
}

impl PhaseAck {
    /// Phase this acknowledgement belongs to.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Report that this phase's per-tick work is complete.
    pub fn complete(self) {
        // The harness may already have given up on the run.
        let _ = self.done.send(());
    }
}

/// Harness side: posts acknowledgements and waits for them.
#[derive(Debug, Clone)]
pub struct PhaseTriggers {
    completion: mpsc::Sender<PhaseAck>,
    rank: mpsc::Sender<PhaseAck>,
    optimize: mpsc::Sender<PhaseAck>,
    offer: mpsc::Sender<PhaseAck>,
    matching: mpsc::Sender<PhaseAck>,
    rebalance: mpsc::Sender<PhaseAck>,
}

impl PhaseTriggers {
    fn sender(&self, phase: Phase) -> &mpsc::Sender<PhaseAck> {
        match phase {
            Phase::Completion => &self.completion,
            Phase::Rank => &self.rank,
            Phase::Optimize => &self.optimize,
            Phase::Offer => &self.offer,
            Phase::Match => &self.matching,
            Phase::Rebalance => &self.rebalance,
        }
    }

    /// Signal `phase` and block until its handler fulfils the acknowledgement.
    pub async fn trigger(&self, phase: Phase) -> Result<()> {
        let (done, fulfilled) = oneshot::channel();
        debug!(%phase, "signalling phase");
        if self.sender(phase).send(PhaseAck { phase, done }).await.is_err() {
            return PhaseChannelClosedSnafu { phase }.fail();
        }
        if fulfilled.await.is_err() {
            return PhaseChannelClosedSnafu { phase }.fail();
        }
        debug!(%phase, "phase acknowledged");
        Ok(())
    }
}

/// Scheduler side: one receiver per phase.
#[derive(Debug)]
pub struct PhaseReceivers {
    /// Completion phase signals.
    pub completion: mpsc::Receiver<PhaseAck>,
    /// Rank phase signals.
    pub rank: mpsc::Receiver<PhaseAck>,
    /// Optimize phase signals.
    pub optimize: mpsc::Receiver<PhaseAck>,
    /// Offer phase signals.
    pub offer: mpsc::Receiver<PhaseAck>,
    /// Match phase signals.
    pub matching: mpsc::Receiver<PhaseAck>,
    /// Rebalance phase signals.
    pub rebalance: mpsc::Receiver<PhaseAck>,
}

/// Create the paired harness and scheduler ends of the phase channels.
pub fn phase_channels() -> (PhaseTriggers, PhaseReceivers) {
    let (completion_tx, completion_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
    let (rank_tx, rank_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
    let (optimize_tx, optimize_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
    let (offer_tx, offer_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
    let (matching_tx, matching_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);
    let (rebalance_tx, rebalance_rx) = mpsc::channel(PHASE_CHANNEL_CAPACITY);

    (
        PhaseTriggers {
            completion: completion_tx,
            rank: rank_tx,
            optimize: optimize_tx,
            offer: offer_tx,
            matching: matching_tx,
            rebalance: rebalance_tx,
        },
        PhaseReceivers {
            completion: completion_rx,
            rank: rank_rx,
            optimize: optimize_rx,
            offer: offer_rx,
            matching: matching_rx,
            rebalance: rebalance_rx,
        },
    )
}
