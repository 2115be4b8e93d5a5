//! Cycle-level decisions: batch selection, ordering checks, interval triggers.

/// Length of the contiguous head of `submit_times` due at `now_ms`.
///
/// Stops at the first submit time after `now_ms`; later entries are left for a
/// future cycle even if they are (wrongly) earlier.
///
/// # Example
///
/// ```
/// use kiln_sim::verified::due_batch_len;
///
/// assert_eq!(due_batch_len([10, 20, 30, 15].into_iter(), 20), 2);
/// assert_eq!(due_batch_len([10, 20].into_iter(), 5), 0);
/// ```
#[inline]
pub fn due_batch_len(submit_times: impl Iterator<Item = u64>, now_ms: u64) -> usize {
    submit_times.take_while(|t| *t <= now_ms).count()
}

/// Submit times that are smaller than their predecessor, at most `limit` of them.
///
/// An empty result means the sequence is non-decreasing.
///
/// # Example
///
/// ```
/// use kiln_sim::verified::ordering_violations;
///
/// assert!(ordering_violations(&[1, 1, 2, 5], 100).is_empty());
/// assert_eq!(ordering_violations(&[5, 3, 4, 1], 100), vec![3, 1]);
/// ```
pub fn ordering_violations(submit_times: &[u64], limit: usize) -> Vec<u64> {
    submit_times
        .windows(2)
        .filter(|pair| pair[1] < pair[0])
        .map(|pair| pair[1])
        .take(limit)
        .collect()
}

/// Instant to freeze the clock at for a cycle whose nominal instant is `nominal_ms`.
///
/// The first cycle freezes at its nominal instant. Later cycles never move the clock
/// backwards, even when submission bumps in the previous cycle ran past `nominal_ms`.
#[inline]
pub fn cycle_instant_ms(nominal_ms: u64, previous_ms: Option<u64>) -> u64 {
    match previous_ms {
        None => nominal_ms,
        Some(previous) => nominal_ms.max(previous.saturating_add(1)),
    }
}

/// Outcome of advancing an interval accumulator by one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalDecision {
    /// Whether the periodic phase fires this cycle.
    pub fire: bool,
    /// Accumulated time to carry into the next cycle.
    pub elapsed_ms: u64,
}

/// Advance an accumulator for a phase that runs every `interval_ms`.
///
/// Fires when the accumulated time strictly exceeds the interval, then resets to 0;
/// otherwise adds one cycle step.
///
/// # Example
///
/// ```
/// use kiln_sim::verified::advance_interval;
///
/// let d = advance_interval(0, 10, 15);
/// assert!(!d.fire);
/// assert_eq!(d.elapsed_ms, 10);
///
/// let d = advance_interval(20, 10, 15);
/// assert!(d.fire);
/// assert_eq!(d.elapsed_ms, 0);
/// ```
#[inline]
pub fn advance_interval(elapsed_ms: u64, step_ms: u64, interval_ms: u64) -> IntervalDecision {
    if elapsed_ms > interval_ms {
        IntervalDecision {
            fire: true,
            elapsed_ms: 0,
        }
    } else {
        IntervalDecision {
            fire: false,
            elapsed_ms: elapsed_ms.saturating_add(step_ms),
        }
    }
}

/// Whether a uniform `sample` in `[0, 1)` selects an event of `probability`.
#[inline]
pub fn should_reclaim(sample: f64, probability: f64) -> bool {
    sample < probability
}

/// Whether the cycle loop should keep going.
///
/// Runs while submissions remain, then while the store still has unfinished jobs, and
/// never past `max_cycles` when one is configured.
#[inline]
pub fn should_continue(trace_remaining: usize, unfinished_jobs: bool, cycles_run: u64, max_cycles: Option<u64>) -> bool {
    if max_cycles.is_some_and(|max| cycles_run >= max) {
        return false;
    }
    trace_remaining > 0 || unfinished_jobs
}
