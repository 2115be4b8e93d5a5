//! Poll bounds and set-difference diagnostics.

use std::collections::BTreeSet;

/// Number of predicate evaluations a poll may make.
///
/// One evaluation up front plus one per elapsed interval within the timeout.
#[inline]
pub fn max_poll_attempts(interval_ms: u64, timeout_ms: u64) -> u64 {
    match interval_ms {
        0 => 1,
        interval => (timeout_ms / interval).saturating_add(1),
    }
}

/// Elements only in `left` and elements only in `right`.
pub fn set_differences<T: Ord + Clone>(left: &BTreeSet<T>, right: &BTreeSet<T>) -> (Vec<T>, Vec<T>) {
    (
        left.difference(right).cloned().collect(),
        right.difference(left).cloned().collect(),
    )
}

/// Human-readable comparison of two id sets, listing at most `limit` ids per side.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
/// use kiln_sim::verified::describe_set_mismatch;
///
/// let store: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
/// let cluster: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
/// assert_eq!(
///     describe_set_mismatch("store", &store, "cluster", &cluster, 10),
///     "store has 2, cluster has 2; only in store: [a]; only in cluster: [c]"
/// );
/// ```
pub fn describe_set_mismatch(
    left_name: &str,
    left: &BTreeSet<String>,
    right_name: &str,
    right: &BTreeSet<String>,
    limit: usize,
) -> String {
    let (only_left, only_right) = set_differences(left, right);
    format!(
        "{left_name} has {}, {right_name} has {}; only in {left_name}: [{}]; only in {right_name}: [{}]",
        left.len(),
        right.len(),
        truncated_list(&only_left, limit),
        truncated_list(&only_right, limit),
    )
}

fn truncated_list(ids: &[String], limit: usize) -> String {
    let mut listed = ids.iter().take(limit).cloned().collect::<Vec<_>>().join(", ");
    if ids.len() > limit {
        listed.push_str(&format!(", ... {} more", ids.len() - limit));
    }
    listed
}
