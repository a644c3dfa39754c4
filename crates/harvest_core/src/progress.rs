use std::time::Duration;

/// Linearly extrapolates the remaining run time from the completion rate.
///
/// Returns `None` until at least one item has completed, or once the run is
/// done. Callers invoke this on a completion-count cadence rather than per
/// item to bound logging volume.
pub fn estimate_remaining(completed: usize, total: usize, elapsed: Duration) -> Option<Duration> {
    if completed == 0 || completed >= total {
        return None;
    }
    let per_item = elapsed.as_secs_f64() / completed as f64;
    let remaining = total - completed;
    Some(Duration::from_secs_f64(per_item * remaining as f64))
}
