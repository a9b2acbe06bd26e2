//! Scaling and remediation decision primitives.
//!
//! This library holds the pure parts of fleet reconciliation: computing the
//! diff between a desired and an actual replica count, picking ids for new
//! and removed replicas, and bounding automatic restarts.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs
//! - Id selection never reuses an id that is still held by a live replica
//! - Restart accounting is bounded by a rolling time window

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// The action a scaling request implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Create this many new replicas.
    Up(u32),
    /// Remove this many replicas.
    Down(u32),
    /// Already at the target; nothing to do.
    None,
}

/// Compute the scaling action for a desired vs. actual count.
pub fn scale_delta(desired: u32, current: u32) -> ScaleAction {
    use std::cmp::Ordering;
    match desired.cmp(&current) {
        Ordering::Greater => ScaleAction::Up(desired - current),
        Ordering::Less => ScaleAction::Down(current - desired),
        Ordering::Equal => ScaleAction::None,
    }
}

/// Mint `count` new replica ids above the highest live id.
///
/// Ids are dense integers starting at 1. Gaps left by replicas that are
/// still held (for example a `Failed` replica kept for inspection) are
/// never refilled; new ids always continue above the current maximum.
pub fn next_replica_ids(live: impl IntoIterator<Item = u32>, count: u32) -> Vec<u32> {
    let max = live.into_iter().max().unwrap_or(0);
    (max + 1..=max + count).collect()
}

/// Select the replicas to remove when scaling down.
///
/// Policy: fill from the top. The highest-numbered ids are removed first so
/// that low ids, which are the longest-lived and most likely to be bound to
/// external identity or reward tracking, are preserved preferentially.
/// Returned ids are sorted descending (first to remove first).
pub fn select_for_removal(live: impl IntoIterator<Item = u32>, count: u32) -> Vec<u32> {
    let mut ids: Vec<u32> = live.into_iter().collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.truncate(count as usize);
    ids
}

/// Rolling-window restart accounting for a set of replicas.
///
/// A replica that has to be restarted more than `ceiling` times within
/// `window` has stopped being a transient problem; the caller is expected
/// to park it instead of restarting again.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    ceiling: u32,
    window: Duration,
    restarts: BTreeMap<u32, (u32, Instant)>,
}

impl RestartTracker {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            ceiling,
            window,
            restarts: BTreeMap::new(),
        }
    }

    /// Record a restart for a replica.
    ///
    /// Returns true if the ceiling is now exceeded within the window.
    pub fn record(&mut self, replica_id: u32) -> bool {
        let now = Instant::now();
        let (count, first) = self.restarts.entry(replica_id).or_insert((0, now));

        // Reset accounting once the window has rolled past
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.ceiling
    }

    /// Whether a replica has exhausted its restart budget.
    pub fn is_exhausted(&self, replica_id: u32) -> bool {
        let Some((count, first)) = self.restarts.get(&replica_id) else {
            return false;
        };
        if first.elapsed() > self.window {
            return false;
        }
        *count > self.ceiling
    }

    /// Forget a replica entirely (fleet reset or record deletion).
    pub fn clear(&mut self, replica_id: u32) {
        self.restarts.remove(&replica_id);
    }

    /// Drop entries whose window has expired.
    pub fn prune(&mut self) {
        let window = self.window;
        self.restarts
            .retain(|_, (_, first)| first.elapsed() <= window);
    }
}

/// Default restart ceiling within the rolling window.
pub const DEFAULT_RESTART_CEILING: u32 = 10;

/// Default rolling window for restart accounting.
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60 * 60);
