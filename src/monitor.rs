//! Speed monitor selection rules.
//!
//! The scan loop in the manager gathers a snapshot of running attempts and
//! hands it here; everything below is pure so the rules can be tested
//! without a network.

use crate::channel::select_channel;

/// What the monitor needs to know about one running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningSample {
    pub task_id: u64,
    pub speed_kbs: u64,
    pub age_ms: u64,
}

/// A running attempt chosen for demotion and the tier it should land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demotion {
    pub task_id: u64,
    pub speed_kbs: u64,
    pub channel: usize,
}

/// Rules applied on every scan cycle.
#[derive(Debug, Clone, Copy)]
pub struct DemotionPolicy {
    pub grace_ms: u64,
    pub max_per_scan: usize,
}

impl DemotionPolicy {
    /// Picks the attempts to demote this cycle, slowest first.
    ///
    /// Nothing is demoted while the intake queue is empty, and never more
    /// than `min(max_per_scan, pending_intake)` attempts.
    pub fn select(
        &self,
        running: &[RunningSample],
        channel_limits: &[u64],
        pending_intake: usize,
    ) -> Vec<Demotion> {
        if pending_intake == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<Demotion> = running
            .iter()
            .filter(|s| s.age_ms >= self.grace_ms)
            .filter_map(|s| {
                select_channel(channel_limits.iter().copied(), s.speed_kbs).map(|channel| {
                    Demotion {
                        task_id: s.task_id,
                        speed_kbs: s.speed_kbs,
                        channel,
                    }
                })
            })
            .collect();
        // Stable sort keeps snapshot order among equal speeds.
        candidates.sort_by_key(|d| d.speed_kbs);
        candidates.truncate(self.max_per_scan.min(pending_intake));
        candidates
    }
}
