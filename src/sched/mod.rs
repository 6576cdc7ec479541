// sched/mod.rs
//
// Halcyon Galactic scheduler (single logical CPU, cooperative with a
// preemptive tick hook)
// - 32-level priority run queues, highest first, round robin per level
// - quantum accounting feeds the per-strand Galactic prediction pairs
// - priority deltas come out of the prediction feedback accumulator
// - expired lends are cleared by the realm before every dispatch

#![allow(clippy::module_name_repetitions)]

pub mod galactic;

use alloc::collections::VecDeque;

use crate::fixed::Fx;
use crate::strand::StrandId;
use galactic::GalacticStats;

pub const PRIORITY_LEVELS: usize = 32;
pub const PRIORITY_MIN: u8 = 0;
pub const PRIORITY_MAX: u8 = PRIORITY_LEVELS as u8 - 1;
pub const DEFAULT_PRIORITY: u8 = 16;
pub const DEFAULT_QUANTUM_TICKS: u64 = 10;
/// Forward-prediction interval, in ticks.
pub const DEFAULT_HORIZON_TICKS: i64 = 4;

pub struct GalacticScheduler {
    queues: [VecDeque<StrandId>; PRIORITY_LEVELS],
    pub quantum_ticks: u64,
    pub horizon: Fx,
    /// Exec-time target the feedback loop steers each strand toward.
    pub target_exec: Fx,
    pub decisions: u64,
    pub adjustments: u64,
}

impl GalacticScheduler {
    pub fn new() -> GalacticScheduler {
        GalacticScheduler {
            queues: core::array::from_fn(|_| VecDeque::new()),
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            horizon: Fx::from_int(DEFAULT_HORIZON_TICKS),
            target_exec: Fx::from_int(DEFAULT_QUANTUM_TICKS as i64),
            decisions: 0,
            adjustments: 0,
        }
    }

    #[inline]
    fn level(priority: u8) -> usize {
        priority.min(PRIORITY_MAX) as usize
    }

    pub fn enqueue(&mut self, id: StrandId, priority: u8) {
        self.queues[Self::level(priority)].push_back(id);
    }

    /// Drop a strand from whatever level it sits in (blocking, kill).
    pub fn remove(&mut self, id: StrandId) {
        for queue in self.queues.iter_mut() {
            queue.retain(|&q| q != id);
        }
    }

    /// Highest-priority runnable, round robin within the level.
    pub fn pick_next(&mut self) -> Option<StrandId> {
        self.decisions += 1;
        for queue in self.queues.iter_mut().rev() {
            if let Some(id) = queue.pop_front() {
                return Some(id);
            }
        }
        None
    }

    pub fn runnable(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn contains(&self, id: StrandId) -> bool {
        self.queues.iter().any(|q| q.contains(&id))
    }

    /// Quantum-end bookkeeping for one strand: feed the observation,
    /// adapt the learning rate, and return the clamped new priority.
    pub fn quantum_end(
        &mut self,
        stats: &mut GalacticStats,
        priority: u8,
        actual_ticks: u64,
        waited_ticks: u64,
        response_ticks: u64,
    ) -> u8 {
        stats.quantum_end(actual_ticks, self.quantum_ticks, waited_ticks, response_ticks);
        stats.adapt_learning_rate();
        let delta = stats.compute_priority_delta(self.target_exec, self.horizon);
        if delta == 0 {
            return priority;
        }
        self.adjustments += 1;
        let adjusted = (priority as i64 + delta)
            .clamp(PRIORITY_MIN as i64, PRIORITY_MAX as i64);
        adjusted as u8
    }
}

impl Default for GalacticScheduler {
    fn default() -> Self {
        GalacticScheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_priority_first() {
        let mut sched = GalacticScheduler::new();
        sched.enqueue(StrandId(1), 5);
        sched.enqueue(StrandId(2), 20);
        sched.enqueue(StrandId(3), 20);

        assert_eq!(sched.pick_next(), Some(StrandId(2)));
        assert_eq!(sched.pick_next(), Some(StrandId(3)));
        assert_eq!(sched.pick_next(), Some(StrandId(1)));
        assert_eq!(sched.pick_next(), None);
    }

    #[test]
    fn remove_pulls_from_any_level() {
        let mut sched = GalacticScheduler::new();
        sched.enqueue(StrandId(1), 4);
        sched.enqueue(StrandId(2), 4);
        sched.remove(StrandId(1));
        assert!(!sched.contains(StrandId(1)));
        assert_eq!(sched.runnable(), 1);
        assert_eq!(sched.pick_next(), Some(StrandId(2)));
    }

    #[test]
    fn quantum_end_clamps_adjustments() {
        let mut sched = GalacticScheduler::new();
        let mut stats = GalacticStats::new();
        // flat history: priority unchanged
        let p = sched.quantum_end(&mut stats, 16, 10, 0, 0);
        assert_eq!(p, 16);

        // force an aggressive negative accumulator and verify clamping
        stats.accumulator = Fx::from_int(-100);
        stats.velocity = Fx::ZERO;
        stats.exec_time.tangent = Fx::ONE;
        stats.exec_time.value = Fx::from_int(100);
        let p = sched.quantum_end(&mut stats, 1, 10, 0, 0);
        assert_eq!(p, PRIORITY_MIN);
        assert!(sched.adjustments >= 1);
    }

    #[test]
    fn priority_levels_cover_the_u8_range() {
        let mut sched = GalacticScheduler::new();
        sched.enqueue(StrandId(9), 200); // clamped to the top level
        assert_eq!(sched.pick_next(), Some(StrandId(9)));
    }
}
