//! Fleet-wide counters, shared by every queue in a `DatabaseQueueManager`.

use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DqmStatsSnapshot {
    pub total_timeouts: u64,
    pub total_queries: u64,
    pub queue_depth_peak: u64,
}

#[derive(Default)]
struct Counters {
    total_timeouts: u64,
    total_queries: u64,
    queue_depth_peak: u64,
}

/// All mutations go through the single `counters` lock, matching the "all
/// mutations of dqm_stats are under an internal stats lock" invariant.
#[derive(Default)]
pub struct DqmStats {
    counters: Mutex<Counters>,
}

impl DqmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_timeout(&self) {
        let mut counters = self.counters.lock().expect("stats mutex poisoned");
        counters.total_timeouts += 1;
    }

    pub fn record_query(&self) {
        let mut counters = self.counters.lock().expect("stats mutex poisoned");
        counters.total_queries += 1;
    }

    pub fn observe_queue_depth(&self, depth: u64) {
        let mut counters = self.counters.lock().expect("stats mutex poisoned");
        if depth > counters.queue_depth_peak {
            counters.queue_depth_peak = depth;
        }
    }

    pub fn snapshot(&self) -> DqmStatsSnapshot {
        let counters = self.counters.lock().expect("stats mutex poisoned");
        DqmStatsSnapshot {
            total_timeouts: counters.total_timeouts,
            total_queries: counters.total_queries,
            queue_depth_peak: counters.queue_depth_peak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn record_timeout_accumulates() {
        let stats = DqmStats::new();
        stats.record_timeout();
        stats.record_timeout();
        stats.record_timeout();
        assert_eq!(stats.snapshot().total_timeouts, 3);
    }

    #[test]
    fn concurrent_record_timeout_from_many_threads_is_exact() {
        let stats = Arc::new(DqmStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..125 {
                        stats.record_timeout();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("worker thread panicked");
        }
        assert_eq!(stats.snapshot().total_timeouts, 1000);
    }

    #[test]
    fn queue_depth_peak_tracks_the_maximum_observed() {
        let stats = DqmStats::new();
        stats.observe_queue_depth(3);
        stats.observe_queue_depth(7);
        stats.observe_queue_depth(2);
        assert_eq!(stats.snapshot().queue_depth_peak, 7);
    }
}
