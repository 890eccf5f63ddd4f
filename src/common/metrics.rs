//! Process-global counters exposed through the admin /metrics endpoint

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

#[derive(Default)]
pub struct Metrics {
    pub rpcs_total: AtomicU64,
    pub mutators_failed: AtomicU64,
    pub votes_committed: AtomicU64,
    pub votes_aborted: AtomicU64,
    pub votes_stopped: AtomicU64,
    pub jobs_enqueued: AtomicU64,
    pub jobs_absorbed: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_dead: AtomicU64,
    pub primary_elections: AtomicU64,
    queue_depth: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the observed queue depth for a target storage.
    pub fn observe_queue_depth(&self, storage: &str, depth: u64) {
        self.queue_depth
            .lock()
            .unwrap()
            .insert(storage.to_string(), depth);
    }

    pub fn queue_depths(&self) -> HashMap<String, u64> {
        self.queue_depth.lock().unwrap().clone()
    }

    /// Render in Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("helmsman_rpcs_total", &self.rpcs_total),
            ("helmsman_mutators_failed_total", &self.mutators_failed),
            ("helmsman_votes_committed_total", &self.votes_committed),
            ("helmsman_votes_aborted_total", &self.votes_aborted),
            ("helmsman_votes_stopped_total", &self.votes_stopped),
            ("helmsman_replication_jobs_enqueued_total", &self.jobs_enqueued),
            ("helmsman_replication_jobs_absorbed_total", &self.jobs_absorbed),
            ("helmsman_replication_jobs_completed_total", &self.jobs_completed),
            ("helmsman_replication_jobs_dead_total", &self.jobs_dead),
            ("helmsman_primary_elections_total", &self.primary_elections),
        ];
        for (name, counter) in counters {
            out += &format!("{} {}\n", name, counter.load(Ordering::Relaxed));
        }

        let mut depths: Vec<(String, u64)> = self.queue_depths().into_iter().collect();
        depths.sort();
        for (storage, depth) in depths {
            out += &format!(
                "helmsman_replication_queue_depth{{storage=\"{}\"}} {}\n",
                storage, depth
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.rpcs_total);
        Metrics::incr(&metrics.rpcs_total);
        metrics.observe_queue_depth("st-1", 7);

        let out = metrics.render();
        assert!(out.contains("helmsman_rpcs_total 2\n"));
        assert!(out.contains("helmsman_replication_queue_depth{storage=\"st-1\"} 7\n"));
    }
}
