use std::collections::BTreeMap;
use std::collections::VecDeque;

/// Per-call-site rolling latency window.
///
/// Stages self-report their timing without external instrumentation: each
/// tick records one sample, and the exported last/avg/max plus the count of
/// samples above a threshold travel in the snapshot's `metrics` map.
#[derive(Debug)]
pub struct PerfCounter {
    window: VecDeque<f64>,
    keep: usize,
    threshold_ms: f64,
    over_threshold: u64,
    total: u64,
}

impl PerfCounter {
    pub fn new(keep: usize, threshold_ms: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(keep),
            keep: keep.max(1),
            threshold_ms,
            over_threshold: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, ms: f64) {
        if self.window.len() == self.keep {
            self.window.pop_front();
        }
        self.window.push_back(ms);
        self.total += 1;
        if ms > self.threshold_ms {
            self.over_threshold += 1;
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.window.back().copied()
    }

    pub fn avg(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.window.iter().copied().fold(None, |acc, v| {
            Some(acc.map_or(v, |m: f64| m.max(v)))
        })
    }

    pub fn over_threshold(&self) -> u64 {
        self.over_threshold
    }

    /// Write the window stats into a metrics map under `<prefix>_ms{,_avg,_max,_over}`.
    pub fn export(&self, prefix: &str, metrics: &mut BTreeMap<String, f64>) {
        if let Some(last) = self.last() {
            metrics.insert(format!("{prefix}_ms"), last);
        }
        if let Some(avg) = self.avg() {
            metrics.insert(format!("{prefix}_ms_avg"), avg);
        }
        if let Some(max) = self.max() {
            metrics.insert(format!("{prefix}_ms_max"), max);
        }
        metrics.insert(format!("{prefix}_ms_over"), self.over_threshold as f64);
        metrics.insert(format!("{prefix}_ticks"), self.total as f64);
    }
}
