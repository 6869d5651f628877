//! Per-query accounting: recall against ground truth, then QPS and work
//! averages appended to a CSV.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use windowed_distance::{Candidate, Label, LayerRange};

/// Fraction of the `k` true neighbors present in `results`.
pub fn recall_at_k(truth: &[Label], k: usize, results: &[Candidate]) -> f64 {
    let k = k.min(truth.len());
    if k == 0 {
        return 0.0;
    }
    let hits = results
        .iter()
        .filter(|c| truth.contains(&c.label))
        .count();
    hits as f64 / k as f64
}

#[derive(Default)]
pub struct RecallStats {
    total_time: f64,
    total_recall: f64,
    total_dist: f64,
    total_hops: f64,
    queries: usize,
}

impl RecallStats {
    pub fn step(&mut self, time: f64, dist: usize, hops: usize, recall: f64) {
        self.total_time += time;
        self.total_dist += dist as f64;
        self.total_hops += hops as f64;
        self.total_recall += recall;
        self.queries += 1;
    }

    /// Appends `ef,recall,qps,dist,hops,layer_lo,layer_hi` to `output` and
    /// logs the same summary.
    pub fn dump(&self, output: &Path, ef: usize, layers: LayerRange) -> Result<()> {
        if self.queries == 0 {
            tracing::warn!("no queries ran");
            return Ok(());
        }
        let n = self.queries as f64;
        let qps = n / self.total_time;
        let recall = self.total_recall / n;
        let dist = self.total_dist / n;
        let hops = self.total_hops / n;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output)
            .with_context(|| format!("open {}", output.display()))?;
        writeln!(
            out,
            "{},{:.6},{:.6},{:.6},{:.6},{},{}",
            ef, recall, qps, dist, hops, layers.lower, layers.upper
        )?;
        tracing::info!(
            ef,
            recall,
            qps,
            avg_dist = dist,
            avg_hops = hops,
            layer_lo = layers.lower,
            layer_hi = layers.upper,
            "sweep point"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recall_counts_hits_against_truth() {
        let truth = [Label(1), Label(2), Label(3)];
        let results = [
            Candidate::new(0.1, Label(2)),
            Candidate::new(0.2, Label(9)),
            Candidate::new(0.3, Label(3)),
        ];
        let recall = recall_at_k(&truth, 3, &results);
        assert!((recall - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn recall_caps_k_at_truth_length() {
        let truth = [Label(5)];
        let results = [Candidate::new(0.1, Label(5))];
        assert_eq!(recall_at_k(&truth, 10, &results), 1.0);
    }
}
