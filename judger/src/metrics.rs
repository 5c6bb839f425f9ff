//! Observability port.
//!
//! Components receive an `Arc<dyn Metrics>` instead of touching a global
//! registry. [`MemoryMetrics`] keeps everything in process and renders a
//! text exposition for the `/metrics` endpoint; [`NoopMetrics`] discards
//! everything.

use std::{collections::VecDeque, fmt::Write};

use dashmap::DashMap;

pub const QUEUE_DEPTH: &str = "judge_queue_depth";
pub const JOBS_PROCESSED: &str = "judge_jobs_processed_total";
pub const JOB_DURATION_MS: &str = "judge_job_duration_ms";
pub const ACTIVE_SLOTS: &str = "judge_active_slots";
pub const JOB_RETRIES: &str = "judge_job_retries_total";

pub type Labels<'a> = &'a [(&'static str, &'a str)];

pub trait Metrics: Send + Sync {
    fn increment(&self, name: &'static str, labels: Labels, by: u64);
    fn observe(&self, name: &'static str, labels: Labels, value: f64);
    fn set(&self, name: &'static str, labels: Labels, value: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _: &'static str, _: Labels, _: u64) {}
    fn observe(&self, _: &'static str, _: Labels, _: f64) {}
    fn set(&self, _: &'static str, _: Labels, _: f64) {}
}

/// Number of most recent observations kept per histogram series.
const WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct Samples {
    recent: VecDeque<f64>,
    count: u64,
    sum: f64,
}

#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Samples>,
}

fn series(name: &str, labels: Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut s = format!("{}{{", name);
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        let _ = write!(s, "{}=\"{}\"", k, v.replace('"', "\\\""));
    }
    s.push('}');
    s
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: Labels) -> u64 {
        self.counters
            .get(&series(name, labels))
            .map_or(0, |v| *v.value())
    }

    pub fn gauge(&self, name: &str, labels: Labels) -> Option<f64> {
        self.gauges.get(&series(name, labels)).map(|v| *v.value())
    }

    /// Quantile `q` over the recent observations of a histogram series.
    pub fn quantile(&self, name: &str, labels: Labels, q: f64) -> Option<f64> {
        let entry = self.histograms.get(&series(name, labels))?;
        let mut sorted: Vec<f64> = entry.recent.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(quantile(&sorted, q))
    }

    /// Text exposition, one series per line, sorted by name.
    pub fn render(&self) -> String {
        let mut lines = vec![];
        for e in self.counters.iter() {
            lines.push(format!("{} {}", e.key(), e.value()));
        }
        for e in self.gauges.iter() {
            lines.push(format!("{} {}", e.key(), e.value()));
        }
        for e in self.histograms.iter() {
            let mut sorted: Vec<f64> = e.recent.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let (name, labels) = match e.key().split_once('{') {
                Some((n, rest)) => (n.to_string(), format!(",{}", rest.trim_end_matches('}'))),
                None => (e.key().clone(), String::new()),
            };
            for q in [0.5, 0.95, 0.99] {
                lines.push(format!(
                    "{}{{quantile=\"{}\"{}}} {}",
                    name,
                    q,
                    labels,
                    quantile(&sorted, q)
                ));
            }
            let suffix = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", &labels[1..])
            };
            lines.push(format!("{}_count{} {}", name, suffix, e.count));
            lines.push(format!("{}_sum{} {}", name, suffix, e.sum));
        }
        lines.sort();
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

impl Metrics for MemoryMetrics {
    fn increment(&self, name: &'static str, labels: Labels, by: u64) {
        *self.counters.entry(series(name, labels)).or_insert(0) += by;
    }

    fn observe(&self, name: &'static str, labels: Labels, value: f64) {
        let mut entry = self.histograms.entry(series(name, labels)).or_default();
        if entry.recent.len() == WINDOW {
            entry.recent.pop_front();
        }
        entry.recent.push_back(value);
        entry.count += 1;
        entry.sum += value;
    }

    fn set(&self, name: &'static str, labels: Labels, value: f64) {
        self.gauges.insert(series(name, labels), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_gauges_and_histograms() {
        let m = MemoryMetrics::new();
        m.increment(JOBS_PROCESSED, &[("outcome", "accepted")], 1);
        m.increment(JOBS_PROCESSED, &[("outcome", "accepted")], 2);
        m.set(QUEUE_DEPTH, &[("priority", "critical")], 7.0);
        for v in 1..=100 {
            m.observe(JOB_DURATION_MS, &[], v as f64);
        }

        assert_eq!(m.counter(JOBS_PROCESSED, &[("outcome", "accepted")]), 3);
        assert_eq!(m.counter(JOBS_PROCESSED, &[("outcome", "wrong_answer")]), 0);
        assert_eq!(m.gauge(QUEUE_DEPTH, &[("priority", "critical")]), Some(7.0));
        assert_eq!(m.quantile(JOB_DURATION_MS, &[], 0.95), Some(95.0));

        let text = m.render();
        assert!(text.contains("judge_jobs_processed_total{outcome=\"accepted\"} 3\n"));
        assert!(text.contains("judge_queue_depth{priority=\"critical\"} 7\n"));
        assert!(text.contains("judge_job_duration_ms{quantile=\"0.95\"} 95\n"));
        assert!(text.contains("judge_job_duration_ms_count 100\n"));
    }
}
