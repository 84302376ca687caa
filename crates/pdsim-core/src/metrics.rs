//! Per-request token records and the end-of-run report.
//!
//! Latencies are collected in simulated nanoseconds and reported in
//! microseconds.

use crate::request::{Phase, Request, RequestId};
use crate::worker::GroupKind;
use pdsim_grid::SimTime;
use serde::{Deserialize, Serialize};

/// Token timeline of one finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub arrival_ns: SimTime,
    pub sequence_length: u32,
    pub prefill_chunks: u32,
    pub ttft_ns: u64,
    pub latency_ns: u64,
    /// Tokens produced, first token included.
    pub tokens: u32,
    pub tbt_samples_ns: Vec<u64>,
}

impl RequestRecord {
    /// `None` unless the request reached `Done`.
    pub fn from_request(req: &Request) -> Option<Self> {
        if req.phase != Phase::Done {
            return None;
        }
        let first = req.first_token_at?;
        let finished = req.finished_at?;
        let tbt_samples_ns = req
            .token_times
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .collect();
        Some(Self {
            request_id: req.id,
            arrival_ns: req.arrival_time,
            sequence_length: req.sequence_length,
            prefill_chunks: req.prefill_iteration_count,
            ttft_ns: first.saturating_sub(req.arrival_time),
            latency_ns: finished.saturating_sub(req.arrival_time),
            tokens: req.token_times.len() as u32,
            tbt_samples_ns,
        })
    }

    pub fn avg_tbt_ns(&self) -> f64 {
        if self.tbt_samples_ns.is_empty() {
            return 0.0;
        }
        self.tbt_samples_ns.iter().sum::<u64>() as f64 / self.tbt_samples_ns.len() as f64
    }
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p90: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
        }
    }

    fn from_ns<I: IntoIterator<Item = u64>>(values: I) -> Self {
        let us: Vec<f64> = values.into_iter().map(|ns| ns as f64 / 1_000.0).collect();
        Self::from_values(&us)
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Counters kept by one phase-group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub kind: GroupKind,
    pub workers: usize,
    pub stages: usize,
    /// Cores behind each worker.
    pub tp_size: usize,
    /// Iterations dispatched.
    pub iterations: u64,
    /// Passes that found nothing to run.
    pub idle_passes: u64,
    /// Triggers ignored because an iteration was in flight.
    pub busy_triggers: u64,
    /// Requests received from the prefill group.
    pub handoffs_received: u64,
}

impl GroupStats {
    pub fn new(kind: GroupKind, workers: usize, stages: usize) -> Self {
        Self {
            kind,
            workers,
            stages,
            tp_size: 1,
            iterations: 0,
            idle_passes: 0,
            busy_triggers: 0,
            handoffs_received: 0,
        }
    }
}

/// Outcome of a complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    /// Simulated time at which the last request finished.
    pub final_time_ns: SimTime,
    pub total_requests: usize,
    pub completed_requests: usize,
    pub generated_tokens: u64,
    pub ttft_us: Percentiles,
    pub tbt_us: Percentiles,
    pub latency_us: Percentiles,
    pub tokens_per_sec: f64,
    pub requests_per_sec: f64,
    pub groups: Vec<GroupStats>,
    pub requests: Vec<RequestRecord>,
}

impl RunReport {
    pub fn build(
        name: &str,
        final_time_ns: SimTime,
        total_requests: usize,
        requests: Vec<RequestRecord>,
        groups: Vec<GroupStats>,
    ) -> Self {
        let generated_tokens: u64 = requests.iter().map(|r| r.tokens as u64).sum();
        let secs = final_time_ns as f64 / 1e9;
        let (tokens_per_sec, requests_per_sec) = if secs > 0.0 {
            (generated_tokens as f64 / secs, requests.len() as f64 / secs)
        } else {
            (0.0, 0.0)
        };
        Self {
            name: name.to_string(),
            final_time_ns,
            total_requests,
            completed_requests: requests.len(),
            generated_tokens,
            ttft_us: Percentiles::from_ns(requests.iter().map(|r| r.ttft_ns)),
            tbt_us: Percentiles::from_ns(
                requests
                    .iter()
                    .flat_map(|r| r.tbt_samples_ns.iter().copied()),
            ),
            latency_us: Percentiles::from_ns(requests.iter().map(|r| r.latency_ns)),
            tokens_per_sec,
            requests_per_sec,
            groups,
            requests,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.groups.iter().map(|g| g.iterations).sum()
    }
}

/// Format a report as a pretty-printed table string.
pub fn format_table(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n{:=<70}\n", format!("  {} Results  ", report.name)));
    out.push_str(&format!(
        "  Final time: {} ns ({:.3} ms) | Requests: {}/{}\n",
        report.final_time_ns,
        report.final_time_ns as f64 / 1e6,
        report.completed_requests,
        report.total_requests,
    ));
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    for (label, p) in [
        ("TTFT (us)", &report.ttft_us),
        ("TBT (us)", &report.tbt_us),
        ("E2E (us)", &report.latency_us),
    ] {
        out.push_str(&format!(
            "  {:<15} P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
            label, p.p50, p.p90, p.p99
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Tokens: {}  Tokens/sec: {:.0}  Requests/sec: {:.1}\n",
        report.generated_tokens, report.tokens_per_sec, report.requests_per_sec,
    ));
    out.push_str(&format!("{:-<70}\n", "  Groups  "));
    for g in &report.groups {
        out.push_str(&format!(
            "  {:<9} workers={:<3} tp={:<2} stages={:<2} iterations={:<7} idle={:<5} handoffs={}\n",
            format!("{:?}", g.kind),
            g.workers,
            g.tp_size,
            g.stages,
            g.iterations,
            g.idle_passes,
            g.handoffs_received,
        ));
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done_request(arrival: SimTime, token_times: Vec<SimTime>) -> Request {
        Request {
            id: 7,
            sequence_length: 16,
            arrival_time: arrival,
            prefill_iteration_count: 1,
            phase: Phase::Done,
            prefill_completed_count: 1,
            prefill_dispatched_count: 1,
            decode_step_count: token_times.len() as u32 - 1,
            first_token_at: token_times.first().copied(),
            finished_at: token_times.last().copied(),
            token_times,
        }
    }

    #[test]
    fn test_percentiles_empty() {
        let p = Percentiles::from_values(&[]);
        assert_eq!(p.p50, 0.0);
        assert_eq!(p.mean, 0.0);
    }

    #[test]
    fn test_percentiles_distribution() {
        let values: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let p = Percentiles::from_values(&values);
        assert!((p.p50 - 50.0).abs() < 2.0);
        assert!((p.p99 - 99.0).abs() < 2.0);
        assert_eq!(p.min, 1.0);
        assert_eq!(p.max, 100.0);
    }

    #[test]
    fn test_record_from_done_request() {
        let rec = RequestRecord::from_request(&done_request(100, vec![1_100, 1_400, 2_000]))
            .unwrap();
        assert_eq!(rec.ttft_ns, 1_000);
        assert_eq!(rec.latency_ns, 1_900);
        assert_eq!(rec.tokens, 3);
        assert_eq!(rec.tbt_samples_ns, vec![300, 600]);
        assert!((rec.avg_tbt_ns() - 450.0).abs() < 1e-9);
    }

    #[test]
    fn test_unfinished_request_has_no_record() {
        let mut req = done_request(0, vec![10, 20]);
        req.phase = Phase::Decode;
        assert!(RequestRecord::from_request(&req).is_none());
    }

    #[test]
    fn test_report_throughput() {
        let rec = RequestRecord::from_request(&done_request(0, vec![500_000_000, 1_000_000_000]))
            .unwrap();
        let report = RunReport::build(
            "t",
            1_000_000_000,
            1,
            vec![rec],
            vec![GroupStats::new(GroupKind::Unified, 1, 1)],
        );
        assert_eq!(report.generated_tokens, 2);
        assert!((report.tokens_per_sec - 2.0).abs() < 1e-9);
        assert!((report.ttft_us.p50 - 500_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_format_table_no_panic() {
        let report = RunReport::build(
            "table",
            0,
            0,
            vec![],
            vec![GroupStats::new(GroupKind::Decode, 2, 1)],
        );
        let table = format_table(&report);
        assert!(table.contains("table"));
        assert!(table.contains("TTFT"));
        assert!(table.contains("Decode"));
    }
}
