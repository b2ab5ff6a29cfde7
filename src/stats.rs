#![forbid(unsafe_code)]

// Outcome accumulation and cross-worker aggregation. Counters are updated
// under one critical section per outcome so a snapshot is always
// internally consistent.

use crate::session::{ErrorClass, Outcome, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

/// Run-scoped counters for one worker process.
///
/// `merge` is field-wise addition: associative and commutative, so worker
/// snapshots can arrive in any order. It is additive, not idempotent:
/// each snapshot must be contributed exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub auth_failures: u64,
    pub messages_valid: u64,
    pub messages_invalid: u64,
}

impl AggregateStats {
    pub fn merge(&mut self, other: &AggregateStats) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.auth_failures += other.auth_failures;
        self.messages_valid += other.messages_valid;
        self.messages_invalid += other.messages_invalid;
    }

    /// Connection success rate in percent, or None before any attempt.
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts == 0 {
            return None;
        }
        Some(self.successes as f64 / self.attempts as f64 * 100.0)
    }
}

/// Connect-latency summary for the worker-local report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencySummary {
    pub fn from_samples(samples: &mut Vec<u64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let count = samples.len();
        Some(Self {
            count,
            min_ms: samples[0],
            max_ms: samples[count - 1],
            avg_ms: samples.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(samples, 0.50),
            p95_ms: percentile(samples, 0.95),
            p99_ms: percentile(samples, 0.99),
        })
    }
}

struct Recorded {
    stats: AggregateStats,
    connect_latencies_ms: Vec<u64>,
}

/// Converts outcome events into aggregate counters.
pub struct StatsRecorder {
    inner: Mutex<Recorded>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Recorded {
                stats: AggregateStats::default(),
                connect_latencies_ms: Vec::new(),
            }),
        }
    }

    pub fn record(&self, outcome: &Outcome) {
        let mut inner = self.inner.lock().expect("stats recorder poisoned");
        match outcome.kind {
            OutcomeKind::Connect => {
                inner.stats.attempts += 1;
                if outcome.success {
                    inner.stats.successes += 1;
                    let ms = outcome.latency.as_millis() as u64;
                    inner.connect_latencies_ms.push(ms);
                } else {
                    inner.stats.failures += 1;
                    if let Some(ErrorClass::ProtocolDenied(reason)) = &outcome.error {
                        if reason.is_auth_failure() {
                            inner.stats.auth_failures += 1;
                        }
                    }
                }
            }
            OutcomeKind::Subscribe => {
                // No dedicated counter; visible through log detail only.
                debug!(
                    client_id = %outcome.client_id,
                    success = outcome.success,
                    latency_ms = outcome.latency.as_millis() as u64,
                    "subscribe outcome"
                );
            }
            OutcomeKind::Message => {
                if outcome.success {
                    inner.stats.messages_valid += 1;
                } else {
                    inner.stats.messages_invalid += 1;
                }
            }
        }
    }

    /// Consistent copy of the counters as of now.
    pub fn snapshot(&self) -> AggregateStats {
        self.inner.lock().expect("stats recorder poisoned").stats
    }

    /// Percentile summary of successful connect latencies so far.
    pub fn connect_latency_summary(&self) -> Option<LatencySummary> {
        let mut inner = self.inner.lock().expect("stats recorder poisoned");
        let mut samples = std::mem::take(&mut inner.connect_latencies_ms);
        let summary = LatencySummary::from_samples(&mut samples);
        inner.connect_latencies_ms = samples;
        summary
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DenyReason;
    use std::time::Duration;

    fn connect_ok(ms: u64) -> Outcome {
        Outcome::success(OutcomeKind::Connect, "user1", Duration::from_millis(ms))
    }

    fn connect_denied(reason: DenyReason) -> Outcome {
        Outcome::failure(
            OutcomeKind::Connect,
            "user1",
            Duration::from_millis(5),
            ErrorClass::ProtocolDenied(reason),
        )
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let a = AggregateStats {
            attempts: 10,
            successes: 7,
            failures: 3,
            auth_failures: 2,
            messages_valid: 100,
            messages_invalid: 1,
        };
        let b = AggregateStats {
            attempts: 4,
            successes: 4,
            ..Default::default()
        };
        let c = AggregateStats {
            attempts: 1,
            failures: 1,
            auth_failures: 1,
            ..Default::default()
        };

        // (a+b)+c
        let mut left = a;
        left.merge(&b);
        left.merge(&c);
        // a+(b+c)
        let mut bc = b;
        bc.merge(&c);
        let mut right = a;
        right.merge(&bc);
        assert_eq!(left, right);

        // c+b+a
        let mut reversed = c;
        reversed.merge(&b);
        reversed.merge(&a);
        assert_eq!(left, reversed);

        assert_eq!(left.attempts, 15);
        assert_eq!(left.successes, 11);
        assert_eq!(left.auth_failures, 3);
    }

    #[test]
    fn denial_increments_auth_failures_exactly_once() {
        let recorder = StatsRecorder::new();
        recorder.record(&connect_denied(DenyReason::NotAuthorized));

        let stats = recorder.snapshot();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.successes, 0);
    }

    #[test]
    fn non_auth_failures_do_not_touch_auth_counter() {
        let recorder = StatsRecorder::new();
        recorder.record(&connect_denied(DenyReason::ServerUnavailable));
        recorder.record(&Outcome::failure(
            OutcomeKind::Connect,
            "user1",
            Duration::from_secs(30),
            ErrorClass::Timeout,
        ));

        let stats = recorder.snapshot();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.auth_failures, 0);
    }

    #[test]
    fn message_outcomes_split_valid_and_invalid() {
        let recorder = StatsRecorder::new();
        recorder.record(&Outcome::success(
            OutcomeKind::Message,
            "user1",
            Duration::ZERO,
        ));
        recorder.record(&Outcome::failure(
            OutcomeKind::Message,
            "user1",
            Duration::ZERO,
            ErrorClass::PayloadMismatch,
        ));

        let stats = recorder.snapshot();
        assert_eq!(stats.messages_valid, 1);
        assert_eq!(stats.messages_invalid, 1);
    }

    #[test]
    fn latency_summary_reports_percentiles() {
        let recorder = StatsRecorder::new();
        for ms in [10, 20, 30, 40, 50] {
            recorder.record(&connect_ok(ms));
        }
        let summary = recorder.connect_latency_summary().unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 50);
        assert_eq!(summary.p50_ms, 30);

        // Failed connects contribute no samples.
        assert!(recorder.snapshot().attempts == 5);
    }
}
