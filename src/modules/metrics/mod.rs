//! Metrics collection utilities.
//!
//! Aggregates solve attempts per provider (with latency percentiles) and the
//! token flow through the bank: accepted, evicted, consumed.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregated metrics across all providers.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub solve_attempts: u64,
    pub solve_successes: u64,
    pub solve_failures: u64,
    pub tokens_accepted: u64,
    pub tokens_evicted: u64,
    pub tokens_consumed: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            solve_attempts: 0,
            solve_successes: 0,
            solve_failures: 0,
            tokens_accepted: 0,
            tokens_evicted: 0,
            tokens_consumed: 0,
            average_latency: None,
        }
    }
}

/// Provider-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub provider: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
}

impl ProviderStats {
    fn from_accumulator(provider: &str, acc: &ProviderAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            provider: provider.to_string(),
            attempts: acc.attempts,
            successes: acc.successes,
            failures: acc.failures,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub providers: Vec<ProviderStats>,
}

/// Token lifecycle transitions tracked by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Accepted,
    Evicted,
    Consumed,
}

#[derive(Debug)]
struct ProviderAccumulator {
    attempts: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
}

impl ProviderAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples
            .iter()
            .map(|d| d.as_secs_f64())
            .sum::<f64>()
            / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    providers: HashMap<String, ProviderAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            providers: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, provider: &str) -> &mut ProviderAccumulator {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector fed by the bank's events.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_solve(&self, provider: &str, success: bool, latency: Duration) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.solve_attempts += 1;
        if success {
            guard.global.solve_successes += 1;
        } else {
            guard.global.solve_failures += 1;
        }

        if let Some(avg) = guard.global.average_latency {
            let blended = (avg.as_secs_f64() * 0.9) + (latency.as_secs_f64() * 0.1);
            guard.global.average_latency = Some(Duration::from_secs_f64(blended));
        } else {
            guard.global.average_latency = Some(latency);
        }

        guard.accumulator_mut(provider).record(success, latency);
    }

    pub fn record_token(&self, flow: TokenFlow, count: u64) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        match flow {
            TokenFlow::Accepted => guard.global.tokens_accepted += count,
            TokenFlow::Evicted => guard.global.tokens_evicted += count,
            TokenFlow::Consumed => guard.global.tokens_consumed += count,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut providers: Vec<_> = guard
            .providers
            .iter()
            .map(|(provider, acc)| ProviderStats::from_accumulator(provider, acc))
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));
        MetricsSnapshot {
            global: guard.global.clone(),
            providers,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_success_and_failure_per_provider() {
        let metrics = MetricsCollector::new();
        metrics.record_solve("capmonster", true, Duration::from_millis(1500));
        metrics.record_solve("capmonster", false, Duration::from_millis(9000));
        metrics.record_solve("twocaptcha", false, Duration::from_millis(400));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.solve_attempts, 3);
        assert_eq!(snapshot.global.solve_failures, 2);

        let capmonster = &snapshot.providers[0];
        assert_eq!(capmonster.provider, "capmonster");
        assert_eq!(capmonster.attempts, 2);
        assert_eq!(capmonster.successes, 1);
        assert_eq!(capmonster.consecutive_failures, 1);
        assert_eq!(capmonster.p95_latency, Some(Duration::from_millis(9000)));
        assert!((capmonster.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn tracks_token_flow() {
        let metrics = MetricsCollector::new();
        metrics.record_token(TokenFlow::Accepted, 3);
        metrics.record_token(TokenFlow::Evicted, 1);
        metrics.record_token(TokenFlow::Consumed, 2);
        let global = metrics.snapshot().global;
        assert_eq!(global.tokens_accepted, 3);
        assert_eq!(global.tokens_evicted, 1);
        assert_eq!(global.tokens_consumed, 2);
    }
}
