//! Rolling per-(agent, capability) execution statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight of a new sample in the exponential moving averages.
pub const SMOOTHING_FACTOR: f64 = 0.1;

/// Performance score for an agent with no history.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Reliability score for an agent with no history.
pub const NEUTRAL_RELIABILITY: f64 = 1.0;

/// Outcome of one execution attempt, fed to `AgentDiscovery::update_metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub execution_time_ms: f64,
    pub has_error: bool,
}

impl ExecutionOutcome {
    pub fn success(execution_time_ms: f64) -> Self {
        Self {
            success: true,
            execution_time_ms,
            has_error: false,
        }
    }

    pub fn failure(execution_time_ms: f64) -> Self {
        Self {
            success: false,
            execution_time_ms,
            has_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMetrics {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    /// Mean of reliability and performance after the last update.
    pub total_score: f64,
}

impl DiscoveryMetrics {
    /// Seed from a first observation before smoothing it in.
    fn seeded(execution_time_ms: f64) -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: execution_time_ms,
            error_rate: 0.0,
            usage_count: 0,
            last_used: None,
            total_score: 0.0,
        }
    }

    /// Start tracking with `outcome` as the first observation.
    pub fn from_outcome(outcome: &ExecutionOutcome, latency_baseline_ms: f64) -> Self {
        let mut metrics = Self::seeded(outcome.execution_time_ms.max(0.0));
        metrics.record(outcome, latency_baseline_ms);
        metrics
    }

    /// Smooth `outcome` into the running averages.
    pub fn record(&mut self, outcome: &ExecutionOutcome, latency_baseline_ms: f64) {
        let keep = 1.0 - SMOOTHING_FACTOR;
        let success = if outcome.success { 1.0 } else { 0.0 };
        let error = if outcome.has_error { 1.0 } else { 0.0 };

        self.success_rate = keep * self.success_rate + SMOOTHING_FACTOR * success;
        self.error_rate = keep * self.error_rate + SMOOTHING_FACTOR * error;
        self.avg_latency_ms =
            keep * self.avg_latency_ms + SMOOTHING_FACTOR * outcome.execution_time_ms.max(0.0);
        self.usage_count += 1;
        self.last_used = Some(Utc::now());
        self.total_score =
            (self.reliability_score() + self.performance_score(latency_baseline_ms)) / 2.0;
    }

    pub fn reliability_score(&self) -> f64 {
        self.success_rate * (1.0 - self.error_rate)
    }

    /// `1 / (1 + latency / baseline)`: 1.0 for instant, 0.5 at the baseline.
    pub fn performance_score(&self, latency_baseline_ms: f64) -> f64 {
        if latency_baseline_ms <= 0.0 {
            return NEUTRAL_PERFORMANCE;
        }
        1.0 / (1.0 + self.avg_latency_ms / latency_baseline_ms)
    }
}

/// Reliability of optional metrics, neutral when absent.
pub fn reliability_or_neutral(metrics: Option<&DiscoveryMetrics>) -> f64 {
    metrics.map_or(NEUTRAL_RELIABILITY, DiscoveryMetrics::reliability_score)
}

/// Performance of optional metrics, neutral when absent.
pub fn performance_or_neutral(metrics: Option<&DiscoveryMetrics>, latency_baseline_ms: f64) -> f64 {
    metrics.map_or(NEUTRAL_PERFORMANCE, |m| m.performance_score(latency_baseline_ms))
}
