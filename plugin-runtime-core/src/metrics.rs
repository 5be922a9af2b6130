//! Execution metrics
//!
//! In-process statistics per `(plugin, method)` plus emission through the
//! `metrics` facade, so whatever recorder the host installs receives them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::api::PluginKey;
use crate::error::ExecutionError;

pub const EXECUTIONS_TOTAL: &str = "plugin_executions_total";
pub const EXECUTION_DURATION_SECONDS: &str = "plugin_execution_duration_seconds";
pub const RATE_LIMITED_TOTAL: &str = "plugin_rate_limited_total";

/// How one execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
    Denied,
    RateLimited,
}

impl ExecutionOutcome {
    pub fn of<T>(result: &Result<T, ExecutionError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(ExecutionError::ExecutionTimeout { .. }) => Self::Timeout,
            Err(ExecutionError::RateLimited { .. }) => Self::RateLimited,
            Err(ExecutionError::ExecutionDenied { .. }) => Self::Denied,
            Err(_) => Self::Failure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Denied => "denied",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Aggregated statistics of one method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodStats {
    pub calls: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
    pub last_outcome: ExecutionOutcome,
    pub last_call: DateTime<Utc>,
}

impl MethodStats {
    pub fn average_duration(&self) -> Duration {
        match u32::try_from(self.calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_duration / calls,
            Err(_) => Duration::ZERO,
        }
    }
}

/// Point-in-time copy of all statistics, keyed by plugin then method
pub type MetricsSnapshot = BTreeMap<PluginKey, BTreeMap<String, MethodStats>>;

/// Collector used by the execution pipeline.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    stats: DashMap<(PluginKey, String), MethodStats>,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished execution
    pub fn record(&self, key: &PluginKey, method: &str, outcome: ExecutionOutcome, duration: Duration) {
        metrics::counter!(
            EXECUTIONS_TOTAL,
            "plugin" => key.to_string(),
            "method" => method.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        metrics::histogram!(
            EXECUTION_DURATION_SECONDS,
            "plugin" => key.to_string(),
            "method" => method.to_string()
        )
        .record(duration.as_secs_f64());
        if outcome == ExecutionOutcome::RateLimited {
            metrics::counter!(RATE_LIMITED_TOTAL, "plugin" => key.to_string()).increment(1);
        }

        let failed = outcome != ExecutionOutcome::Success;
        self.stats
            .entry((key.clone(), method.to_string()))
            .and_modify(|stats| {
                stats.calls = stats.calls.saturating_add(1);
                if failed {
                    stats.failures = stats.failures.saturating_add(1);
                }
                stats.total_duration = stats.total_duration.saturating_add(duration);
                stats.max_duration = stats.max_duration.max(duration);
                stats.last_outcome = outcome;
                stats.last_call = Utc::now();
            })
            .or_insert_with(|| MethodStats {
                calls: 1,
                failures: u64::from(failed),
                total_duration: duration,
                max_duration: duration,
                last_outcome: outcome,
                last_call: Utc::now(),
            });
    }

    pub fn method_stats(&self, key: &PluginKey, method: &str) -> Option<MethodStats> {
        self.stats
            .get(&(key.clone(), method.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new();
        for entry in &self.stats {
            let (key, method) = entry.key();
            snapshot
                .entry(key.clone())
                .or_default()
                .insert(method.clone(), entry.value().clone());
        }
        snapshot
    }

    pub fn remove_plugin(&self, key: &PluginKey) {
        self.stats.retain(|(plugin, _), _| plugin != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate_per_method() {
        let metrics = ExecutionMetrics::new();
        let key = PluginKey::new("comm", "smtp");
        metrics.record(&key, "send", ExecutionOutcome::Success, Duration::from_millis(10));
        metrics.record(&key, "send", ExecutionOutcome::Timeout, Duration::from_millis(30));
        metrics.record(&key, "verify", ExecutionOutcome::Success, Duration::from_millis(5));

        let send = metrics.method_stats(&key, "send").unwrap();
        assert_eq!(send.calls, 2);
        assert_eq!(send.failures, 1);
        assert_eq!(send.max_duration, Duration::from_millis(30));
        assert_eq!(send.average_duration(), Duration::from_millis(20));
        assert_eq!(send.last_outcome, ExecutionOutcome::Timeout);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot[&key].len(), 2);

        metrics.remove_plugin(&key);
        assert!(metrics.snapshot().is_empty());
    }

    #[test]
    fn test_outcome_classification() {
        let key = PluginKey::new("a", "b");
        let timeout: Result<(), _> = Err(ExecutionError::ExecutionTimeout {
            key: key.clone(),
            method: "m".to_string(),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(ExecutionOutcome::of(&timeout), ExecutionOutcome::Timeout);
        assert_eq!(ExecutionOutcome::of(&Ok::<_, ExecutionError>(())), ExecutionOutcome::Success);
    }
}
