//! Call counters, reported through an injected [`MetricsSink`].

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// The counters maintained for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMetric {
    /// Calls started.
    TotalCalls,
    /// Calls started and not yet terminated.
    CurrentCalls,
    /// Calls terminated with a status other than `Ok`.
    CallsFailed,
    /// Calls terminated because their deadline expired.
    CallsDeadlineExceeded,
    /// Messages written.
    MessagesSent,
    /// Messages read.
    MessagesReceived,
}

impl CallMetric {
    const ALL: [Self; 6] = [
        Self::TotalCalls,
        Self::CurrentCalls,
        Self::CallsFailed,
        Self::CallsDeadlineExceeded,
        Self::MessagesSent,
        Self::MessagesReceived,
    ];

    /// Metric name as exported.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalCalls => "total-calls",
            Self::CurrentCalls => "current-calls",
            Self::CallsFailed => "calls-failed",
            Self::CallsDeadlineExceeded => "calls-deadline-exceeded",
            Self::MessagesSent => "messages-sent",
            Self::MessagesReceived => "messages-received",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CallMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of call metrics.
pub trait MetricsSink: Send + Sync + 'static {
    /// Add one to `metric`.
    fn increment(&self, metric: CallMetric);

    /// Subtract one from `metric`, only used for gauges.
    fn decrement(&self, metric: CallMetric);

    /// Record an observed value, e.g. a message size in bytes.
    fn observe(&self, metric: CallMetric, value: u64) {
        let _ = (metric, value);
    }
}

/// A sink discarding everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _metric: CallMetric) {}

    fn decrement(&self, _metric: CallMetric) {}
}

/// An in-memory sink keeping one atomic counter per metric.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: [AtomicI64; 6],
}

impl AtomicMetrics {
    /// Create a sink with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `metric`.
    #[must_use]
    pub fn get(&self, metric: CallMetric) -> i64 {
        self.counters[metric.index()].load(Ordering::Relaxed)
    }

    /// All counters with their names.
    pub fn snapshot(&self) -> impl Iterator<Item = (CallMetric, i64)> + '_ {
        CallMetric::ALL.into_iter().map(|m| (m, self.get(m)))
    }
}

impl MetricsSink for AtomicMetrics {
    fn increment(&self, metric: CallMetric) {
        self.counters[metric.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self, metric: CallMetric) {
        self.counters[metric.index()].fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_counters() {
        let metrics = AtomicMetrics::new();
        metrics.increment(CallMetric::TotalCalls);
        metrics.increment(CallMetric::CurrentCalls);
        metrics.decrement(CallMetric::CurrentCalls);
        metrics.observe(CallMetric::MessagesSent, 42);

        assert_eq!(metrics.get(CallMetric::TotalCalls), 1);
        assert_eq!(metrics.get(CallMetric::CurrentCalls), 0);
        assert_eq!(metrics.snapshot().count(), 6);
    }
}
