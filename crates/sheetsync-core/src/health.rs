//! Engine health state

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::coordination::RateLimitMetricsSnapshot;
use crate::dispatch::QueueStats;
use crate::util::compact_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Running, but a pipeline's latest outcome was an error
    Degraded,
    /// The store cannot be reached
    Unavailable,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    Ingest,
    Capture,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineHealth {
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

impl PipelineHealth {
    /// Whether the most recent outcome was an error
    pub fn is_failing(&self) -> bool {
        match (self.last_error_at, self.last_success_at) {
            (Some(error_at), Some(success_at)) => error_at >= success_at,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Queue and limiter figures sampled by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchHealth {
    pub ingest_queue: QueueStats,
    pub sheet_queue: QueueStats,
    pub sheet_rate_limit: RateLimitMetricsSnapshot,
    pub store_rate_limit: RateLimitMetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: i64,
    pub store_reachable: bool,
    pub consecutive_poll_failures: u32,
    pub last_poll_at: Option<i64>,
    pub ingest: PipelineHealth,
    pub capture: PipelineHealth,
    #[serde(flatten)]
    pub dispatch: DispatchHealth,
}

#[derive(Debug, Default)]
struct State {
    store_reachable: bool,
    consecutive_poll_failures: u32,
    last_poll_at: Option<i64>,
    ingest: PipelineHealth,
    capture: PipelineHealth,
}

/// Shared health state written by the pipelines
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: Arc<Mutex<State>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                store_reachable: true,
                ..State::default()
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn record_success(&self, pipeline: Pipeline, at: i64) {
        self.with_state(|state| {
            state.store_reachable = true;
            pipeline_mut(state, pipeline).last_success_at = Some(at);
        });
    }

    pub fn record_error(&self, pipeline: Pipeline, error: &str, at: i64) {
        self.with_state(|state| {
            let health = pipeline_mut(state, pipeline);
            health.last_error = Some(compact_text(error));
            health.last_error_at = Some(at);
        });
    }

    pub fn record_poll_success(&self, at: i64) {
        self.with_state(|state| {
            state.store_reachable = true;
            state.consecutive_poll_failures = 0;
            state.last_poll_at = Some(at);
        });
    }

    /// Returns the number of consecutive failed polls, this one included.
    pub fn record_poll_failure(&self, error: &str, at: i64) -> u32 {
        self.with_state(|state| {
            state.store_reachable = false;
            state.consecutive_poll_failures = state.consecutive_poll_failures.saturating_add(1);
            state.capture.last_error = Some(compact_text(error));
            state.capture.last_error_at = Some(at);
            state.consecutive_poll_failures
        })
    }

    pub fn report(&self, dispatch: DispatchHealth, now: i64) -> HealthReport {
        self.with_state(|state| {
            let status = if !state.store_reachable {
                HealthStatus::Unavailable
            } else if state.ingest.is_failing() || state.capture.is_failing() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            HealthReport {
                status,
                timestamp: now,
                store_reachable: state.store_reachable,
                consecutive_poll_failures: state.consecutive_poll_failures,
                last_poll_at: state.last_poll_at,
                ingest: state.ingest.clone(),
                capture: state.capture.clone(),
                dispatch,
            }
        })
    }
}

fn pipeline_mut(state: &mut State, pipeline: Pipeline) -> &mut PipelineHealth {
    match pipeline {
        Pipeline::Ingest => &mut state.ingest,
        Pipeline::Capture => &mut state.capture,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let report = HealthMonitor::new().report(DispatchHealth::default(), 1);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.store_reachable);
    }

    #[test]
    fn pipeline_error_degrades_until_next_success() {
        let monitor = HealthMonitor::new();
        monitor.record_success(Pipeline::Ingest, 10);
        monitor.record_error(Pipeline::Ingest, " schema error ", 20);

        let report = monitor.report(DispatchHealth::default(), 21);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.ingest.last_error.as_deref(), Some("schema error"));

        monitor.record_success(Pipeline::Ingest, 30);
        assert_eq!(
            monitor.report(DispatchHealth::default(), 31).status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn poll_failures_mark_store_unavailable() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.record_poll_failure("database is locked", 5), 1);
        assert_eq!(monitor.record_poll_failure("database is locked", 6), 2);

        let report = monitor.report(DispatchHealth::default(), 7);
        assert_eq!(report.status, HealthStatus::Unavailable);
        assert_eq!(report.consecutive_poll_failures, 2);

        monitor.record_poll_success(8);
        monitor.record_success(Pipeline::Capture, 8);
        let report = monitor.report(DispatchHealth::default(), 9);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.last_poll_at, Some(8));
    }

    #[test]
    fn report_serializes_flat_dispatch_figures() {
        let report = HealthMonitor::new().report(DispatchHealth::default(), 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sheet_queue"]["delivered"], 0);
        assert_eq!(json["store_rate_limit"]["limited"], 0);
    }
}
