use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::JobState;

/// Derived, read-only rollup of the job ledger. Never persisted as truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStatistics {
    pub taken_at: Option<DateTime<Utc>>,
    pub total: u64,
    /// Every state is present, zero-filled.
    pub by_state: BTreeMap<JobState, u64>,
    /// Percentage of all jobs in `completed`.
    pub completion_rate: f64,
    /// Percentage of all jobs in `failed`.
    pub failure_rate: f64,
    pub mean_confidence: f64,
    pub mean_processing_secs: f64,
    pub needs_review: u64,
    /// Failed jobs that have used every retry and wait for manual action.
    pub exhausted_failures: u64,
    pub pages_completed: u64,
    pub throughput: Throughput,
}

/// Completion rate over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Throughput {
    pub window_secs: u64,
    pub files_in_window: u64,
    pub pages_in_window: u64,
    pub files_per_hour: f64,
    pub pages_per_hour: f64,
}

impl AggregateStatistics {
    pub fn count(&self, state: JobState) -> u64 {
        self.by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn in_flight(&self) -> u64 {
        JobState::IN_FLIGHT.iter().map(|s| self.count(*s)).sum()
    }
}
