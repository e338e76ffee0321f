use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::workflow::model::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// Per-agent accumulator. Mutated exactly once per task terminal
/// transition, in `MetricsAggregator::record`; everything else reads.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRecord {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cumulative_duration_ms: u64,
    pub first_recorded_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl PerformanceRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            cumulative_duration_ms: 0,
            first_recorded_at: now,
            last_active_at: now,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            // No history yet; treated as perfect so unused agents are not
            // penalized out of rotation.
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }

    pub fn avg_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cumulative_duration_ms as f64 / self.total as f64
        }
    }
}

/// Accumulates per-agent counters and derives a normalized 0-100
/// performance score used to inform future assignment decisions.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    records: DashMap<AgentId, PerformanceRecord>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, agent_id: &AgentId, outcome: Outcome, duration_ms: u64) {
        let now = Utc::now();
        let mut record = self
            .records
            .entry(agent_id.clone())
            .or_insert_with(|| PerformanceRecord::new(now));
        record.total += 1;
        match outcome {
            Outcome::Completed => record.completed += 1,
            Outcome::Failed => record.failed += 1,
        }
        record.cumulative_duration_ms += duration_ms;
        record.last_active_at = now;
    }

    /// Normalized score in [0, 100]:
    /// `0.4 * success_rate` (up to 40) + a speed term
    /// (`20 - avg_duration_secs`, capped at 20) + a volume term
    /// (`ln(total + 1) * 3`, capped at 20) + an uptime term (whole minutes
    /// since the first recorded task, capped at 20). An agent with no
    /// history scores the neutral baseline of 60.
    pub fn performance_score(&self, agent_id: &AgentId) -> f64 {
        let (success_rate, avg_secs, total, uptime_minutes) = match self.records.get(agent_id) {
            Some(r) => (
                r.success_rate(),
                r.avg_duration_ms() / 1000.0,
                r.total,
                (Utc::now() - r.first_recorded_at).num_minutes().max(0) as f64,
            ),
            None => (100.0, 0.0, 0, 0.0),
        };

        let speed = (20.0 - avg_secs).min(20.0);
        let volume = (((total + 1) as f64).ln() * 3.0).min(20.0);
        let uptime = uptime_minutes.min(20.0);
        (0.4 * success_rate + speed + volume + uptime).clamp(0.0, 100.0)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<PerformanceRecord> {
        self.records.get(agent_id).map(|r| r.clone())
    }

    pub fn snapshot(&self) -> HashMap<AgentId, PerformanceRecord> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn scores(&self) -> HashMap<AgentId, f64> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), self.performance_score(entry.key())))
            .collect()
    }
}
