use std::collections::HashMap;

use crate::engine::registry::Agent;
use crate::workflow::model::{AgentId, Task};

/// Running-task count per agent, derived on demand from the scheduler's
/// in-flight map. Absent agents count as zero load.
pub type LoadSnapshot = HashMap<AgentId, usize>;

/// Load fraction at which the overload penalty kicks in.
pub const OVERLOAD_THRESHOLD: f64 = 0.8;
/// Points removed from a near-capacity agent.
pub const OVERLOAD_PENALTY: i32 = 2;
/// Points added when the agent declares the task kind's capability.
pub const CAPABILITY_BONUS: i32 = 3;
/// Final scores are clamped into this range.
pub const MIN_SCORE: i32 = 1;
pub const MAX_SCORE: i32 = 10;

/// Suitability of `agent` for `task` under the given load. Returns `None`
/// for an agent at or over capacity: a full agent is excluded from
/// candidacy entirely, never merely penalized.
pub fn score(agent: &Agent, task: &Task, load: &LoadSnapshot) -> Option<i32> {
    let running = load.get(&agent.id).copied().unwrap_or(0);
    if running >= agent.capacity {
        return None;
    }

    let mut score = i32::from(agent.base_priority);
    if running as f64 >= OVERLOAD_THRESHOLD * agent.capacity as f64 {
        score -= OVERLOAD_PENALTY;
    }
    if let Some(capability) = task.kind.required_capability() {
        if agent.capabilities.contains(capability) {
            score += CAPABILITY_BONUS;
        }
    }
    Some(score.clamp(MIN_SCORE, MAX_SCORE))
}

/// Highest-scoring eligible agent for `task`. `agents` must be in
/// registration order; ties go to the earlier agent, so selection is
/// deterministic.
pub fn find_best_agent<'a>(
    task: &Task,
    agents: &'a [Agent],
    load: &LoadSnapshot,
) -> Option<&'a Agent> {
    let mut best: Option<(&Agent, i32)> = None;
    for agent in agents {
        if let Some(s) = score(agent, task, load) {
            match best {
                Some((_, best_score)) if s <= best_score => {}
                _ => best = Some((agent, s)),
            }
        }
    }
    best.map(|(agent, _)| agent)
}
