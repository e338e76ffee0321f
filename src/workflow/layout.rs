use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::model::{TaskId, Workflow};

/// Presentation position for one task node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub center_x: f64,
    pub h_spacing: f64,
    pub v_spacing: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            center_x: 400.0,
            h_spacing: 180.0,
            v_spacing: 120.0,
        }
    }
}

/// Derive a 2-D position for every task via breadth-first level
/// assignment. Advisory for rendering only; execution order never
/// consults it.
pub fn auto_layout(workflow: &Workflow) -> HashMap<TaskId, Position> {
    auto_layout_with(workflow, &LayoutConfig::default())
}

/// Sources sit at level 0; a node's level is the one at which BFS first
/// visits it (first assignment wins). Nodes within a level keep discovery
/// order and are centered around `center_x`. Tasks unreachable from any
/// source get no position; the validator rejects such graphs anyway.
pub fn auto_layout_with(workflow: &Workflow, config: &LayoutConfig) -> HashMap<TaskId, Position> {
    let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for task in workflow.tasks() {
        for dep in &task.dependencies {
            if workflow.contains(dep) {
                dependents.entry(dep).or_default().push(&task.id);
            }
        }
    }

    let mut levels: Vec<Vec<&TaskId>> = Vec::new();
    let mut level_of: HashMap<&TaskId, usize> = HashMap::new();
    let mut queue: VecDeque<(&TaskId, usize)> = VecDeque::new();
    for id in workflow.source_ids() {
        level_of.insert(id, 0);
        queue.push_back((id, 0));
    }

    while let Some((id, level)) = queue.pop_front() {
        while levels.len() <= level {
            levels.push(Vec::new());
        }
        levels[level].push(id);
        for &next in dependents.get(id).into_iter().flatten() {
            if !level_of.contains_key(next) {
                level_of.insert(next, level + 1);
                queue.push_back((next, level + 1));
            }
        }
    }

    let mut positions = HashMap::new();
    for (level, nodes) in levels.iter().enumerate() {
        let n = nodes.len();
        for (i, id) in nodes.iter().enumerate() {
            let x = config.center_x - ((n - 1) as f64 * config.h_spacing) / 2.0
                + i as f64 * config.h_spacing;
            let y = level as f64 * config.v_spacing;
            positions.insert((*id).clone(), Position { x, y });
        }
    }
    positions
}
