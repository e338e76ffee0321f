use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::model::{TaskId, Workflow};

/// Structural problems found in a workflow graph. A workflow with any of
/// these is rejected outright; there is no partial acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow has no source task (every task declares dependencies)")]
    NoSourceTask,

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    #[error("task '{task}' is unreachable from any source task")]
    UnreachableTask { task: TaskId },

    #[error("dependency cycle detected at task '{task}'")]
    CycleDetected { task: TaskId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Validate a workflow's structure. All errors are collected rather than
/// short-circuited, so the caller sees the full problem set in one pass.
///
/// Checks, in order: at least one source task; every dependency resolves
/// within the workflow; every task is reachable from some source (skipped
/// when there is no source to start from); no dependency cycles. Cycle
/// detection runs regardless of reachability, since a cycle can sit
/// entirely inside an unreachable subgraph.
pub fn validate(workflow: &Workflow) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let ids: HashSet<&TaskId> = workflow.tasks().iter().map(|t| &t.id).collect();
    let sources: Vec<&TaskId> = workflow.source_ids().collect();
    if sources.is_empty() {
        errors.push(ValidationError::NoSourceTask);
    }

    for task in workflow.tasks() {
        for dep in &task.dependencies {
            if !ids.contains(dep) {
                errors.push(ValidationError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Forward adjacency (dependency -> dependents); dangling references
    // are already reported above and are skipped here.
    let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for task in workflow.tasks() {
        for dep in &task.dependencies {
            if ids.contains(dep) {
                dependents.entry(dep).or_default().push(&task.id);
            }
        }
    }

    // Reachability assumes at least one source to traverse from.
    if !sources.is_empty() {
        let mut visited: HashSet<&TaskId> = sources.iter().copied().collect();
        let mut queue: VecDeque<&TaskId> = sources.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            for &next in dependents.get(id).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        for task in workflow.tasks() {
            if !visited.contains(&task.id) {
                errors.push(ValidationError::UnreachableTask {
                    task: task.id.clone(),
                });
            }
        }
    }

    // Three-color depth-first search over forward edges; re-entering a
    // grey node names the task where the cycle was detected.
    let mut color: HashMap<&TaskId, Color> = ids.iter().map(|&id| (id, Color::White)).collect();
    for task in workflow.tasks() {
        if color[&task.id] == Color::White {
            visit(&task.id, &dependents, &mut color, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

enum Frame<'a> {
    Enter(&'a TaskId),
    Exit(&'a TaskId),
}

fn visit<'a>(
    root: &'a TaskId,
    dependents: &HashMap<&'a TaskId, Vec<&'a TaskId>>,
    color: &mut HashMap<&'a TaskId, Color>,
    errors: &mut Vec<ValidationError>,
) {
    // Explicit stack; dependency chains can be arbitrarily deep, so the
    // traversal must not recurse once per task. The grey set is exactly
    // the path of nodes entered but not yet exited.
    let mut stack = vec![Frame::Enter(root)];
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(id) => {
                // A node queued twice via different parents may already
                // have been visited by the time it is popped
                if color[id] != Color::White {
                    continue;
                }
                color.insert(id, Color::Grey);
                stack.push(Frame::Exit(id));
                for &next in dependents.get(id).into_iter().flatten() {
                    match color[next] {
                        Color::White => stack.push(Frame::Enter(next)),
                        Color::Grey => {
                            errors.push(ValidationError::CycleDetected { task: next.clone() })
                        }
                        Color::Black => {}
                    }
                }
            }
            Frame::Exit(id) => {
                color.insert(id, Color::Black);
            }
        }
    }
}
