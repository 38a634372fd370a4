//! Dependency resolver for a paper's task graph.
//!
//! Produces a linear task order in which every task appears after all of
//! its declared parents. Ties among unordered tasks break by difficulty
//! ascending, then task id, so a run order is reproducible across
//! processes (easy tasks also warm the agent up first, matching how the
//! task sets are authored).

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::dataset::{Paper, Task};
use crate::error::DependencyCycleError;

/// Topologically orders a paper's tasks by their parent edges.
///
/// Returns [`DependencyCycleError`] naming the offending cycle when the
/// parent graph is not acyclic; a task is never silently dropped.
pub fn resolve(paper: &Paper) -> Result<Vec<&Task>, DependencyCycleError> {
    // Children adjacency and in-degrees over the parent-edge graph.
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for task in paper.tasks.values() {
        in_degree.entry(task.task_id.as_str()).or_insert(0);
        for parent in &task.parents {
            children
                .entry(parent.as_str())
                .or_default()
                .push(task.task_id.as_str());
            *in_degree.entry(task.task_id.as_str()).or_insert(0) += 1;
        }
    }

    // Ready set ordered by (difficulty, task_id) for deterministic ties.
    let mut ready: BTreeSet<(u8, &str)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| (paper.tasks[*id].difficulty, *id))
        .collect();

    let mut order = Vec::with_capacity(paper.tasks.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(&paper.tasks[id]);

        for &child in children.get(id).into_iter().flatten() {
            let degree = in_degree.get_mut(child).expect("child has an in-degree");
            *degree -= 1;
            if *degree == 0 {
                ready.insert((paper.tasks[child].difficulty, child));
            }
        }
    }

    if order.len() < paper.tasks.len() {
        let ordered: HashSet<&str> = order.iter().map(|t| t.task_id.as_str()).collect();
        return Err(DependencyCycleError {
            paper_id: paper.paper_id.clone(),
            cycle: find_cycle(paper, &ordered),
        });
    }

    debug!(
        "Resolved {} task(s) for paper '{}'",
        order.len(),
        paper.paper_id
    );
    Ok(order)
}

/// Parents of `task` that are not in the resolved set. A task with any
/// unmet parent is skipped with reason `unmet_dependency` rather than
/// attempted.
pub fn unmet_parents<'a>(task: &'a Task, resolved: &HashSet<String>) -> Vec<&'a str> {
    task.parents
        .iter()
        .filter(|parent| !resolved.contains(parent.as_str()))
        .map(String::as_str)
        .collect()
}

/// Walks the parent edges among unordered tasks until a task repeats,
/// reconstructing one concrete cycle for the error message.
fn find_cycle(paper: &Paper, ordered: &HashSet<&str>) -> Vec<String> {
    let start = paper
        .tasks
        .values()
        .map(|t| t.task_id.as_str())
        .filter(|id| !ordered.contains(id))
        .min()
        .expect("at least one task is stuck in a cycle");

    let mut path = vec![start];
    let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let next = paper.tasks[current]
            .parents
            .iter()
            .map(String::as_str)
            .find(|parent| !ordered.contains(parent))
            .expect("a stuck task has a stuck parent");

        if let Some(&at) = seen.get(next) {
            let mut cycle: Vec<String> = path[at..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
