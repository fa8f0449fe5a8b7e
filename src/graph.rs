//! Dependency graph over a ledger snapshot.
//!
//! A [`TaskGraph`] is built once per scheduling round from an immutable copy
//! of the ledger and never mutated afterwards. When the ledger changes shape
//! (decomposition added tasks) the scheduler simply builds a new one.
//!
//! # Invariants
//! - Every dependency id resolves to a task in the snapshot
//! - The dependency relation is acyclic
//! - All queries are deterministic: ties break on `(priority, id)`

use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap};

use crate::task::{ExecutionMode, Task, TaskId, TaskStatus};

/// Structural problems that make a task set unschedulable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id {0}")]
    DuplicateTask(TaskId),
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A group of tasks dispatched together and joined before the next group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRound {
    pub mode: ExecutionMode,
    pub tasks: Vec<TaskId>,
}

/// Two tasks in the same concurrent round that declare the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub first: TaskId,
    pub second: TaskId,
    pub path: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Immutable DAG built from a ledger snapshot.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, Task>,
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskGraph {
    /// Validate and build the graph.
    ///
    /// # Errors
    /// - `DuplicateTask` if two tasks share an id
    /// - `UnknownDependency` if a dependency does not resolve
    /// - `Cycle` with the offending chain if the relation is cyclic
    pub fn build(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for task in tasks {
            if by_id.contains_key(&task.id) {
                return Err(GraphError::DuplicateTask(task.id));
            }
            by_id.insert(task.id.clone(), task);
        }

        let mut dependents: HashMap<TaskId, BTreeSet<TaskId>> = HashMap::new();
        for task in by_id.values() {
            for dep in &task.dependencies {
                if !by_id.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(task.id.clone());
            }
        }

        let graph = Self {
            tasks: by_id,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// DFS with white/gray/black coloring. Reaching a gray node means the
    /// current path loops back on itself.
    ///
    /// Iterative, so chain depth is bounded by memory rather than the stack.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut colors: HashMap<&TaskId, Color> =
            self.tasks.keys().map(|id| (id, Color::White)).collect();

        for root in self.tasks.keys() {
            if colors[root] != Color::White {
                continue;
            }
            colors.insert(root, Color::Gray);
            let mut path: Vec<(&TaskId, btree_set::Iter<'_, TaskId>)> =
                vec![(root, self.tasks[root].dependencies.iter())];

            while let Some((id, deps)) = path.last_mut() {
                let Some(dep) = deps.next() else {
                    colors.insert(*id, Color::Black);
                    path.pop();
                    continue;
                };
                match colors[dep] {
                    Color::Black => {}
                    Color::Gray => {
                        let start = path.iter().position(|(p, _)| *p == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            path[start..].iter().map(|(p, _)| (*p).clone()).collect();
                        cycle.push(dep.clone());
                        return Err(GraphError::Cycle { path: cycle });
                    }
                    Color::White => {
                        colors.insert(dep, Color::Gray);
                        path.push((dep, self.tasks[dep].dependencies.iter()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Tasks that list `id` as a direct dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependencies of `id` that are not yet verified.
    pub fn unsatisfied_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(task) = self.tasks.get(id) else {
            return Vec::new();
        };
        task.dependencies
            .iter()
            .filter(|dep| !self.tasks[*dep].status().satisfies_dependency())
            .cloned()
            .collect()
    }

    fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.tasks[dep].status().satisfies_dependency())
    }

    fn sort_by_dispatch_key(&self, ids: &mut [TaskId]) {
        ids.sort_by(|a, b| self.tasks[a].dispatch_key().cmp(&self.tasks[b].dispatch_key()));
    }

    /// Tasks eligible for dispatch: waiting status, every dependency verified.
    ///
    /// Ordered by `(priority asc, id asc)`.
    pub fn ready_set(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status().is_waiting() && self.dependencies_satisfied(t))
            .map(|t| t.id.clone())
            .collect();
        self.sort_by_dispatch_key(&mut ready);
        ready
    }

    /// Waiting tasks whose dependencies are not all verified.
    pub fn waiting_on_dependencies(&self) -> Vec<TaskId> {
        let mut waiting: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status().is_waiting() && !self.dependencies_satisfied(t))
            .map(|t| t.id.clone())
            .collect();
        self.sort_by_dispatch_key(&mut waiting);
        waiting
    }

    /// Tasks left `Dispatched` (or mid-pipeline) by an interrupted run.
    pub fn interrupted(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status().is_in_flight())
            .map(|t| t.id.clone())
            .collect();
        self.sort_by_dispatch_key(&mut ids);
        ids
    }

    /// Split `ready` into dispatch rounds.
    ///
    /// Parallel tasks with identical dependency sets share a round. Every
    /// sequential task gets a round of its own, in `(priority, id)` order.
    /// Rounds are ordered by their first task.
    pub fn dispatch_rounds(&self, ready: &[TaskId]) -> Vec<DispatchRound> {
        let mut ordered: Vec<TaskId> = ready
            .iter()
            .filter(|id| self.tasks.contains_key(*id))
            .cloned()
            .collect();
        self.sort_by_dispatch_key(&mut ordered);

        let mut parallel_groups: Vec<(BTreeSet<TaskId>, Vec<TaskId>)> = Vec::new();
        let mut rounds: Vec<DispatchRound> = Vec::new();

        for id in ordered {
            let task = &self.tasks[&id];
            match task.execution_mode {
                ExecutionMode::Sequential => rounds.push(DispatchRound {
                    mode: ExecutionMode::Sequential,
                    tasks: vec![id],
                }),
                ExecutionMode::Parallel => {
                    match parallel_groups
                        .iter_mut()
                        .find(|(deps, _)| *deps == task.dependencies)
                    {
                        Some((_, members)) => members.push(id),
                        None => parallel_groups.push((task.dependencies.clone(), vec![id])),
                    }
                }
            }
        }

        rounds.extend(parallel_groups.into_iter().map(|(_, tasks)| DispatchRound {
            mode: ExecutionMode::Parallel,
            tasks,
        }));
        // Stable: members are already sorted, so the first task is the key.
        rounds.sort_by(|a, b| {
            self.tasks[&a.tasks[0]]
                .dispatch_key()
                .cmp(&self.tasks[&b.tasks[0]].dispatch_key())
        });
        rounds
    }

    /// Escalated tasks somewhere in the dependency closure of `id`.
    pub fn escalated_ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&TaskId> = match self.tasks.get(id) {
            Some(task) => task.dependencies.iter().collect(),
            None => return Vec::new(),
        };

        while let Some(dep) = stack.pop() {
            if !seen.insert(dep) {
                continue;
            }
            let task = &self.tasks[dep];
            if task.status() == TaskStatus::Escalated {
                found.insert(dep.clone());
            }
            stack.extend(task.dependencies.iter());
        }
        found.into_iter().collect()
    }

    /// Waiting tasks that can never run in this run because an ancestor escalated.
    pub fn blocked_by_escalation(&self) -> Vec<TaskId> {
        self.waiting_on_dependencies()
            .into_iter()
            .filter(|id| !self.escalated_ancestors(id).is_empty())
            .collect()
    }

    /// Advisory overlap report for tasks that will run concurrently.
    pub fn file_conflicts(&self, round: &DispatchRound) -> Vec<FileConflict> {
        let mut owners: BTreeMap<&str, &TaskId> = BTreeMap::new();
        let mut conflicts = Vec::new();
        for id in &round.tasks {
            for path in &self.tasks[id].files_touched {
                match owners.get(path.as_str()) {
                    Some(first) => conflicts.push(FileConflict {
                        first: (*first).clone(),
                        second: id.clone(),
                        path: path.clone(),
                    }),
                    None => {
                        owners.insert(path.as_str(), id);
                    }
                }
            }
        }
        conflicts
    }

    /// Full topological order (dependencies first), ties on `(priority, id)`.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: HashMap<&TaskId, usize> = self
            .tasks
            .values()
            .map(|t| (&t.id, t.dependencies.len()))
            .collect();

        let mut queue: BTreeSet<(u32, &TaskId)> = self
            .tasks
            .values()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.dispatch_key())
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(next) = queue.pop_first() {
            let id = next.1;
            order.push(id.clone());
            if let Some(children) = self.dependents.get(id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.insert(self.tasks[child].dispatch_key());
                        }
                    }
                }
            }
        }
        order
    }
}
