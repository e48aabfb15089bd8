use crate::types::TaskId;
use crate::StateError;
use std::collections::HashMap;

/// Ordered group of tasks with named edges, built before the tasks join a
/// change.
///
/// Edges name boundary tasks so another builder can chain onto this set
/// without knowing its internal wiring. The set holds only ids; wiring
/// itself is recorded on the tasks through the state guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
    edges: HashMap<String, TaskId>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut ts = Self::new();
        for t in tasks {
            ts.add_task(t);
        }
        ts
    }

    pub fn add_task(&mut self, task: TaskId) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    /// Append every task of `other`, keeping its edges.
    pub fn add_all(&mut self, other: &TaskSet) {
        for t in &other.tasks {
            self.add_task(*t);
        }
        for (name, task) in &other.edges {
            self.edges.insert(name.clone(), *task);
        }
    }

    pub fn mark_edge(&mut self, task: TaskId, name: &str) {
        self.edges.insert(name.to_owned(), task);
    }

    pub fn edge(&self, name: &str) -> Result<TaskId, StateError> {
        self.maybe_edge(name)
            .ok_or_else(|| StateError::MissingEdge(name.to_owned()))
    }

    pub fn maybe_edge(&self, name: &str) -> Option<TaskId> {
        self.edges.get(name).copied()
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.contains(&task)
    }
}
