//! Task graph - declared tasks, dependency edges and per-run node state

use super::retry::RetryPolicy;
use crate::error::BuildError;
use crate::operators::Operator;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Node state within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A unit of work plus its state for the current run
#[derive(Debug, Clone)]
pub struct TaskNode {
    id: String,
    operator: Arc<dyn Operator>,
    upstream: Vec<String>,
    retry: RetryPolicy,
    state: TaskState,
    attempts: u32,
    last_error: Option<String>,
    skipped_because: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, operator: Arc<dyn Operator>) -> Self {
        Self {
            id: id.into(),
            operator,
            upstream: Vec::new(),
            retry: RetryPolicy::default(),
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
            skipped_because: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Tasks that must succeed before this one may start
    pub fn depends_on<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in upstream {
            push_unique(&mut self.upstream, id.into());
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operator(&self) -> &Arc<dyn Operator> {
        &self.operator
    }

    pub fn upstream(&self) -> &[String] {
        &self.upstream
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn skipped_because(&self) -> Option<&str> {
        self.skipped_because.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn skip(&mut self, because: &str) {
        self.state = TaskState::Skipped;
        self.skipped_because = Some(because.to_string());
        self.finished_at = Some(Utc::now());
    }
}

fn push_unique(list: &mut Vec<String>, id: String) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// Dependency edge: `downstream` runs only after `upstream` succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub downstream: String,
    pub upstream: String,
}

impl Edge {
    pub fn new(downstream: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            downstream: downstream.into(),
            upstream: upstream.into(),
        }
    }
}

/// How a dispatched task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Validated, acyclic task graph for a single run.
///
/// The shape is fixed at `build`; only node state changes afterwards.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    downstream: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Validate ids and edges, and reject cycles
    pub fn build(nodes: Vec<TaskNode>, edges: Vec<Edge>) -> Result<Self, BuildError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(BuildError::DuplicateId(node.id.clone()));
            }
        }

        let mut nodes = nodes;
        for edge in edges {
            let Some(&i) = index.get(&edge.downstream) else {
                return Err(BuildError::UnknownTask(edge.downstream));
            };
            push_unique(&mut nodes[i].upstream, edge.upstream);
        }

        let mut downstream = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for up in &node.upstream {
                if up == &node.id {
                    return Err(BuildError::SelfDependency(node.id.clone()));
                }
                let Some(&j) = index.get(up) else {
                    return Err(BuildError::DanglingEdge {
                        task: node.id.clone(),
                        upstream: up.clone(),
                    });
                };
                downstream[j].push(i);
            }
        }

        let graph = Self {
            nodes,
            index,
            downstream,
        };

        if let Some(cycle) = graph.find_cycle() {
            let path = cycle
                .iter()
                .map(|&i| graph.nodes[i].id.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(BuildError::Cycle { path });
        }

        Ok(graph)
    }

    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();
        (0..self.nodes.len()).find_map(|start| {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut path)
            } else {
                None
            }
        })
    }

    fn visit(&self, i: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[i] = Mark::OnPath;
        path.push(i);

        for &next in &self.downstream[i] {
            match marks[next] {
                Mark::OnPath => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[i] = Mark::Done;
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Ids of the tasks that depend directly on `id`
    pub fn downstream_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.downstream[i]
                    .iter()
                    .map(|&j| self.nodes[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending nodes whose every dependency has succeeded
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|node| node.state == TaskState::Pending && self.can_start(node))
            .collect()
    }

    fn can_start(&self, node: &TaskNode) -> bool {
        node.upstream.iter().all(|up| {
            self.get(up)
                .map(|dep| dep.state == TaskState::Succeeded)
                .unwrap_or(false)
        })
    }

    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let Some(&i) = self.index.get(id) else {
            anyhow::bail!("Task {} not found", id)
        };
        let node = &mut self.nodes[i];
        if node.state != TaskState::Pending {
            anyhow::bail!("Task {} cannot start from state {}", id, node.state);
        }
        node.state = TaskState::Running;
        node.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record how a running task ended.
    ///
    /// A failure skips every still-pending task reachable downstream; the
    /// ids of the newly skipped tasks are returned.
    pub fn mark_result(&mut self, id: &str, completion: Completion) -> Result<Vec<String>> {
        let Some(&i) = self.index.get(id) else {
            anyhow::bail!("Task {} not found", id)
        };
        let node = &mut self.nodes[i];
        if node.state != TaskState::Running {
            anyhow::bail!("Task {} is not running (state {})", id, node.state);
        }
        node.finished_at = Some(Utc::now());

        match completion {
            Completion::Succeeded { attempts } => {
                node.state = TaskState::Succeeded;
                node.attempts = attempts;
                Ok(Vec::new())
            }
            Completion::Failed { attempts, error } => {
                node.state = TaskState::Failed;
                node.attempts = attempts;
                node.last_error = Some(error);
                Ok(self.skip_downstream(i))
            }
        }
    }

    fn skip_downstream(&mut self, root: usize) -> Vec<String> {
        let because = self.nodes[root].id.clone();
        let mut skipped = Vec::new();
        let mut queue: VecDeque<usize> = self.downstream[root].iter().copied().collect();

        while let Some(i) = queue.pop_front() {
            // each node is skipped once; already-terminal nodes stop the walk
            if self.nodes[i].state != TaskState::Pending {
                continue;
            }
            self.nodes[i].skip(&because);
            skipped.push(self.nodes[i].id.clone());
            queue.extend(self.downstream[i].iter().copied());
        }

        skipped
    }

    /// Skip every task that never got dispatched
    pub fn skip_pending(&mut self, because: &str) -> Vec<String> {
        self.nodes
            .iter_mut()
            .filter(|node| node.state == TaskState::Pending)
            .map(|node| {
                node.skip(because);
                node.id.clone()
            })
            .collect()
    }

    /// Every node reached a terminal state
    pub fn is_exhausted(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    /// A valid execution order (Kahn's algorithm, ties in declaration order)
    pub fn topological_order(&self) -> Vec<&str> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.upstream.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(self.nodes[i].id.as_str());
            for &j in &self.downstream[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }

        order
    }
}
