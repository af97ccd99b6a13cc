use drover_lib::TaskAddress;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Edge type between a task and its parent.
///
/// `Proof` edges are never speculatable: the parent's proof must be
/// confirmed on-chain before the child may run.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    None,
    Data,
    Order,
    Proof,
}

/// Scheduler-side status of a graph node. `Completed` and `Failed` are
/// terminal.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

/// A task in the dependency graph. Depth is fixed at insertion; status
/// is advanced by the pipeline.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct TaskNode {
    pub task_address: TaskAddress,
    pub parent_address: Option<TaskAddress>,
    pub dependency_type: DependencyType,
    pub depth: u32,
    pub status: NodeStatus,
    pub child_addresses: Vec<TaskAddress>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0} already exists")]
    DuplicateNode(TaskAddress),

    #[error("parent {0} not found")]
    ParentNotFound(TaskAddress),

    #[error("adding {0} would create a cycle")]
    CycleDetected(TaskAddress),

    #[error("node {0} not found")]
    NodeNotFound(TaskAddress),

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: NodeStatus, to: NodeStatus },
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Directed acyclic graph of task nodes, edges by address. Nodes are
/// never deleted while still an ancestor of a live node; the executor
/// holds the graph behind its own lock.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskAddress, TaskNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node under `parent_address`. Depth is `0` for roots and
    /// `parent.depth + 1` otherwise, computed here and never mutated.
    pub fn add_node(
        &mut self,
        task_address: TaskAddress,
        parent_address: Option<TaskAddress>,
        dependency_type: DependencyType,
    ) -> GraphResult<TaskNode> {
        if self.nodes.contains_key(&task_address) {
            return Err(GraphError::DuplicateNode(task_address));
        }

        let depth = match parent_address {
            None => 0,
            Some(parent) => {
                self.check_no_cycle(task_address, parent)?;
                let parent_node = self
                    .nodes
                    .get(&parent)
                    .ok_or(GraphError::ParentNotFound(parent))?;
                parent_node.depth + 1
            }
        };

        let node = TaskNode {
            task_address,
            parent_address,
            dependency_type,
            depth,
            status: NodeStatus::Pending,
            child_addresses: Vec::new(),
        };
        self.nodes.insert(task_address, node.clone());

        if let Some(parent) = parent_address {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.child_addresses.push(task_address);
            }
        }

        tracing::debug!(
            "DependencyGraph.add_node: {task_address} depth={depth} type={dependency_type:?}"
        );
        Ok(node)
    }

    /// Walk the ancestor chain of `parent`; meeting `candidate` on the
    /// way up means the edge would close a cycle.
    fn check_no_cycle(&self, candidate: TaskAddress, parent: TaskAddress) -> GraphResult<()> {
        let mut cursor = Some(parent);
        while let Some(addr) = cursor {
            if addr == candidate {
                return Err(GraphError::CycleDetected(candidate));
            }
            cursor = self.nodes.get(&addr).and_then(|n| n.parent_address);
        }
        Ok(())
    }

    pub fn get(&self, task_address: &TaskAddress) -> Option<&TaskNode> {
        self.nodes.get(task_address)
    }

    pub fn depth_of(&self, task_address: &TaskAddress) -> Option<u32> {
        self.nodes.get(task_address).map(|n| n.depth)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// BFS descendants of `root`, excluding the root itself. Order is
    /// deterministic: children in insertion order, level by level.
    pub fn descendants_of(&self, root: &TaskAddress) -> Vec<TaskAddress> {
        let mut out = Vec::new();
        let mut queue: VecDeque<TaskAddress> = match self.nodes.get(root) {
            Some(node) => node.child_addresses.iter().copied().collect(),
            None => return out,
        };
        while let Some(addr) = queue.pop_front() {
            out.push(addr);
            if let Some(node) = self.nodes.get(&addr) {
                queue.extend(node.child_addresses.iter().copied());
            }
        }
        out
    }

    /// Ancestors of `addr` whose proof is not yet confirmed (status not
    /// `Completed`), nearest first.
    pub fn unconfirmed_ancestors(&self, addr: &TaskAddress) -> Vec<TaskAddress> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(addr).and_then(|n| n.parent_address);
        while let Some(parent) = cursor {
            match self.nodes.get(&parent) {
                Some(node) => {
                    if node.status != NodeStatus::Completed {
                        out.push(parent);
                    }
                    cursor = node.parent_address;
                }
                None => break,
            }
        }
        out
    }

    /// Advance a node's status. Legal moves: `Pending -> Executing`,
    /// `Executing -> Completed | Failed`, and `Pending -> Failed` for
    /// descendants aborted before they started.
    pub fn update_status(
        &mut self,
        task_address: &TaskAddress,
        status: NodeStatus,
    ) -> GraphResult<()> {
        let node = self
            .nodes
            .get_mut(task_address)
            .ok_or(GraphError::NodeNotFound(*task_address))?;

        let allowed = matches!(
            (node.status, status),
            (NodeStatus::Pending, NodeStatus::Executing)
                | (NodeStatus::Pending, NodeStatus::Failed)
                | (NodeStatus::Executing, NodeStatus::Completed)
                | (NodeStatus::Executing, NodeStatus::Failed)
        );
        if !allowed {
            return Err(GraphError::InvalidTransition {
                from: node.status,
                to: status,
            });
        }
        node.status = status;
        Ok(())
    }
}
