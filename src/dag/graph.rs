//! The append-only operation DAG.
//!
//! Dependencies are computed at insertion from a per-tensor writer/reader
//! table, so insertion order is always a valid topological order and the
//! graph is acyclic by construction. One mutex guards the node table;
//! condition variables signal readiness and completion.

use std::sync::{Condvar, Mutex};

use rustc_hash::FxHashMap;

use crate::dag::operation::TensorOperation;
use crate::error::TneError;
use crate::types::{NodeId, TensorOpCode};
use crate::utils::HashMapInsertNew;

/// Execution state of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for predecessors.
    Pending,
    /// Submitted to a node executor.
    Executing,
    /// Finished; successors released.
    Completed,
    /// The backend failed the node or a predecessor failed.
    Failed,
}

#[derive(Debug)]
struct DagNode {
    op: TensorOperation,
    state: NodeState,
    unmet: usize,
    successors: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct TensorAccess {
    last_writer: Option<NodeId>,
    readers: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct DagInner {
    nodes: FxHashMap<NodeId, DagNode>,
    table: FxHashMap<String, TensorAccess>,
    next_id: NodeId,
    live_nodes: usize,
    shutdown: bool,
    failures: FxHashMap<NodeId, String>,
}

impl DagInner {
    fn is_settled(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .map_or(true, |n| matches!(n.state, NodeState::Completed | NodeState::Failed))
    }

    fn tensor_failure(&self, name: &str) -> Option<TneError> {
        let access = self.table.get(name)?;
        access
            .last_writer
            .iter()
            .chain(access.readers.iter())
            .find_map(|id| {
                self.failures.get(id).map(|message| TneError::BackendFailure {
                    node: *id,
                    message: message.clone(),
                })
            })
    }

    fn tensor_quiet(&self, name: &str) -> bool {
        self.table.get(name).map_or(true, |access| {
            access.last_writer.map_or(true, |w| self.is_settled(w))
                && access.readers.iter().all(|&r| self.is_settled(r))
        })
    }
}

/// Thread-safe operation DAG shared by the client API and the executor.
#[derive(Debug, Default)]
pub struct OpDag {
    inner: Mutex<DagInner>,
    ready_cv: Condvar,
    done_cv: Condvar,
}

impl OpDag {
    /// Creates an empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation, wiring its data-flow dependencies: reads depend
    /// on the latest writer of each operand, writes additionally depend on
    /// all readers since that writer. Returns the assigned node id.
    pub fn append(&self, mut op: TensorOperation) -> Result<NodeId, TneError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(TneError::ShutDown);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        op.set_id(id);

        let mut dependencies: Vec<NodeId> = Vec::new();
        for name in op.read_operands() {
            if let Some(access) = inner.table.get(name) {
                dependencies.extend(access.last_writer);
            }
        }
        for name in op.written_operands() {
            if let Some(access) = inner.table.get(name) {
                dependencies.extend(access.last_writer);
                dependencies.extend(access.readers.iter().copied());
            }
        }
        dependencies.sort_unstable();
        dependencies.dedup();

        let mut unmet = 0;
        for dependency in dependencies {
            if !inner.is_settled(dependency) {
                inner
                    .nodes
                    .get_mut(&dependency)
                    .unwrap()
                    .successors
                    .push(id);
                unmet += 1;
            }
        }

        // Update the access table.
        let written: Vec<String> = op.written_operands().map(str::to_string).collect();
        let read: Vec<String> = op.read_operands().map(str::to_string).collect();
        for name in written {
            let access = inner.table.entry(name).or_default();
            access.last_writer = Some(id);
            access.readers.clear();
        }
        for name in read {
            inner.table.entry(name).or_default().readers.push(id);
        }

        inner.nodes.insert_new(
            id,
            DagNode {
                op,
                state: NodeState::Pending,
                unmet,
                successors: Vec::new(),
            },
        );
        inner.live_nodes += 1;
        if unmet == 0 {
            self.ready_cv.notify_all();
        }
        Ok(id)
    }

    /// Ids of the nodes with no unmet predecessors, in insertion order.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        let inner = self.inner.lock().unwrap();
        let mut ready: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.state == NodeState::Pending && node.unmet == 0)
            .map(|(&id, _)| id)
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Atomically pulls up to `max` ready nodes, marking them executing.
    /// Blocks while nothing is ready and work remains; returns an empty batch
    /// once the DAG is shut down and drained, or when `max` is zero.
    #[must_use]
    pub fn acquire_ready(&self, max: usize) -> Vec<TensorOperation> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if max == 0 || (inner.shutdown && inner.live_nodes == 0) {
                return Vec::new();
            }
            let mut batch: Vec<NodeId> = inner
                .nodes
                .iter()
                .filter(|(_, node)| node.state == NodeState::Pending && node.unmet == 0)
                .map(|(&id, _)| id)
                .collect();
            batch.sort_unstable();
            batch.truncate(max);
            if !batch.is_empty() {
                let mut ops = Vec::with_capacity(batch.len());
                for id in batch {
                    let node = inner.nodes.get_mut(&id).unwrap();
                    node.state = NodeState::Executing;
                    ops.push(node.op.clone());
                }
                return ops;
            }
            let has_pending = inner
                .nodes
                .values()
                .any(|node| node.state == NodeState::Pending);
            if inner.shutdown && !has_pending {
                return Vec::new();
            }
            inner = self.ready_cv.wait(inner).unwrap();
        }
    }

    /// Pending ready nodes beyond the executing frontier, for operand
    /// prefetch. Does not change any state.
    #[must_use]
    pub fn prefetch_candidates(&self, depth: usize) -> Vec<TensorOperation> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.state == NodeState::Pending && node.unmet == 0)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids.truncate(depth);
        ids.into_iter()
            .map(|id| inner.nodes[&id].op.clone())
            .collect()
    }

    /// Marks a pending node as executing.
    pub fn mark_executing(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&id).expect("unknown DAG node");
        assert_eq!(node.state, NodeState::Pending, "node {id} is not pending");
        node.state = NodeState::Executing;
    }

    /// Marks a node complete, releasing its successors.
    pub fn mark_complete(&self, id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.get_mut(&id).expect("unknown DAG node");
        assert!(
            matches!(node.state, NodeState::Executing | NodeState::Pending),
            "node {id} completed twice"
        );
        node.state = NodeState::Completed;
        let successors = std::mem::take(&mut node.successors);
        let mut released = false;
        for successor in successors {
            let node = inner.nodes.get_mut(&successor).unwrap();
            node.unmet -= 1;
            released |= node.unmet == 0;
        }
        inner.live_nodes -= 1;
        if released {
            self.ready_cv.notify_all();
        }
        self.done_cv.notify_all();
    }

    /// Marks a node failed and transitively fails everything downstream.
    pub fn mark_failed(&self, id: NodeId, message: String) {
        let mut inner = self.inner.lock().unwrap();
        let mut stack = vec![id];
        inner.failures.insert(id, message.clone());
        while let Some(current) = stack.pop() {
            let Some(node) = inner.nodes.get_mut(&current) else {
                continue;
            };
            if node.state == NodeState::Failed {
                continue;
            }
            node.state = NodeState::Failed;
            let successors = std::mem::take(&mut node.successors);
            inner.live_nodes -= 1;
            inner
                .failures
                .entry(current)
                .or_insert_with(|| format!("failed upstream of node {id}"));
            stack.extend(successors);
        }
        self.ready_cv.notify_all();
        self.done_cv.notify_all();
    }

    /// Blocks until every operation touching the tensor has settled. Fails
    /// with the first backend failure recorded on the tensor.
    pub fn await_tensor(&self, name: &str) -> Result<(), TneError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(error) = inner.tensor_failure(name) {
                return Err(error);
            }
            if inner.tensor_quiet(name) {
                return Ok(());
            }
            inner = self.done_cv.wait(inner).unwrap();
        }
    }

    /// Blocks until the whole DAG has drained. Fails if any node failed.
    pub fn await_all(&self) -> Result<(), TneError> {
        let mut inner = self.inner.lock().unwrap();
        while inner.live_nodes > 0 {
            inner = self.done_cv.wait(inner).unwrap();
        }
        match inner.failures.iter().next() {
            Some((&node, message)) => Err(TneError::BackendFailure {
                node,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Prunes settled (completed or failed) nodes, their failure records, and
    /// the access entries of destroyed tensors whose operations have all
    /// settled.
    pub fn clean_garbage(&self) {
        let mut inner = self.inner.lock().unwrap();
        let destroyed: Vec<String> = inner
            .nodes
            .values()
            .filter(|node| {
                node.state == NodeState::Completed
                    && node.op.opcode() == TensorOpCode::Destroy
            })
            .map(|node| node.op.operands()[0].clone())
            .collect();
        inner
            .nodes
            .retain(|_, node| !matches!(node.state, NodeState::Completed | NodeState::Failed));
        let alive: Vec<NodeId> = inner.nodes.keys().copied().collect();
        inner.failures.retain(|id, _| alive.contains(id));
        for name in destroyed {
            if inner.tensor_quiet(&name) {
                inner.table.remove(&name);
            }
        }
    }

    /// Refuses new submissions and wakes all waiters so outstanding work can
    /// drain.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.ready_cv.notify_all();
        self.done_cv.notify_all();
    }

    /// Whether the DAG refuses new submissions.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shutdown
    }

    /// Number of nodes not yet settled.
    #[must_use]
    pub fn live_nodes(&self) -> usize {
        self.inner.lock().unwrap().live_nodes
    }

    /// Total number of nodes currently stored (including completed ones not
    /// yet garbage-collected).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Whether the DAG stores no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use num_complex::Complex64;

    use crate::dag::operation::{OpKind, TransformKind};
    use crate::tensornetwork::tensor::Tensor;
    use crate::types::ElementType;

    fn create(name: &str) -> TensorOperation {
        TensorOperation::create(Tensor::new(name, vec![2]), ElementType::Complex64)
    }

    fn init(name: &str) -> TensorOperation {
        TensorOperation::new(
            OpKind::Transform {
                kind: TransformKind::InitValue(Complex64::new(0.0, 0.0)),
            },
            vec![name.to_string()],
            vec![],
        )
    }

    fn contract(d: &str, l: &str, r: &str) -> TensorOperation {
        TensorOperation::new(
            OpKind::Contract {
                pattern: String::new(),
            },
            vec![d.to_string(), l.to_string(), r.to_string()],
            vec![Complex64::new(1.0, 0.0)],
        )
    }

    #[test]
    fn test_raw_dependencies() {
        let dag = OpDag::new();
        let create_a = dag.append(create("A")).unwrap();
        let init_a = dag.append(init("A")).unwrap();
        let create_b = dag.append(create("B")).unwrap();
        // Only the two creations are initially ready.
        assert_eq!(dag.ready_nodes(), vec![create_a, create_b]);
        dag.mark_executing(create_a);
        dag.mark_complete(create_a);
        assert_eq!(dag.ready_nodes(), vec![init_a, create_b]);
    }

    #[test]
    fn test_war_and_waw_dependencies() {
        let dag = OpDag::new();
        for name in ["A", "B", "D"] {
            let id = dag.append(create(name)).unwrap();
            dag.mark_executing(id);
            dag.mark_complete(id);
        }
        let read = dag.append(contract("D", "A", "B")).unwrap();
        // A write to a read tensor must wait for the reader (WAR).
        let write_a = dag.append(init("A")).unwrap();
        assert!(dag.ready_nodes().contains(&read));
        assert!(!dag.ready_nodes().contains(&write_a));
        // A second write serializes behind the first (WAW).
        let write_a2 = dag.append(init("A")).unwrap();
        dag.mark_executing(read);
        dag.mark_complete(read);
        assert!(dag.ready_nodes().contains(&write_a));
        assert!(!dag.ready_nodes().contains(&write_a2));
        dag.mark_executing(write_a);
        dag.mark_complete(write_a);
        assert!(dag.ready_nodes().contains(&write_a2));
    }

    #[test]
    fn test_failure_propagates_downstream() {
        let dag = OpDag::new();
        let create_a = dag.append(create("A")).unwrap();
        let init_a = dag.append(init("A")).unwrap();
        dag.mark_executing(create_a);
        dag.mark_failed(create_a, "allocation failed".to_string());
        assert!(matches!(
            dag.await_tensor("A"),
            Err(TneError::BackendFailure { .. })
        ));
        let inner = dag.inner.lock().unwrap();
        assert_eq!(inner.nodes[&init_a].state, NodeState::Failed);
    }

    #[test]
    fn test_await_and_garbage_collection() {
        let dag = OpDag::new();
        let create_a = dag.append(create("A")).unwrap();
        let destroy_a = dag.append(TensorOperation::destroy("A")).unwrap();
        dag.mark_executing(create_a);
        dag.mark_complete(create_a);
        dag.mark_executing(destroy_a);
        dag.mark_complete(destroy_a);
        dag.await_tensor("A").unwrap();
        dag.await_all().unwrap();
        assert_eq!(dag.len(), 2);
        dag.clean_garbage();
        assert!(dag.is_empty());
        assert!(dag.inner.lock().unwrap().table.is_empty());
    }

    #[test]
    fn test_shutdown_refuses_submissions() {
        let dag = OpDag::new();
        dag.shutdown();
        assert!(matches!(dag.append(create("A")), Err(TneError::ShutDown)));
    }
}
