//! The lazy pipelined graph executor.
//!
//! Two cooperating threads drain the operation DAG: the issue thread pulls
//! ready nodes up to the pipeline-depth budget and submits them to the node
//! executor (staging operand prefetch along the way); the completion thread
//! polls the in-flight handles in FIFO order, releasing successors as nodes
//! settle. A separate queue carries whole tensor networks for network-level
//! backends with its own, shallower pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::debug;
use num_complex::Complex64;

use crate::dag::graph::OpDag;
use crate::error::TneError;
use crate::runtime::node_executor::{NodeExecutor, OpHandle};
use crate::tensornetwork::network::TensorNetwork;
use crate::types::NodeId;

/// Default number of operations in flight.
pub const DEFAULT_PIPELINE_DEPTH: usize = 16;

/// Default number of upcoming operations with staged operands.
pub const DEFAULT_PREFETCH_DEPTH: usize = 4;

/// Pipeline depth of the whole-network queue.
pub const NETWORK_PIPELINE_DEPTH: usize = 2;

#[derive(Default)]
struct Inflight {
    queue: Mutex<VecDeque<(NodeId, OpHandle)>>,
    cv: Condvar,
    closed: AtomicBool,
}

/// Pipelined executor over one operation DAG.
pub struct LazyGraphExecutor {
    dag: Arc<OpDag>,
    issue: Option<JoinHandle<()>>,
    completion: Option<JoinHandle<()>>,
}

impl LazyGraphExecutor {
    /// Starts the issue and completion threads over the DAG and node
    /// executor. The executor runs until [`LazyGraphExecutor::shutdown`].
    #[must_use]
    pub fn start(
        dag: Arc<OpDag>,
        node_executor: Arc<dyn NodeExecutor>,
        pipeline_depth: usize,
        prefetch_depth: usize,
    ) -> Self {
        assert!(pipeline_depth > 0, "pipeline depth must be positive");
        let inflight = Arc::new(Inflight::default());

        let issue = {
            let dag = Arc::clone(&dag);
            let node_executor = Arc::clone(&node_executor);
            let inflight = Arc::clone(&inflight);
            std::thread::Builder::new()
                .name("tne-issue".to_string())
                .spawn(move || {
                    issue_loop(&dag, node_executor.as_ref(), &inflight, pipeline_depth, prefetch_depth);
                })
                .expect("failed to spawn the issue thread")
        };
        let completion = {
            let dag = Arc::clone(&dag);
            let inflight = Arc::clone(&inflight);
            std::thread::Builder::new()
                .name("tne-completion".to_string())
                .spawn(move || {
                    completion_loop(&dag, node_executor.as_ref(), &inflight);
                })
                .expect("failed to spawn the completion thread")
        };
        Self {
            dag,
            issue: Some(issue),
            completion: Some(completion),
        }
    }

    /// Drains outstanding work and stops both threads. New submissions to
    /// the DAG are refused from this point on.
    pub fn shutdown(&mut self) {
        self.dag.shutdown();
        if let Some(issue) = self.issue.take() {
            let _ = issue.join();
        }
        if let Some(completion) = self.completion.take() {
            let _ = completion.join();
        }
    }
}

impl Drop for LazyGraphExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn issue_loop(
    dag: &OpDag,
    node_executor: &dyn NodeExecutor,
    inflight: &Inflight,
    pipeline_depth: usize,
    prefetch_depth: usize,
) {
    loop {
        // Respect the in-flight budget before pulling more work.
        let room = {
            let mut queue = inflight.queue.lock().unwrap();
            while queue.len() >= pipeline_depth {
                queue = inflight.cv.wait(queue).unwrap();
            }
            pipeline_depth - queue.len()
        };
        let batch = dag.acquire_ready(room);
        if batch.is_empty() {
            // Shut down and drained: let the completion loop finish.
            inflight.closed.store(true, Ordering::Release);
            inflight.cv.notify_all();
            debug!("issue loop drained");
            return;
        }
        // Stage operands of the upcoming frontier. Prefetch never reorders
        // execution; it is purely a hint to the backend.
        if prefetch_depth > 0 {
            for upcoming in dag.prefetch_candidates(prefetch_depth) {
                node_executor.prefetch(&upcoming);
            }
        }
        for op in batch {
            let id = op.id();
            match node_executor.submit(op) {
                Ok(handle) => {
                    inflight.queue.lock().unwrap().push_back((id, handle));
                    inflight.cv.notify_all();
                }
                Err(error) => dag.mark_failed(id, error.to_string()),
            }
        }
    }
}

fn completion_loop(dag: &OpDag, node_executor: &dyn NodeExecutor, inflight: &Inflight) {
    loop {
        let entry = {
            let mut queue = inflight.queue.lock().unwrap();
            loop {
                if let Some(entry) = queue.pop_front() {
                    break Some(entry);
                }
                if inflight.closed.load(Ordering::Acquire) {
                    break None;
                }
                queue = inflight.cv.wait(queue).unwrap();
            }
        };
        let Some((id, handle)) = entry else {
            debug!("completion loop drained");
            return;
        };
        match node_executor.sync(handle) {
            Ok(()) => dag.mark_complete(id),
            Err(error) => dag.mark_failed(id, error.to_string()),
        }
        inflight.cv.notify_all();
    }
}

/// A whole tensor network dispatched to a network-level backend.
#[derive(Debug, Clone)]
pub struct NetworkTask {
    /// The finalized network to evaluate.
    pub network: TensorNetwork,
    /// Name of the accumulated output tensor; the single write dependency of
    /// the task.
    pub output: String,
    /// Scale applied to the network value before accumulation.
    pub coefficient: Complex64,
}

/// Backend contract for evaluating whole tensor networks in one submission.
pub trait NetworkExecutor: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Submits a network for evaluation into its output tensor.
    fn submit_network(&self, task: NetworkTask) -> Result<OpHandle, TneError>;

    /// Blocks until the network evaluation settles.
    fn sync_network(&self, handle: OpHandle) -> Result<(), TneError>;
}

/// FIFO queue of whole-network tasks with its own pipeline depth.
pub struct TensorNetworkQueue {
    tasks: Mutex<VecDeque<NetworkTask>>,
    pipeline_depth: usize,
}

impl Default for TensorNetworkQueue {
    fn default() -> Self {
        Self::new(NETWORK_PIPELINE_DEPTH)
    }
}

impl TensorNetworkQueue {
    /// Creates a queue with the given pipeline depth.
    #[must_use]
    pub fn new(pipeline_depth: usize) -> Self {
        assert!(pipeline_depth > 0, "pipeline depth must be positive");
        Self {
            tasks: Mutex::new(VecDeque::new()),
            pipeline_depth,
        }
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a task.
    pub fn push(&self, task: NetworkTask) {
        self.tasks.lock().unwrap().push_back(task);
    }

    /// Drains the queue against a network executor, keeping at most the
    /// pipeline depth of networks in flight and completing them in FIFO
    /// order.
    pub fn drain(&self, executor: &dyn NetworkExecutor) -> Result<(), TneError> {
        let mut in_flight: VecDeque<OpHandle> = VecDeque::new();
        loop {
            while in_flight.len() < self.pipeline_depth {
                let Some(task) = self.tasks.lock().unwrap().pop_front() else {
                    break;
                };
                in_flight.push_back(executor.submit_network(task)?);
            }
            match in_flight.pop_front() {
                Some(handle) => executor.sync_network(handle)?,
                None => return Ok(()),
            }
        }
    }
}
