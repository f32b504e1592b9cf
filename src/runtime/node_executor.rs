//! Backend-facing node executor contract and the reference CPU backend.
//!
//! A node executor accepts one primitive tensor operation at a time, returns
//! an opaque handle, and lets the graph executor poll or block on completion.
//! The CPU backend runs kernels on a dedicated worker thread over `ndarray`
//! storage, with factorizations delegated to `nalgebra`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use log::trace;
use nalgebra::{Complex, DMatrix};
use ndarray::{ArrayD, IxDyn, ShapeBuilder, Slice};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dag::operation::{OpKind, SvdAbsorb, TensorOperation, TransformKind};
use crate::error::TneError;
use crate::runtime::memory::{MemoryPool, Span};
use crate::runtime::process_group::GroupRegistry;
use crate::symbolic::{self, SymbolicFactor};
use crate::tensornetwork::tensor::Tensor;
use crate::types::{ElementType, SOME_SPACE};

/// Opaque handle of a submitted operation.
pub type OpHandle = u64;

/// Backend contract: submit one primitive operation, poll or await it, and
/// report accumulated flops.
pub trait NodeExecutor: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Submits an operation for execution, returning a completion handle.
    fn submit(&self, op: TensorOperation) -> Result<OpHandle, TneError>;

    /// Non-blocking completion poll.
    fn test(&self, handle: OpHandle) -> Result<bool, TneError>;

    /// Blocks until the operation settles, surfacing any kernel failure.
    fn sync(&self, handle: OpHandle) -> Result<(), TneError>;

    /// Stages the read operands of an upcoming operation (e.g. host-to-device
    /// copies). Never reorders execution; purely a hint.
    fn prefetch(&self, _op: &TensorOperation) {}

    /// Total flops executed so far.
    fn flops(&self) -> f64;
}

/// One stored tensor: identity plus dense column-major-initializable storage.
#[derive(Debug, Clone)]
pub struct TensorStorage {
    pub tensor: Tensor,
    pub element_type: ElementType,
    pub data: ArrayD<Complex64>,
    span: Span,
}

/// Process-wide tensor storage, fed by a single host memory pool.
pub struct TensorStore {
    entries: RwLock<FxHashMap<String, TensorStorage>>,
    pool: MemoryPool,
}

impl TensorStore {
    /// Creates a store backed by a pool of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            pool: MemoryPool::new(capacity),
        }
    }

    /// The backing memory pool.
    #[must_use]
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Whether a tensor has storage.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap().contains_key(name)
    }

    /// Allocates zero-initialized storage for a tensor.
    pub fn create(&self, tensor: &Tensor, element_type: ElementType) -> Result<(), TneError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(tensor.name()) {
            return Err(TneError::TensorExists(tensor.name().to_string()));
        }
        let bytes = tensor.volume() * element_type.size() as u64;
        let span = self.pool.allocate(bytes)?;
        let shape: Vec<usize> = tensor.shape().iter().map(|&e| e as usize).collect();
        entries.insert(
            tensor.name().to_string(),
            TensorStorage {
                tensor: tensor.clone(),
                element_type,
                data: ArrayD::zeros(IxDyn(&shape)),
                span,
            },
        );
        Ok(())
    }

    /// Releases the storage of a tensor.
    pub fn destroy(&self, name: &str) -> Result<(), TneError> {
        let mut entries = self.entries.write().unwrap();
        let storage = entries
            .remove(name)
            .ok_or_else(|| TneError::UnknownTensor(name.to_string()))?;
        self.pool.release(storage.span);
        Ok(())
    }

    /// Runs a closure over the immutable storage of a tensor.
    pub fn with_storage<R>(
        &self,
        name: &str,
        f: impl FnOnce(&TensorStorage) -> R,
    ) -> Result<R, TneError> {
        let entries = self.entries.read().unwrap();
        let storage = entries
            .get(name)
            .ok_or_else(|| TneError::UnknownTensor(name.to_string()))?;
        Ok(f(storage))
    }

    /// Runs a closure over the mutable storage of a tensor.
    pub fn with_storage_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut TensorStorage) -> R,
    ) -> Result<R, TneError> {
        let mut entries = self.entries.write().unwrap();
        let storage = entries
            .get_mut(name)
            .ok_or_else(|| TneError::UnknownTensor(name.to_string()))?;
        Ok(f(storage))
    }

    /// The identity of a stored tensor.
    pub fn meta(&self, name: &str) -> Result<Tensor, TneError> {
        self.with_storage(name, |storage| storage.tensor.clone())
    }

    /// Flat column-major copy of the elements (leftmost index fastest).
    pub fn read_linear(&self, name: &str) -> Result<Vec<Complex64>, TneError> {
        self.with_storage(name, |storage| column_major(&storage.data))
    }

    /// Overwrites the elements from a flat column-major buffer.
    pub fn write_linear(&self, name: &str, data: &[Complex64]) -> Result<(), TneError> {
        self.with_storage_mut(name, |storage| {
            assert_eq!(data.len() as u64, storage.tensor.volume());
            let shape: Vec<usize> = storage.data.shape().to_vec();
            storage.data = ArrayD::from_shape_vec(IxDyn(&shape).f(), data.to_vec())
                .unwrap()
                .as_standard_layout()
                .to_owned();
        })
    }
}

/// Flattens an array in column-major element order.
fn column_major(data: &ArrayD<Complex64>) -> Vec<Complex64> {
    let reversed: Vec<usize> = (0..data.ndim()).rev().collect();
    data.view()
        .permuted_axes(IxDyn(&reversed))
        .iter()
        .copied()
        .collect()
}

#[derive(Default)]
struct ExecState {
    completed: Mutex<FxHashMap<OpHandle, Result<(), String>>>,
    done_cv: Condvar,
    flops: Mutex<f64>,
}

struct WorkItem {
    handle: OpHandle,
    op: TensorOperation,
}

/// The reference CPU backend: a single worker thread executing `ndarray`
/// kernels with SVD factorizations from `nalgebra`.
pub struct CpuNodeExecutor {
    store: Arc<TensorStore>,
    state: Arc<ExecState>,
    sender: Mutex<Option<Sender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_handle: AtomicU64,
    dry_run: Arc<AtomicBool>,
    fast_math: AtomicBool,
    prefetched: Mutex<FxHashSet<String>>,
}

impl CpuNodeExecutor {
    /// Spawns the backend worker over the shared store and group registry.
    #[must_use]
    pub fn new(store: Arc<TensorStore>, groups: Arc<GroupRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let state = Arc::new(ExecState::default());
        let dry_run = Arc::new(AtomicBool::new(false));
        let worker = {
            let store = Arc::clone(&store);
            let state = Arc::clone(&state);
            let dry_run = Arc::clone(&dry_run);
            std::thread::Builder::new()
                .name("tne-cpu-worker".to_string())
                .spawn(move || {
                    while let Ok(WorkItem { handle, op }) = receiver.recv() {
                        let skip = dry_run.load(Ordering::Relaxed)
                            && !matches!(op.kind(), OpKind::Create { .. } | OpKind::Destroy);
                        let result = if skip {
                            Ok(0.0)
                        } else {
                            execute_op(&store, &groups, &op)
                        };
                        let mut completed = state.completed.lock().unwrap();
                        match result {
                            Ok(flops) => {
                                *state.flops.lock().unwrap() += flops;
                                completed.insert(handle, Ok(()));
                            }
                            Err(message) => {
                                completed.insert(handle, Err(message));
                            }
                        }
                        state.done_cv.notify_all();
                    }
                })
                .expect("failed to spawn the CPU backend worker")
        };
        Self {
            store,
            state,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            next_handle: AtomicU64::new(1),
            dry_run,
            fast_math: AtomicBool::new(false),
            prefetched: Mutex::new(FxHashSet::default()),
        }
    }

    /// The shared tensor store.
    #[must_use]
    pub fn store(&self) -> &Arc<TensorStore> {
        &self.store
    }

    /// Toggles dry-run mode: kernels are skipped, storage bookkeeping is not.
    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::Relaxed);
    }

    /// Toggles fast-math mode. The CPU kernels are unaffected; the flag is
    /// forwarded so accelerated backends may relax accumulation order.
    pub fn set_fast_math(&self, fast_math: bool) {
        self.fast_math.store(fast_math, Ordering::Relaxed);
    }

    /// Whether fast-math mode is active.
    #[must_use]
    pub fn fast_math(&self) -> bool {
        self.fast_math.load(Ordering::Relaxed)
    }

    /// Number of distinct tensors staged by prefetch so far.
    #[must_use]
    pub fn prefetched_tensors(&self) -> usize {
        self.prefetched.lock().unwrap().len()
    }

    /// Stops the worker after draining queued work.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CpuNodeExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NodeExecutor for CpuNodeExecutor {
    fn name(&self) -> &str {
        "cpu-node-executor"
    }

    fn submit(&self, op: TensorOperation) -> Result<OpHandle, TneError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        trace!(handle, opcode:? = op.opcode(); "submitting tensor operation");
        let sender = self.sender.lock().unwrap();
        let sender = sender.as_ref().ok_or(TneError::ShutDown)?;
        sender
            .send(WorkItem { handle, op })
            .map_err(|_| TneError::ShutDown)?;
        Ok(handle)
    }

    fn test(&self, handle: OpHandle) -> Result<bool, TneError> {
        let completed = self.state.completed.lock().unwrap();
        match completed.get(&handle) {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(message)) => Err(TneError::BackendFailure {
                node: handle,
                message: message.clone(),
            }),
        }
    }

    fn sync(&self, handle: OpHandle) -> Result<(), TneError> {
        let mut completed = self.state.completed.lock().unwrap();
        loop {
            if let Some(result) = completed.remove(&handle) {
                return result.map_err(|message| TneError::BackendFailure {
                    node: handle,
                    message,
                });
            }
            completed = self.state.done_cv.wait(completed).unwrap();
        }
    }

    fn prefetch(&self, op: &TensorOperation) {
        let mut prefetched = self.prefetched.lock().unwrap();
        for name in op.read_operands() {
            prefetched.insert(name.to_string());
        }
    }

    fn flops(&self) -> f64 {
        *self.state.flops.lock().unwrap()
    }
}

/// Base offset of one dimension: dimensions in the anonymous space encode it
/// in the subspace slot.
fn dim_offset(tensor: &Tensor, dim: usize) -> u64 {
    let (space, subspace) = tensor.signature()[dim];
    if space == SOME_SPACE {
        subspace
    } else {
        0
    }
}

/// Executes one operation against the store. Returns the flop count.
fn execute_op(
    store: &TensorStore,
    groups: &GroupRegistry,
    op: &TensorOperation,
) -> Result<f64, String> {
    let fail = |error: TneError| error.to_string();
    match op.kind() {
        OpKind::Noop => Ok(0.0),
        OpKind::Create {
            tensor,
            element_type,
        } => {
            store.create(tensor, *element_type).map_err(fail)?;
            Ok(0.0)
        }
        OpKind::Destroy => {
            store.destroy(&op.operands()[0]).map_err(fail)?;
            Ok(0.0)
        }
        OpKind::Transform { kind } => {
            transform_kernel(store, &op.operands()[0], kind).map_err(fail)
        }
        OpKind::Slice => slice_kernel(store, &op.operands()[0], &op.operands()[1]).map_err(fail),
        OpKind::Insert => insert_kernel(store, &op.operands()[0], &op.operands()[1]).map_err(fail),
        OpKind::Add { pattern } => {
            let alpha = op.scalars().first().copied().unwrap_or(Complex64::new(1.0, 0.0));
            add_kernel(store, pattern, alpha)
        }
        OpKind::Contract { pattern } => {
            let alpha = op.scalars().first().copied().unwrap_or(Complex64::new(1.0, 0.0));
            contract_kernel(store, pattern, alpha)
        }
        OpKind::DecomposeSvd3 { pattern } => svd_kernel(store, op.operands(), pattern, None),
        OpKind::DecomposeSvd2 { pattern, absorb } => {
            svd_kernel(store, op.operands(), pattern, Some(*absorb))
        }
        OpKind::OrthogonalizeSvd => orthogonalize_svd_kernel(store, &op.operands()[0]),
        OpKind::OrthogonalizeMgs => orthogonalize_mgs_kernel(store, &op.operands()[0]),
        OpKind::Fetch { from } => {
            let data = groups
                .world()
                .comm()
                .recv(*from as usize)
                .map_err(fail)?;
            store.write_linear(&op.operands()[0], &data).map_err(fail)?;
            Ok(0.0)
        }
        OpKind::Upload { to } => {
            let data = store.read_linear(&op.operands()[0]).map_err(fail)?;
            groups
                .world()
                .comm()
                .send(&data, *to as usize)
                .map_err(fail)?;
            Ok(0.0)
        }
        OpKind::Broadcast { root, group } => {
            let group = groups
                .get(*group)
                .ok_or_else(|| format!("unknown process group {group}"))?;
            let mut data = store.read_linear(&op.operands()[0]).map_err(fail)?;
            group.comm().broadcast(&mut data, *root as usize).map_err(fail)?;
            store.write_linear(&op.operands()[0], &data).map_err(fail)?;
            Ok(0.0)
        }
        OpKind::Allreduce { group } => {
            let group = groups
                .get(*group)
                .ok_or_else(|| format!("unknown process group {group}"))?;
            let mut data = store.read_linear(&op.operands()[0]).map_err(fail)?;
            group.comm().allreduce_sum(&mut data).map_err(fail)?;
            store.write_linear(&op.operands()[0], &data).map_err(fail)?;
            Ok(0.0)
        }
    }
}

fn transform_kernel(
    store: &TensorStore,
    name: &str,
    kind: &TransformKind,
) -> Result<f64, TneError> {
    store.with_storage_mut(name, |storage| match kind {
        TransformKind::InitValue(value) => {
            storage.data.fill(*value);
            Ok(0.0)
        }
        TransformKind::InitRandom { seed } => {
            let mut rng = StdRng::seed_from_u64(*seed);
            let complex = storage.element_type.is_complex();
            for element in storage.data.iter_mut() {
                let re = rng.gen_range(-1.0..=1.0);
                let im = if complex { rng.gen_range(-1.0..=1.0) } else { 0.0 };
                *element = Complex64::new(re, im);
            }
            Ok(storage.data.len() as f64)
        }
        TransformKind::InitData(data) => {
            if data.len() as u64 != storage.tensor.volume() {
                return Err(TneError::ShapeMismatch(format!(
                    "init data has {} elements, tensor `{name}` has {}",
                    data.len(),
                    storage.tensor.volume()
                )));
            }
            let shape: Vec<usize> = storage.data.shape().to_vec();
            storage.data = ArrayD::from_shape_vec(IxDyn(&shape).f(), data.clone())
                .unwrap()
                .as_standard_layout()
                .to_owned();
            Ok(0.0)
        }
        TransformKind::Scale(factor) => {
            storage.data.mapv_inplace(|element| element * factor);
            Ok(storage.data.len() as f64)
        }
    })?
}

/// Extracts `slice` out of `source` at the offsets encoded in the slice
/// tensor's signature, relative to the source's own offsets.
fn slice_kernel(store: &TensorStore, slice: &str, source: &str) -> Result<f64, TneError> {
    let slice_meta = store.meta(slice)?;
    let (source_meta, source_data) =
        store.with_storage(source, |s| (s.tensor.clone(), s.data.clone()))?;
    check_slice_bounds(&slice_meta, &source_meta)?;
    let window = source_data.slice_each_axis(|ax| {
        let dim = ax.axis.index();
        let offset =
            (dim_offset(&slice_meta, dim) - dim_offset(&source_meta, dim)) as isize;
        let extent = slice_meta.shape()[dim] as isize;
        Slice::new(offset, Some(offset + extent), 1)
    });
    let window = window.to_owned();
    store.with_storage_mut(slice, |storage| storage.data.assign(&window))?;
    Ok(0.0)
}

/// Inserts `slice` into `destination` at the offsets encoded in the slice
/// tensor's signature.
fn insert_kernel(store: &TensorStore, destination: &str, slice: &str) -> Result<f64, TneError> {
    let destination_meta = store.meta(destination)?;
    let (slice_meta, slice_data) =
        store.with_storage(slice, |s| (s.tensor.clone(), s.data.clone()))?;
    check_slice_bounds(&slice_meta, &destination_meta)?;
    store.with_storage_mut(destination, |storage| {
        let mut window = storage.data.slice_each_axis_mut(|ax| {
            let dim = ax.axis.index();
            let offset =
                (dim_offset(&slice_meta, dim) - dim_offset(&destination_meta, dim)) as isize;
            let extent = slice_meta.shape()[dim] as isize;
            Slice::new(offset, Some(offset + extent), 1)
        });
        window.assign(&slice_data);
    })?;
    Ok(0.0)
}

fn check_slice_bounds(slice: &Tensor, base: &Tensor) -> Result<(), TneError> {
    if slice.rank() != base.rank() {
        return Err(TneError::DimensionMismatch(format!(
            "slice `{}` and tensor `{}` differ in rank",
            slice.name(),
            base.name()
        )));
    }
    for dim in 0..slice.rank() {
        let offset = dim_offset(slice, dim)
            .checked_sub(dim_offset(base, dim))
            .ok_or_else(|| {
                TneError::DimensionMismatch(format!(
                    "slice `{}` starts before tensor `{}` in dimension {dim}",
                    slice.name(),
                    base.name()
                ))
            })?;
        if offset + slice.shape()[dim] > base.shape()[dim] {
            return Err(TneError::DimensionMismatch(format!(
                "slice `{}` exceeds tensor `{}` in dimension {dim}",
                slice.name(),
                base.name()
            )));
        }
    }
    Ok(())
}

fn add_kernel(store: &TensorStore, pattern: &str, alpha: Complex64) -> Result<f64, String> {
    let spec = symbolic::parse_spec(pattern).map_err(|e| e.to_string())?;
    if spec.rhs.len() != 1 {
        return Err(format!("ADD pattern `{pattern}` must have one source"));
    }
    let source = &spec.rhs[0];
    let (_, source_data) = store
        .with_storage(&source.name, |s| (s.tensor.clone(), s.data.clone()))
        .map_err(|e| e.to_string())?;
    let perm: Vec<usize> = spec
        .lhs
        .indices
        .iter()
        .map(|label| {
            source
                .indices
                .iter()
                .position(|other| other == label)
                .ok_or_else(|| format!("index `{label}` missing in `{}`", source.name))
        })
        .collect::<Result<_, _>>()?;
    let conjugated = source.conjugated;
    let flops = store
        .with_storage_mut(&spec.lhs.name, |storage| {
            let permuted = source_data.view().permuted_axes(IxDyn(&perm));
            if storage.data.shape() != permuted.shape() {
                return Err(format!(
                    "shape mismatch in `{pattern}`: {:?} vs {:?}",
                    storage.data.shape(),
                    permuted.shape()
                ));
            }
            if conjugated {
                storage
                    .data
                    .zip_mut_with(&permuted, |d, s| *d += alpha * s.conj());
            } else {
                storage.data.zip_mut_with(&permuted, |d, s| *d += alpha * s);
            }
            Ok(storage.data.len() as f64 * 8.0)
        })
        .map_err(|e| e.to_string())??;
    Ok(flops)
}

fn contract_kernel(store: &TensorStore, pattern: &str, alpha: Complex64) -> Result<f64, String> {
    let spec = symbolic::parse_spec(pattern).map_err(|e| e.to_string())?;
    if spec.rhs.len() != 2 {
        return Err(format!("CONTRACT pattern `{pattern}` must have two factors"));
    }
    let left = &spec.rhs[0];
    let right = &spec.rhs[1];
    let left_data = store
        .with_storage(&left.name, |s| s.data.clone())
        .map_err(|e| e.to_string())?;
    let right_data = store
        .with_storage(&right.name, |s| s.data.clone())
        .map_err(|e| e.to_string())?;
    let (result, flops) = contract_arrays(
        &spec.lhs.indices,
        left,
        &left_data,
        right,
        &right_data,
    )?;
    store
        .with_storage_mut(&spec.lhs.name, |storage| {
            if storage.data.shape() != result.shape() {
                return Err(format!(
                    "destination shape mismatch in `{pattern}`: {:?} vs {:?}",
                    storage.data.shape(),
                    result.shape()
                ));
            }
            storage.data.zip_mut_with(&result, |d, s| *d += alpha * s);
            Ok(())
        })
        .map_err(|e| e.to_string())??;
    Ok(flops)
}

/// General binary contraction: permutes both operands into matrices, runs a
/// single matrix product and permutes the result into destination order.
/// Returns the result array and the FMA flop count.
fn contract_arrays(
    out_labels: &[String],
    left: &SymbolicFactor,
    left_data: &ArrayD<Complex64>,
    right: &SymbolicFactor,
    right_data: &ArrayD<Complex64>,
) -> Result<(ArrayD<Complex64>, f64), String> {
    for factor in [left, right] {
        let mut seen = FxHashSet::default();
        for label in &factor.indices {
            if !seen.insert(label) {
                return Err(format!("traced index `{label}` in `{}`", factor.name));
            }
        }
    }
    let contracted: Vec<&String> = left
        .indices
        .iter()
        .filter(|label| right.indices.contains(label))
        .collect();
    if contracted.iter().any(|label| out_labels.contains(label)) {
        return Err("hyper indices shared by all three operands are unsupported".to_string());
    }
    let left_open: Vec<&String> = left
        .indices
        .iter()
        .filter(|label| !contracted.contains(label))
        .collect();
    let right_open: Vec<&String> = right
        .indices
        .iter()
        .filter(|label| !contracted.contains(label))
        .collect();
    if left_open.len() + right_open.len() != out_labels.len() {
        return Err("destination indices do not match the open indices".to_string());
    }

    let axis_of = |factor: &SymbolicFactor, label: &String| {
        factor.indices.iter().position(|l| l == label).unwrap()
    };
    // Left: open axes then contracted axes.
    let left_perm: Vec<usize> = left_open
        .iter()
        .chain(contracted.iter())
        .map(|label| axis_of(left, label))
        .collect();
    // Right: contracted axes (same order) then open axes.
    let right_perm: Vec<usize> = contracted
        .iter()
        .chain(right_open.iter())
        .map(|label| axis_of(right, label))
        .collect();

    let dim_product = |data: &ArrayD<Complex64>, axes: &[usize]| -> usize {
        axes.iter().map(|&axis| data.shape()[axis]).product()
    };
    let m = dim_product(left_data, &left_perm[..left_open.len()]);
    let k = dim_product(left_data, &left_perm[left_open.len()..]);
    let n = dim_product(right_data, &right_perm[contracted.len()..]);

    let left_matrix = left_data
        .view()
        .permuted_axes(IxDyn(&left_perm))
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((m, k))
        .map_err(|e| e.to_string())?;
    let right_matrix = right_data
        .view()
        .permuted_axes(IxDyn(&right_perm))
        .as_standard_layout()
        .to_owned()
        .into_shape_with_order((k, n))
        .map_err(|e| e.to_string())?;
    let left_matrix = if left.conjugated {
        left_matrix.mapv(|v| v.conj())
    } else {
        left_matrix
    };
    let right_matrix = if right.conjugated {
        right_matrix.mapv(|v| v.conj())
    } else {
        right_matrix
    };

    let product = left_matrix.dot(&right_matrix);
    let flops = (m * n * k) as f64 * 8.0;

    // Reshape to the open dimensions and permute into destination order.
    let mut open_shape: Vec<usize> = Vec::with_capacity(out_labels.len());
    for label in left_open.iter().chain(right_open.iter()) {
        let (factor, data) = if left_open.contains(label) {
            (left, left_data)
        } else {
            (right, right_data)
        };
        open_shape.push(data.shape()[axis_of(factor, label)]);
    }
    let result = product
        .into_shape_with_order(IxDyn(&open_shape))
        .map_err(|e| e.to_string())?;
    let current: Vec<&String> = left_open.into_iter().chain(right_open).collect();
    let out_perm: Vec<usize> = out_labels
        .iter()
        .map(|label| {
            current
                .iter()
                .position(|other| *other == label)
                .ok_or_else(|| format!("destination index `{label}` is not produced"))
        })
        .collect::<Result<_, _>>()?;
    let result = result
        .permuted_axes(IxDyn(&out_perm))
        .as_standard_layout()
        .to_owned();
    Ok((result, flops))
}

/// Matricizes a tensor over (row axes, column axes).
fn matricize(
    data: &ArrayD<Complex64>,
    row_axes: &[usize],
    col_axes: &[usize],
) -> DMatrix<Complex<f64>> {
    let perm: Vec<usize> = row_axes.iter().chain(col_axes.iter()).copied().collect();
    let rows: usize = row_axes.iter().map(|&a| data.shape()[a]).product();
    let cols: usize = col_axes.iter().map(|&a| data.shape()[a]).product();
    let ordered = data
        .view()
        .permuted_axes(IxDyn(&perm))
        .as_standard_layout()
        .to_owned();
    let flat = ordered.as_slice().unwrap();
    DMatrix::from_fn(rows, cols, |r, c| flat[r * cols + c])
}

/// SVD-based decomposition kernel. With `absorb == None` the operands are
/// `[left, middle, right, source]` (three-factor form with a diagonal
/// middle); otherwise `[left, right, source]` with the singular values
/// absorbed per `absorb`.
fn svd_kernel(
    store: &TensorStore,
    operands: &[String],
    pattern: &str,
    absorb: Option<SvdAbsorb>,
) -> Result<f64, String> {
    let spec = symbolic::parse_spec(pattern).map_err(|e| e.to_string())?;
    let (left_factor, right_factor) = match (absorb, spec.rhs.len()) {
        (None, 3) => (&spec.rhs[0], &spec.rhs[2]),
        (Some(_), 2) => (&spec.rhs[0], &spec.rhs[1]),
        _ => return Err(format!("malformed decomposition pattern `{pattern}`")),
    };
    let source_name = operands.last().unwrap();
    let source_data = store
        .with_storage(source_name, |s| s.data.clone())
        .map_err(|e| e.to_string())?;

    // Bond labels: present in a factor but not in the source.
    let source_labels = &spec.lhs.indices;
    let bond_of = |factor: &SymbolicFactor| {
        factor
            .indices
            .iter()
            .position(|label| !source_labels.contains(label))
            .ok_or_else(|| format!("factor `{}` lacks a bond index", factor.name))
    };
    let left_bond = bond_of(left_factor)?;
    let right_bond = bond_of(right_factor)?;

    let row_axes: Vec<usize> = left_factor
        .indices
        .iter()
        .enumerate()
        .filter(|(pos, _)| *pos != left_bond)
        .map(|(_, label)| source_labels.iter().position(|l| l == label).unwrap())
        .collect();
    let col_axes: Vec<usize> = right_factor
        .indices
        .iter()
        .enumerate()
        .filter(|(pos, _)| *pos != right_bond)
        .map(|(_, label)| source_labels.iter().position(|l| l == label).unwrap())
        .collect();
    if row_axes.len() + col_axes.len() != source_labels.len() {
        return Err(format!("pattern `{pattern}` does not cover the source dimensions"));
    }

    let matrix = matricize(&source_data, &row_axes, &col_axes);
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    let svd = matrix.svd(true, true);
    let u = svd.u.ok_or("SVD failed to produce U")?;
    let v_t = svd.v_t.ok_or("SVD failed to produce V^T")?;
    let singular = svd.singular_values;
    let rank = singular.len();

    let bond_extent = store
        .meta(&left_factor.name)
        .map_err(|e| e.to_string())?
        .shape()[left_bond] as usize;

    // Left factor: bond columns of U (truncated or zero-padded).
    let mut left_matrix = DMatrix::<Complex<f64>>::zeros(rows, bond_extent);
    let mut right_matrix = DMatrix::<Complex<f64>>::zeros(bond_extent, cols);
    for b in 0..bond_extent.min(rank) {
        let sigma = singular[b];
        let (left_scale, right_scale) = match absorb {
            None => (1.0, 1.0),
            Some(SvdAbsorb::Left) => (sigma, 1.0),
            Some(SvdAbsorb::Right) => (1.0, sigma),
            Some(SvdAbsorb::Both) => (sigma.sqrt(), sigma.sqrt()),
        };
        for r in 0..rows {
            left_matrix[(r, b)] = u[(r, b)] * Complex::new(left_scale, 0.0);
        }
        for c in 0..cols {
            right_matrix[(b, c)] = v_t[(b, c)] * Complex::new(right_scale, 0.0);
        }
    }

    write_factor(store, left_factor, left_bond, true, &left_matrix)?;
    write_factor(store, right_factor, right_bond, false, &right_matrix)?;
    if absorb.is_none() {
        // Diagonal middle factor carrying the singular values.
        let middle_name = &operands[1];
        store
            .with_storage_mut(middle_name, |storage| {
                storage.data.fill(Complex64::new(0.0, 0.0));
                let limit = storage.data.shape()[0].min(rank);
                for b in 0..limit {
                    storage.data[[b, b]] = Complex64::new(singular[b], 0.0);
                }
            })
            .map_err(|e| e.to_string())?;
    }
    Ok((rows * cols * rank) as f64 * 8.0)
}

/// Writes a factor matrix back into its tensor, permuting the bond dimension
/// into its declared position.
fn write_factor(
    store: &TensorStore,
    factor: &SymbolicFactor,
    bond_pos: usize,
    bond_last: bool,
    matrix: &DMatrix<Complex<f64>>,
) -> Result<(), String> {
    store
        .with_storage_mut(&factor.name, |storage| {
            let shape = storage.data.shape().to_vec();
            // Shape with open dims in pattern order, bond first or last.
            let mut staged_shape: Vec<usize> = Vec::with_capacity(shape.len());
            let open_positions: Vec<usize> = (0..factor.indices.len())
                .filter(|&p| p != bond_pos)
                .collect();
            if bond_last {
                for &p in &open_positions {
                    staged_shape.push(shape[p]);
                }
                staged_shape.push(shape[bond_pos]);
            } else {
                staged_shape.push(shape[bond_pos]);
                for &p in &open_positions {
                    staged_shape.push(shape[p]);
                }
            }
            let flat: Vec<Complex64> = (0..matrix.nrows())
                .flat_map(|r| (0..matrix.ncols()).map(move |c| (r, c)))
                .map(|(r, c)| matrix[(r, c)])
                .collect();
            let staged = ArrayD::from_shape_vec(IxDyn(&staged_shape), flat).unwrap();
            // Permute the staged layout into the tensor's dimension order.
            let mut perm = vec![0usize; shape.len()];
            if bond_last {
                for (staged_axis, &p) in open_positions.iter().enumerate() {
                    perm[p] = staged_axis;
                }
                perm[bond_pos] = shape.len() - 1;
            } else {
                perm[bond_pos] = 0;
                for (staged_axis, &p) in open_positions.iter().enumerate() {
                    perm[p] = staged_axis + 1;
                }
            }
            storage.data = staged
                .permuted_axes(IxDyn(&perm))
                .as_standard_layout()
                .to_owned();
        })
        .map_err(|e| e.to_string())
}

/// Replaces a tensor by the isometric part of its SVD (`U V^H` of the
/// matricization over all dimensions but the last).
fn orthogonalize_svd_kernel(store: &TensorStore, name: &str) -> Result<f64, String> {
    store
        .with_storage_mut(name, |storage| {
            let ndim = storage.data.ndim();
            if ndim < 2 {
                return Err(format!("cannot orthogonalize rank-{ndim} tensor `{name}`"));
            }
            let row_axes: Vec<usize> = (0..ndim - 1).collect();
            let matrix = matricize(&storage.data, &row_axes, &[ndim - 1]);
            let (rows, cols) = (matrix.nrows(), matrix.ncols());
            let svd = matrix.svd(true, true);
            let u = svd.u.ok_or("SVD failed to produce U")?;
            let v_t = svd.v_t.ok_or("SVD failed to produce V^T")?;
            let orthogonal = u * v_t;
            let flat: Vec<Complex64> = (0..rows)
                .flat_map(|r| (0..cols).map(move |c| (r, c)))
                .map(|(r, c)| orthogonal[(r, c)])
                .collect();
            let shape = storage.data.shape().to_vec();
            storage.data = ArrayD::from_shape_vec(IxDyn(&shape), flat).unwrap();
            Ok((rows * cols * cols.min(rows)) as f64 * 8.0)
        })
        .map_err(|e| e.to_string())?
}

/// Orthonormalizes the columns of the matricization via Modified
/// Gram-Schmidt.
fn orthogonalize_mgs_kernel(store: &TensorStore, name: &str) -> Result<f64, String> {
    store
        .with_storage_mut(name, |storage| {
            let ndim = storage.data.ndim();
            if ndim < 2 {
                return Err(format!("cannot orthogonalize rank-{ndim} tensor `{name}`"));
            }
            let row_axes: Vec<usize> = (0..ndim - 1).collect();
            let mut matrix = matricize(&storage.data, &row_axes, &[ndim - 1]);
            let (rows, cols) = (matrix.nrows(), matrix.ncols());
            for j in 0..cols {
                for i in 0..j {
                    let mut projection = Complex::new(0.0, 0.0);
                    for r in 0..rows {
                        projection += matrix[(r, i)].conj() * matrix[(r, j)];
                    }
                    for r in 0..rows {
                        let correction = projection * matrix[(r, i)];
                        matrix[(r, j)] -= correction;
                    }
                }
                let norm: f64 = (0..rows).map(|r| matrix[(r, j)].norm_sqr()).sum::<f64>().sqrt();
                if norm > f64::EPSILON {
                    for r in 0..rows {
                        matrix[(r, j)] /= Complex::new(norm, 0.0);
                    }
                }
            }
            let flat: Vec<Complex64> = (0..rows)
                .flat_map(|r| (0..cols).map(move |c| (r, c)))
                .map(|(r, c)| matrix[(r, c)])
                .collect();
            let shape = storage.data.shape().to_vec();
            storage.data = ArrayD::from_shape_vec(IxDyn(&shape), flat).unwrap();
            Ok((rows * cols * cols) as f64 * 8.0)
        })
        .map_err(|e| e.to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;

    use float_cmp::approx_eq;

    use crate::runtime::process_group::SelfComm;

    fn setup() -> (Arc<TensorStore>, CpuNodeExecutor) {
        let store = Arc::new(TensorStore::new(1 << 24));
        let groups = Arc::new(GroupRegistry::new(Arc::new(SelfComm), 1 << 24));
        let executor = CpuNodeExecutor::new(Arc::clone(&store), groups);
        (store, executor)
    }

    fn run(executor: &CpuNodeExecutor, op: TensorOperation) {
        let handle = executor.submit(op).unwrap();
        executor.sync(handle).unwrap();
    }

    fn create_with_data(
        executor: &CpuNodeExecutor,
        name: &str,
        shape: Vec<u64>,
        data: Vec<Complex64>,
    ) {
        run(
            executor,
            TensorOperation::create(Tensor::new(name, shape), ElementType::Complex64),
        );
        run(
            executor,
            TensorOperation::new(
                OpKind::Transform {
                    kind: TransformKind::InitData(data),
                },
                vec![name.to_string()],
                vec![],
            ),
        );
    }

    #[test]
    fn test_create_init_destroy() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "A",
            vec![2, 2],
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(3.0, 0.0),
                Complex64::new(4.0, 0.0),
            ],
        );
        // Column-major input: element (1, 0) is the second value.
        store
            .with_storage("A", |s| {
                assert_eq!(s.data[[1, 0]], Complex64::new(2.0, 0.0));
                assert_eq!(s.data[[0, 1]], Complex64::new(3.0, 0.0));
            })
            .unwrap();
        run(
            &executor,
            TensorOperation::new(OpKind::Destroy, vec!["A".to_string()], vec![]),
        );
        assert!(!store.contains("A"));
    }

    #[test]
    fn test_dot_product_contraction() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "u",
            vec![4],
            (1..=4).map(|v| Complex64::new(v as f64, 0.0)).collect(),
        );
        create_with_data(
            &executor,
            "v",
            vec![4],
            (1..=4).rev().map(|v| Complex64::new(v as f64, 0.0)).collect(),
        );
        run(
            &executor,
            TensorOperation::create(Tensor::new("s", vec![]), ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Contract {
                    pattern: "s()+=u(i)*v(i)".to_string(),
                },
                vec!["s".to_string(), "u".to_string(), "v".to_string()],
                vec![Complex64::new(1.0, 0.0)],
            ),
        );
        let value = store.read_linear("s").unwrap()[0];
        assert_eq!(value, Complex64::new(20.0, 0.0));
    }

    #[test]
    fn test_matrix_chain_contraction() {
        let (store, executor) = setup();
        // L = [[1, 2], [3, 4]] (column-major), R = identity.
        create_with_data(
            &executor,
            "L",
            vec![2, 2],
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(3.0, 0.0),
                Complex64::new(2.0, 0.0),
                Complex64::new(4.0, 0.0),
            ],
        );
        create_with_data(
            &executor,
            "R",
            vec![2, 2],
            vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(1.0, 0.0),
            ],
        );
        run(
            &executor,
            TensorOperation::create(Tensor::new("D", vec![2, 2]), ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Contract {
                    pattern: "D(a,b)+=L(a,i)*R(i,b)".to_string(),
                },
                vec!["D".to_string(), "L".to_string(), "R".to_string()],
                vec![Complex64::new(1.0, 0.0)],
            ),
        );
        assert_eq!(
            store.read_linear("D").unwrap(),
            store.read_linear("L").unwrap()
        );
    }

    #[test]
    fn test_add_with_permutation() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "S",
            vec![2, 3],
            (1..=6).map(|v| Complex64::new(v as f64, 0.0)).collect(),
        );
        run(
            &executor,
            TensorOperation::create(Tensor::new("T", vec![3, 2]), ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Add {
                    pattern: "T(a,b)+=S(b,a)".to_string(),
                },
                vec!["T".to_string(), "S".to_string()],
                vec![Complex64::new(2.0, 0.0)],
            ),
        );
        store
            .with_storage("T", |t| {
                store
                    .with_storage("S", |s| {
                        for a in 0..3 {
                            for b in 0..2 {
                                assert_eq!(t.data[[a, b]], s.data[[b, a]] * 2.0);
                            }
                        }
                    })
                    .unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_slice_and_insert_round_trip() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "big",
            vec![4, 4],
            (0..16).map(|v| Complex64::new(v as f64, 0.0)).collect(),
        );
        // Slice anchored at offset (1, 2) via the anonymous-space signature.
        let slice_meta =
            Tensor::with_signature("window", vec![2, 2], vec![(SOME_SPACE, 1), (SOME_SPACE, 2)]);
        run(
            &executor,
            TensorOperation::create(slice_meta, ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Slice,
                vec!["window".to_string(), "big".to_string()],
                vec![],
            ),
        );
        store
            .with_storage("window", |w| {
                store
                    .with_storage("big", |b| {
                        for r in 0..2 {
                            for c in 0..2 {
                                assert_eq!(w.data[[r, c]], b.data[[r + 1, c + 2]]);
                            }
                        }
                    })
                    .unwrap();
            })
            .unwrap();
        // Scale the window and insert it back.
        run(
            &executor,
            TensorOperation::new(
                OpKind::Transform {
                    kind: TransformKind::Scale(Complex64::new(10.0, 0.0)),
                },
                vec!["window".to_string()],
                vec![],
            ),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Insert,
                vec!["big".to_string(), "window".to_string()],
                vec![],
            ),
        );
        store
            .with_storage("big", |b| {
                assert_eq!(b.data[[1, 2]], Complex64::new(90.0, 0.0));
                assert_eq!(b.data[[0, 0]], Complex64::new(0.0, 0.0));
            })
            .unwrap();
    }

    #[test]
    fn test_svd2_reconstructs_source() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "M",
            vec![3, 3],
            (1..=9).map(|v| Complex64::new(v as f64 * 0.3, 0.1 * v as f64)).collect(),
        );
        for (name, shape) in [("U", vec![3, 3]), ("V", vec![3, 3])] {
            run(
                &executor,
                TensorOperation::create(Tensor::new(name, shape), ElementType::Complex64),
            );
        }
        run(
            &executor,
            TensorOperation::new(
                OpKind::DecomposeSvd2 {
                    pattern: "M(a,b)=U(a,k)*V(k,b)".to_string(),
                    absorb: SvdAbsorb::Left,
                },
                vec!["U".to_string(), "V".to_string(), "M".to_string()],
                vec![],
            ),
        );
        // U * V must reproduce M.
        run(
            &executor,
            TensorOperation::create(Tensor::new("M2", vec![3, 3]), ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Contract {
                    pattern: "M2(a,b)+=U(a,k)*V(k,b)".to_string(),
                },
                vec!["M2".to_string(), "U".to_string(), "V".to_string()],
                vec![Complex64::new(1.0, 0.0)],
            ),
        );
        let original = store.read_linear("M").unwrap();
        let rebuilt = store.read_linear("M2").unwrap();
        for (x, y) in original.iter().zip(rebuilt.iter()) {
            assert!(approx_eq!(f64, x.re, y.re, epsilon = 1e-10));
            assert!(approx_eq!(f64, x.im, y.im, epsilon = 1e-10));
        }
    }

    #[test]
    fn test_orthogonalize_mgs_yields_isometry() {
        let (store, executor) = setup();
        create_with_data(
            &executor,
            "W",
            vec![4, 2],
            (1..=8).map(|v| Complex64::new(v as f64, -0.5 * v as f64)).collect(),
        );
        run(
            &executor,
            TensorOperation::new(OpKind::OrthogonalizeMgs, vec!["W".to_string()], vec![]),
        );
        store
            .with_storage("W", |w| {
                for i in 0..2 {
                    for j in 0..2 {
                        let mut dot = Complex64::new(0.0, 0.0);
                        for r in 0..4 {
                            dot += w.data[[r, i]].conj() * w.data[[r, j]];
                        }
                        let expected = if i == j { 1.0 } else { 0.0 };
                        assert!(approx_eq!(f64, dot.re, expected, epsilon = 1e-12));
                        assert!(approx_eq!(f64, dot.im, 0.0, epsilon = 1e-12));
                    }
                }
            })
            .unwrap();
    }

    #[test]
    fn test_failure_surfaces_through_sync() {
        let (_store, executor) = setup();
        let handle = executor
            .submit(TensorOperation::new(
                OpKind::Destroy,
                vec!["missing".to_string()],
                vec![],
            ))
            .unwrap();
        assert!(matches!(
            executor.sync(handle),
            Err(TneError::BackendFailure { .. })
        ));
    }

    #[test]
    fn test_dry_run_skips_numerics() {
        let (store, executor) = setup();
        executor.set_dry_run(true);
        run(
            &executor,
            TensorOperation::create(Tensor::new("A", vec![2]), ElementType::Complex64),
        );
        run(
            &executor,
            TensorOperation::new(
                OpKind::Transform {
                    kind: TransformKind::InitValue(Complex64::new(5.0, 0.0)),
                },
                vec!["A".to_string()],
                vec![],
            ),
        );
        // Storage exists but was never initialized.
        assert!(store.contains("A"));
        assert_eq!(store.read_linear("A").unwrap()[0], Complex64::new(0.0, 0.0));
    }
}
