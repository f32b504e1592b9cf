//! The numerical engine facade.
//!
//! An [`Engine`] is an explicit value created at startup (there is no global
//! singleton). Client calls validate their arguments, append primitive
//! operations to the DAG and return immediately; the `*_sync` variants block
//! until the touched tensors settle. The pipelined executor and the CPU
//! backend run on their own threads for the lifetime of the engine.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};
use num_complex::Complex64;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::contractionpath::paths::{plan_network, PlannerConfig, PlannerKind};
use crate::contractionpath::plan_cache::{PlanCache, PlanCacheStats};
use crate::dag::graph::OpDag;
use crate::dag::operation::{OpKind, SvdAbsorb, TensorOperation, TransformKind};
use crate::error::TneError;
use crate::io::{self, DumpLayout, TensorDump};
use crate::registry::SpaceRegistry;
use crate::runtime::executor::{
    LazyGraphExecutor, TensorNetworkQueue, DEFAULT_PIPELINE_DEPTH, DEFAULT_PREFETCH_DEPTH,
    NETWORK_PIPELINE_DEPTH,
};
use crate::runtime::node_executor::{CpuNodeExecutor, NodeExecutor, TensorStore};
use crate::runtime::process_group::{
    execution_domain, CommProxy, GroupRegistry, ProcessGroup, SelfComm, WORLD_GROUP,
};
use crate::symbolic;
use crate::tensornetwork::composite::{BlockPredicate, CompositeTensor, SplitDirective};
use crate::tensornetwork::expansion::TensorExpansion;
use crate::tensornetwork::network::TensorNetwork;
use crate::tensornetwork::tensor::Tensor;
use crate::types::{
    DimExtent, ElementType, GroupId, NodeId, ProcessRank, ScalarValue, SpaceId, SubspaceId,
    TensorId,
};
use crate::utils::{HashMapInsertNew, WithCapacity};

/// Selectable computational backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// The built-in CPU node executor.
    #[default]
    Default,
    /// Whole-network execution via cuQuantum (not available in this build).
    CuQuantum,
}

impl BackendKind {
    /// Parses a backend name as accepted by the client API.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(BackendKind::Default),
            "cuquantum" => Some(BackendKind::CuQuantum),
            _ => None,
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the host memory buffer feeding all tensor storage.
    pub host_buffer_bytes: u64,
    /// Maximum number of operations in flight.
    pub pipeline_depth: usize,
    /// Lookahead depth for operand prefetch.
    pub prefetch_depth: usize,
    /// Initial planner algorithm.
    pub planner: PlannerKind,
    /// Planner tuning knobs.
    pub planner_config: PlannerConfig,
    /// Initial backend.
    pub backend: BackendKind,
    /// Dry-run mode: operations are scheduled but numerics are skipped.
    pub dry_run: bool,
    /// Fast-math mode, forwarded to backends.
    pub fast_math: bool,
    /// Runtime logging level 0-3 (warn, info, debug, trace); `None` leaves
    /// logging untouched.
    pub log_level: Option<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_buffer_bytes: 1 << 30,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            planner: PlannerKind::Heuro,
            planner_config: PlannerConfig::default(),
            backend: BackendKind::Default,
            dry_run: false,
            fast_math: false,
            log_level: None,
        }
    }
}

impl EngineConfig {
    /// Applies environment overrides (`TNE_BACKEND`, `TNE_LOG`).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(backend) = std::env::var("TNE_BACKEND") {
            if let Some(kind) = BackendKind::from_name(&backend) {
                config.backend = kind;
            }
        }
        if let Ok(level) = std::env::var("TNE_LOG") {
            config.log_level = level.parse().ok();
        }
        config
    }
}

/// Maps a numeric client log level onto a logger specification.
fn log_spec(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[derive(Debug, Clone)]
struct TensorEntry {
    tensor: Tensor,
    element_type: ElementType,
    group: GroupId,
    ref_count: usize,
}

/// The numerical engine: operation intake, tensor lifecycle, planning and
/// execution.
pub struct Engine {
    registry: SpaceRegistry,
    groups: Arc<GroupRegistry>,
    store: Arc<TensorStore>,
    node_executor: Arc<CpuNodeExecutor>,
    dag: Arc<OpDag>,
    executor: Mutex<Option<LazyGraphExecutor>>,
    network_queue: TensorNetworkQueue,
    plan_cache: PlanCache,
    planner: RwLock<(PlannerKind, PlannerConfig)>,
    backend: RwLock<BackendKind>,
    tensors: RwLock<FxHashMap<String, TensorEntry>>,
    composites: RwLock<FxHashMap<String, CompositeTensor>>,
    scopes: Mutex<Vec<String>>,
    evaluation_counter: AtomicU64,
    logger: Mutex<Option<flexi_logger::LoggerHandle>>,
}

impl Engine {
    /// Starts a single-process engine.
    pub fn new(config: EngineConfig) -> Result<Self, TneError> {
        Self::with_comm(config, Arc::new(SelfComm))
    }

    /// Starts an engine over a provided world communicator proxy.
    pub fn with_comm(
        config: EngineConfig,
        world_comm: Arc<dyn CommProxy>,
    ) -> Result<Self, TneError> {
        if config.backend == BackendKind::CuQuantum {
            return Err(TneError::BackendUnavailable("cuquantum".to_string()));
        }
        // Start the logger when a level was requested; a second engine in the
        // same process keeps the existing logger.
        let logger = config.log_level.and_then(|level| {
            flexi_logger::Logger::try_with_str(log_spec(level))
                .ok()
                .and_then(|logger| logger.start().ok())
        });
        let groups = Arc::new(GroupRegistry::new(world_comm, config.host_buffer_bytes));
        let store = Arc::new(TensorStore::new(config.host_buffer_bytes));
        let node_executor = Arc::new(CpuNodeExecutor::new(
            Arc::clone(&store),
            Arc::clone(&groups),
        ));
        node_executor.set_dry_run(config.dry_run);
        node_executor.set_fast_math(config.fast_math);
        let dag = Arc::new(OpDag::new());
        let executor = LazyGraphExecutor::start(
            Arc::clone(&dag),
            Arc::clone(&node_executor) as Arc<dyn NodeExecutor>,
            config.pipeline_depth,
            config.prefetch_depth,
        );
        info!(
            pipeline_depth = config.pipeline_depth,
            prefetch_depth = config.prefetch_depth;
            "numerical engine started"
        );
        Ok(Self {
            registry: SpaceRegistry::new(),
            groups,
            store,
            node_executor,
            dag,
            executor: Mutex::new(Some(executor)),
            network_queue: TensorNetworkQueue::new(NETWORK_PIPELINE_DEPTH),
            plan_cache: PlanCache::new(),
            planner: RwLock::new((config.planner, config.planner_config)),
            backend: RwLock::new(config.backend),
            tensors: RwLock::new(FxHashMap::default()),
            composites: RwLock::new(FxHashMap::default()),
            scopes: Mutex::new(Vec::new()),
            evaluation_counter: AtomicU64::new(0),
            logger: Mutex::new(logger),
        })
    }

    /// Changes the runtime logging level (0-3). No-op when the engine did not
    /// start the logger.
    pub fn set_log_level(&self, level: u8) {
        if let Some(handle) = self.logger.lock().unwrap().as_ref() {
            if let Ok(spec) = flexi_logger::LogSpecification::parse(log_spec(level)) {
                handle.set_new_spec(spec);
            }
        }
    }

    /// Drains outstanding work and stops the executor and backend threads.
    /// Further submissions are refused.
    pub fn shutdown(&self) {
        if let Some(mut executor) = self.executor.lock().unwrap().take() {
            executor.shutdown();
        }
        self.node_executor.shutdown();
    }

    fn append(&self, op: TensorOperation) -> Result<NodeId, TneError> {
        self.dag.append(op)
    }

    // ----- scopes -------------------------------------------------------

    /// Opens a named scope; returns its depth.
    pub fn open_scope(&self, name: impl Into<String>) -> usize {
        let mut scopes = self.scopes.lock().unwrap();
        scopes.push(name.into());
        scopes.len()
    }

    /// Closes the innermost scope.
    pub fn close_scope(&self) -> Option<String> {
        self.scopes.lock().unwrap().pop()
    }

    // ----- spaces -------------------------------------------------------

    /// Registers a vector space.
    pub fn create_space(&self, name: &str, extent: DimExtent) -> Result<SpaceId, TneError> {
        self.registry.create_space(name, extent)
    }

    /// Registers a subspace of a space.
    pub fn create_subspace(
        &self,
        space: SpaceId,
        name: &str,
        lower: u64,
        upper: u64,
    ) -> Result<SubspaceId, TneError> {
        self.registry.create_subspace(space, name, lower, upper)
    }

    /// The space registry, for id lookups.
    #[must_use]
    pub fn space_registry(&self) -> &SpaceRegistry {
        &self.registry
    }

    // ----- tensor lifecycle --------------------------------------------

    fn register_tensor(
        &self,
        tensor: Tensor,
        element_type: ElementType,
        group: GroupId,
    ) -> Result<(), TneError> {
        let mut tensors = self.tensors.write().unwrap();
        if tensors.contains_key(tensor.name()) {
            return Err(TneError::TensorExists(tensor.name().to_string()));
        }
        self.groups.retain(group);
        tensors.insert(
            tensor.name().to_string(),
            TensorEntry {
                tensor,
                element_type,
                group,
                ref_count: 1,
            },
        );
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<TensorEntry, TneError> {
        self.tensors
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TneError::UnknownTensor(name.to_string()))
    }

    /// Declares a tensor and schedules its storage allocation in the world
    /// group.
    pub fn create_tensor(
        &self,
        name: &str,
        shape: Vec<DimExtent>,
        element_type: ElementType,
    ) -> Result<(), TneError> {
        self.create_tensor_in_group(Tensor::new(name, shape), element_type, WORLD_GROUP)
    }

    /// Declares a tensor with an explicit identity inside a process group.
    pub fn create_tensor_in_group(
        &self,
        tensor: Tensor,
        element_type: ElementType,
        group: GroupId,
    ) -> Result<(), TneError> {
        if self.groups.get(group).is_none() {
            return Err(TneError::CollectiveFailure(format!(
                "unknown process group {group}"
            )));
        }
        self.register_tensor(tensor.clone(), element_type, group)?;
        self.append(TensorOperation::create(tensor, element_type))?;
        Ok(())
    }

    /// Declares a tensor identity without allocating local storage, for
    /// ranks whose subdomain of presence does not include them yet (e.g.
    /// before a replication).
    pub fn declare_tensor(
        &self,
        tensor: Tensor,
        element_type: ElementType,
        group: GroupId,
    ) -> Result<(), TneError> {
        if self.groups.get(group).is_none() {
            return Err(TneError::CollectiveFailure(format!(
                "unknown process group {group}"
            )));
        }
        self.register_tensor(tensor, element_type, group)
    }

    /// Creates a tensor and blocks until its storage exists. Retries once
    /// after a garbage-collection pass when host memory is exhausted.
    pub fn create_tensor_sync(
        &self,
        name: &str,
        shape: Vec<DimExtent>,
        element_type: ElementType,
    ) -> Result<(), TneError> {
        self.create_tensor(name, shape.clone(), element_type)?;
        match self.sync_tensor(name) {
            Err(TneError::BackendFailure { message, .. })
                if message.contains("out of memory") =>
            {
                debug!(tensor = name; "retrying tensor creation after garbage collection");
                self.dag.clean_garbage();
                self.append(TensorOperation::create(
                    Tensor::new(name, shape),
                    element_type,
                ))?;
                self.sync_tensor(name)
            }
            other => other,
        }
    }

    /// Decomposes a tensor into blocks, creating one tensor per block. All
    /// blocks live in the given process group; each has a well-defined owner
    /// rank. Returns the number of selected blocks.
    pub fn create_composite_tensor(
        &self,
        name: &str,
        shape: Vec<DimExtent>,
        element_type: ElementType,
        splits: Vec<SplitDirective>,
        predicate: Option<BlockPredicate>,
        group: GroupId,
    ) -> Result<usize, TneError> {
        let parent = Tensor::new(name, shape);
        let composite = CompositeTensor::new(parent.clone(), splits, predicate)?;
        let group_ref = self
            .groups
            .get(group)
            .ok_or_else(|| TneError::CollectiveFailure(format!("unknown process group {group}")))?;
        let my_rank = group_ref.comm().rank();
        let num_blocks = composite.num_blocks();
        // The parent is declared (name reservation, domain) but carries no
        // storage of its own; its elements live in the blocks.
        self.register_tensor(parent, element_type, group)?;
        for block in composite.blocks() {
            // Every block has an owner; only the owner allocates storage.
            let owner = composite.owner_index(block.index, group_ref.size())?;
            if owner == my_rank {
                self.create_tensor_in_group(block.tensor.clone(), element_type, group)?;
            }
        }
        self.composites
            .write()
            .unwrap()
            .insert(name.to_string(), composite);
        Ok(num_blocks)
    }

    /// The block decomposition of a composite tensor.
    #[must_use]
    pub fn composite(&self, name: &str) -> Option<CompositeTensor> {
        self.composites.read().unwrap().get(name).cloned()
    }

    /// Adds one named reference to a tensor.
    pub fn retain_tensor(&self, name: &str) -> Result<(), TneError> {
        let mut tensors = self.tensors.write().unwrap();
        let entry = tensors
            .get_mut(name)
            .ok_or_else(|| TneError::UnknownTensor(name.to_string()))?;
        entry.ref_count += 1;
        Ok(())
    }

    /// Drops one named reference; the last reference schedules storage
    /// destruction.
    pub fn destroy_tensor(&self, name: &str) -> Result<(), TneError> {
        let group = {
            let mut tensors = self.tensors.write().unwrap();
            let entry = tensors
                .get_mut(name)
                .ok_or_else(|| TneError::UnknownTensor(name.to_string()))?;
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return Ok(());
            }
            let group = entry.group;
            tensors.remove(name);
            group
        };
        self.groups.release(group);
        if let Some(composite) = self.composites.write().unwrap().remove(name) {
            let group_ref = self.groups.get(group);
            for block in composite.blocks() {
                let owned = match &group_ref {
                    Some(g) => {
                        composite.owner_index(block.index, g.size())? == g.comm().rank()
                    }
                    None => true,
                };
                if owned {
                    self.destroy_tensor(block.tensor.name())?;
                }
            }
            return Ok(());
        }
        self.append(TensorOperation::destroy(name))?;
        Ok(())
    }

    /// Destroys a tensor and blocks until its storage is released.
    pub fn destroy_tensor_sync(&self, name: &str) -> Result<(), TneError> {
        self.destroy_tensor(name)?;
        self.sync_tensor(name)
    }

    /// The declared identity of a tensor.
    pub fn tensor(&self, name: &str) -> Result<Tensor, TneError> {
        Ok(self.entry(name)?.tensor)
    }

    // ----- initialization and unary transforms -------------------------

    /// Schedules an element-wise initialization to a constant.
    pub fn init_tensor(&self, name: &str, value: ScalarValue) -> Result<(), TneError> {
        self.transform_tensor(name, TransformKind::InitValue(value.to_c64()))
    }

    /// Initializes to a constant and blocks until done.
    pub fn init_tensor_sync(&self, name: &str, value: ScalarValue) -> Result<(), TneError> {
        self.init_tensor(name, value)?;
        self.sync_tensor(name)
    }

    /// Schedules a reproducible pseudo-random initialization.
    pub fn init_tensor_rnd(&self, name: &str, seed: u64) -> Result<(), TneError> {
        self.transform_tensor(name, TransformKind::InitRandom { seed })
    }

    /// Schedules initialization from explicit column-major data.
    pub fn init_tensor_data(&self, name: &str, data: Vec<Complex64>) -> Result<(), TneError> {
        let entry = self.entry(name)?;
        if data.len() as u64 != entry.tensor.volume() {
            return Err(TneError::ShapeMismatch(format!(
                "init data has {} elements, tensor `{name}` has {}",
                data.len(),
                entry.tensor.volume()
            )));
        }
        self.transform_tensor(name, TransformKind::InitData(data))
    }

    /// Schedules initialization from a tensor dump file.
    pub fn init_tensor_file(&self, name: &str, path: impl AsRef<Path>) -> Result<(), TneError> {
        let file = std::fs::File::open(path)?;
        let dump = io::read_dump(std::io::BufReader::new(file))?;
        let entry = self.entry(name)?;
        if dump.shape != entry.tensor.shape() {
            return Err(TneError::ShapeMismatch(format!(
                "dump shape {:?} does not match tensor `{name}` {:?}",
                dump.shape,
                entry.tensor.shape()
            )));
        }
        self.transform_tensor(name, TransformKind::InitData(dump.elements))
    }

    /// Schedules an element-wise scaling.
    pub fn scale_tensor(&self, name: &str, factor: ScalarValue) -> Result<(), TneError> {
        let factor = factor.to_c64();
        let entry = self.entry(name)?;
        if !entry.tensor.isometries().is_empty() && (factor.norm() - 1.0).abs() != 0.0 {
            // Non-unit-modulus scaling breaks isometry; drop the groups and
            // leave re-orthogonalization to the client.
            let mut tensors = self.tensors.write().unwrap();
            if let Some(entry) = tensors.get_mut(name) {
                entry.tensor.drop_isometries();
            }
        }
        self.transform_tensor(name, TransformKind::Scale(factor))
    }

    /// Scales a tensor and restores its isometry by an orthogonalization
    /// pass when the factor is not unit-modulus.
    pub fn scale_tensor_isometric(
        &self,
        name: &str,
        factor: ScalarValue,
    ) -> Result<(), TneError> {
        let isometric = !self.entry(name)?.tensor.isometries().is_empty();
        let factor_c = factor.to_c64();
        self.transform_tensor(name, TransformKind::Scale(factor_c))?;
        if isometric && (factor_c.norm() - 1.0).abs() != 0.0 {
            self.orthogonalize_svd(name)?;
        }
        Ok(())
    }

    /// Schedules an arbitrary unary transform.
    pub fn transform_tensor(&self, name: &str, kind: TransformKind) -> Result<(), TneError> {
        self.entry(name)?;
        self.append(TensorOperation::new(
            OpKind::Transform { kind },
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    /// Creates `destination` congruent to `source` and schedules a copy.
    pub fn copy_tensor(&self, destination: &str, source: &str) -> Result<(), TneError> {
        let entry = self.entry(source)?;
        let mut tensor = entry.tensor.clone();
        tensor.rename(destination);
        self.create_tensor_in_group(tensor, entry.element_type, entry.group)?;
        let pattern =
            symbolic::addition_pattern(entry.tensor.rank(), destination, source, false);
        self.append(TensorOperation::new(
            OpKind::Add { pattern },
            vec![destination.to_string(), source.to_string()],
            vec![Complex64::new(1.0, 0.0)],
        ))?;
        Ok(())
    }

    // ----- binary operations -------------------------------------------

    fn nested_domains(&self, names: &[&str]) -> Result<Arc<ProcessGroup>, TneError> {
        let mut groups = Vec::with_capacity(names.len());
        for name in names {
            let entry = self.entry(name)?;
            groups.push(self.groups.get(entry.group).ok_or_else(|| {
                TneError::CollectiveFailure(format!("group of `{name}` is gone"))
            })?);
        }
        execution_domain(&groups)
    }

    /// Schedules an accumulative addition `D += alpha * R` specified
    /// symbolically, e.g. `D(a,b) += R(b,a)`.
    pub fn add_tensors(&self, pattern: &str, alpha: ScalarValue) -> Result<(), TneError> {
        let spec = symbolic::parse_spec(pattern)?;
        if spec.rhs.len() != 1 {
            return Err(TneError::InvalidSymbolic(
                pattern.to_string(),
                "addition takes exactly one source tensor".to_string(),
            ));
        }
        let destination = self.entry(&spec.lhs.name)?;
        let source = self.entry(&spec.rhs[0].name)?;
        if destination.tensor.rank() != source.tensor.rank() {
            return Err(TneError::ShapeMismatch(format!(
                "rank mismatch in `{pattern}`"
            )));
        }
        self.nested_domains(&[&spec.lhs.name, &spec.rhs[0].name])?;
        let scalar = spec.scalar.unwrap_or(Complex64::new(1.0, 0.0)) * alpha.to_c64();
        self.append(TensorOperation::new(
            OpKind::Add {
                pattern: pattern.to_string(),
            },
            vec![spec.lhs.name.clone(), spec.rhs[0].name.clone()],
            vec![scalar],
        ))?;
        Ok(())
    }

    /// Adds tensors and blocks until the destination settles.
    pub fn add_tensors_sync(&self, pattern: &str, alpha: ScalarValue) -> Result<(), TneError> {
        let destination = symbolic::parse_spec(pattern)?.lhs.name;
        self.add_tensors(pattern, alpha)?;
        self.sync_tensor(&destination)
    }

    /// Schedules an accumulative binary contraction `D += alpha * L * R`
    /// specified symbolically, e.g. `D(a,b) += L(a,i) * R(i,b)`.
    pub fn contract_tensors(&self, pattern: &str, alpha: ScalarValue) -> Result<(), TneError> {
        let spec = symbolic::parse_spec(pattern)?;
        if spec.rhs.len() != 2 {
            return Err(TneError::InvalidSymbolic(
                pattern.to_string(),
                "contraction takes exactly two source tensors".to_string(),
            ));
        }
        for factor in std::iter::once(&spec.lhs).chain(spec.rhs.iter()) {
            let entry = self.entry(&factor.name)?;
            if entry.tensor.rank() != factor.indices.len() {
                return Err(TneError::DimensionMismatch(format!(
                    "tensor `{}` has rank {}, pattern lists {} indices",
                    factor.name,
                    entry.tensor.rank(),
                    factor.indices.len()
                )));
            }
        }
        self.nested_domains(&[&spec.lhs.name, &spec.rhs[0].name, &spec.rhs[1].name])?;
        let scalar = spec.scalar.unwrap_or(Complex64::new(1.0, 0.0)) * alpha.to_c64();
        self.append(TensorOperation::new(
            OpKind::Contract {
                pattern: pattern.to_string(),
            },
            vec![
                spec.lhs.name.clone(),
                spec.rhs[0].name.clone(),
                spec.rhs[1].name.clone(),
            ],
            vec![scalar],
        ))?;
        Ok(())
    }

    /// Contracts tensors and blocks until the destination settles.
    pub fn contract_tensors_sync(
        &self,
        pattern: &str,
        alpha: ScalarValue,
    ) -> Result<(), TneError> {
        let destination = symbolic::parse_spec(pattern)?.lhs.name;
        self.contract_tensors(pattern, alpha)?;
        self.sync_tensor(&destination)
    }

    /// Schedules a slice extraction; the slice tensor's base offsets locate
    /// the window inside the source.
    pub fn extract_slice(&self, slice: &str, source: &str) -> Result<(), TneError> {
        self.entry(slice)?;
        self.entry(source)?;
        self.append(TensorOperation::new(
            OpKind::Slice,
            vec![slice.to_string(), source.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    /// Schedules a slice insertion into `destination`.
    pub fn insert_slice(&self, destination: &str, slice: &str) -> Result<(), TneError> {
        self.entry(destination)?;
        self.entry(slice)?;
        self.append(TensorOperation::new(
            OpKind::Insert,
            vec![destination.to_string(), slice.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    // ----- decompositions ----------------------------------------------

    /// Schedules a three-factor SVD `D = L * S * R` with a diagonal middle
    /// factor, e.g. `D(a,b,c) = L(a,k) * S(k,l) * R(l,b,c)`. The factor
    /// tensors must exist.
    pub fn decompose_svd3(&self, pattern: &str) -> Result<(), TneError> {
        let spec = symbolic::parse_spec(pattern)?;
        if spec.rhs.len() != 3 {
            return Err(TneError::InvalidSymbolic(
                pattern.to_string(),
                "three-factor SVD takes three factors".to_string(),
            ));
        }
        let operands = vec![
            spec.rhs[0].name.clone(),
            spec.rhs[1].name.clone(),
            spec.rhs[2].name.clone(),
            spec.lhs.name.clone(),
        ];
        for name in &operands {
            self.entry(name)?;
        }
        self.append(TensorOperation::new(
            OpKind::DecomposeSvd3 {
                pattern: pattern.to_string(),
            },
            operands,
            vec![],
        ))?;
        Ok(())
    }

    /// Schedules a two-factor SVD `D = L * R` with singular values absorbed
    /// per `absorb`.
    pub fn decompose_svd2(&self, pattern: &str, absorb: SvdAbsorb) -> Result<(), TneError> {
        let spec = symbolic::parse_spec(pattern)?;
        if spec.rhs.len() != 2 {
            return Err(TneError::InvalidSymbolic(
                pattern.to_string(),
                "two-factor SVD takes two factors".to_string(),
            ));
        }
        let operands = vec![
            spec.rhs[0].name.clone(),
            spec.rhs[1].name.clone(),
            spec.lhs.name.clone(),
        ];
        for name in &operands {
            self.entry(name)?;
        }
        self.append(TensorOperation::new(
            OpKind::DecomposeSvd2 {
                pattern: pattern.to_string(),
                absorb,
            },
            operands,
            vec![],
        ))?;
        Ok(())
    }

    /// Schedules an SVD-based orthogonalization.
    pub fn orthogonalize_svd(&self, name: &str) -> Result<(), TneError> {
        self.entry(name)?;
        self.append(TensorOperation::new(
            OpKind::OrthogonalizeSvd,
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    /// Schedules a Modified Gram-Schmidt orthogonalization.
    pub fn orthogonalize_mgs(&self, name: &str) -> Result<(), TneError> {
        self.entry(name)?;
        self.append(TensorOperation::new(
            OpKind::OrthogonalizeMgs,
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    // ----- norms and readout (synchronous) -----------------------------

    fn with_synced_storage<R>(
        &self,
        name: &str,
        f: impl FnOnce(&ndarray::ArrayD<Complex64>) -> R,
    ) -> Result<R, TneError> {
        self.entry(name)?;
        self.sync_tensor(name)?;
        self.store.with_storage(name, |storage| f(&storage.data))
    }

    /// Largest element modulus.
    pub fn norm_max_abs(&self, name: &str) -> Result<f64, TneError> {
        self.with_synced_storage(name, |data| {
            data.iter().map(|v| v.norm()).fold(0.0, f64::max)
        })
    }

    /// 1-norm: the sum of element moduli.
    pub fn norm1(&self, name: &str) -> Result<f64, TneError> {
        self.with_synced_storage(name, |data| data.iter().map(|v| v.norm()).sum())
    }

    /// 2-norm.
    pub fn norm2(&self, name: &str) -> Result<f64, TneError> {
        self.with_synced_storage(name, |data| {
            data.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt()
        })
    }

    /// Per-slice 2-norms along one dimension.
    pub fn partial_norms(&self, name: &str, dim: u32) -> Result<Vec<f64>, TneError> {
        self.with_synced_storage(name, |data| {
            let axis = ndarray::Axis(dim as usize);
            (0..data.shape()[dim as usize])
                .map(|index| {
                    data.index_axis(axis, index)
                        .iter()
                        .map(Complex64::norm_sqr)
                        .sum::<f64>()
                        .sqrt()
                })
                .collect()
        })
    }

    /// Value of a rank-0 tensor.
    pub fn scalar_value(&self, name: &str) -> Result<Complex64, TneError> {
        self.with_synced_storage(name, |data| {
            assert_eq!(data.len(), 1, "`{name}` is not a scalar tensor");
            *data.iter().next().unwrap()
        })
    }

    /// Renders a tensor in the plain-text dump format.
    pub fn print_tensor(&self, name: &str) -> Result<String, TneError> {
        let entry = self.entry(name)?;
        self.sync_tensor(name)?;
        let elements = self.store.read_linear(name)?;
        let dump = TensorDump {
            name: name.to_string(),
            shape: entry.tensor.shape().to_vec(),
            offsets: (0..entry.tensor.rank())
                .map(|dim| {
                    let (space, subspace) = entry.tensor.signature()[dim];
                    if space == crate::types::SOME_SPACE {
                        subspace
                    } else {
                        0
                    }
                })
                .collect(),
            elements,
        };
        let mut buffer = Vec::new();
        io::write_dump(
            &mut buffer,
            &dump,
            DumpLayout::Dense,
            entry.element_type.is_complex(),
        )?;
        Ok(String::from_utf8(buffer).expect("dump output is UTF-8"))
    }

    /// Writes a tensor dump to a file.
    pub fn write_tensor_file(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        layout: DumpLayout,
    ) -> Result<(), TneError> {
        let text = match layout {
            DumpLayout::Dense => self.print_tensor(name)?,
            DumpLayout::List => {
                let entry = self.entry(name)?;
                self.sync_tensor(name)?;
                let elements = self.store.read_linear(name)?;
                let dump = TensorDump {
                    name: name.to_string(),
                    shape: entry.tensor.shape().to_vec(),
                    offsets: vec![0; entry.tensor.rank()],
                    elements,
                };
                let mut buffer = Vec::new();
                io::write_dump(
                    &mut buffer,
                    &dump,
                    DumpLayout::List,
                    entry.element_type.is_complex(),
                )?;
                String::from_utf8(buffer).expect("dump output is UTF-8")
            }
        };
        std::fs::write(path, text)?;
        Ok(())
    }

    // ----- distributed operations --------------------------------------

    /// Splits a process group by color; see
    /// [`crate::runtime::process_group::GroupRegistry::split`].
    pub fn split_group(&self, parent: GroupId, color: i32) -> Option<Arc<ProcessGroup>> {
        self.groups.split(parent, color)
    }

    /// Replicates a tensor within its group: ranks without storage create it,
    /// then the root broadcasts the data.
    pub fn replicate_tensor(&self, name: &str, root: ProcessRank) -> Result<(), TneError> {
        let entry = self.entry(name)?;
        let group = self.groups.get(entry.group).ok_or_else(|| {
            TneError::CollectiveFailure(format!("group of `{name}` is gone"))
        })?;
        if !self.store.contains(name) {
            self.append(TensorOperation::create(
                entry.tensor.clone(),
                entry.element_type,
            ))?;
        }
        let root_index = group
            .ranks()
            .iter()
            .position(|&r| r == root)
            .ok_or_else(|| {
                TneError::CollectiveFailure(format!("rank {root} outside the tensor group"))
            })?;
        self.append(TensorOperation::new(
            OpKind::Broadcast {
                root: root_index as ProcessRank,
                group: entry.group,
            },
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    /// Replicates and blocks until the local copy is consistent.
    pub fn replicate_tensor_sync(&self, name: &str, root: ProcessRank) -> Result<(), TneError> {
        self.replicate_tensor(name, root)?;
        self.sync_tensor(name)
    }

    /// Shrinks a tensor's existence domain to the root rank: other ranks
    /// destroy their storage.
    pub fn dereplicate_tensor(&self, name: &str, root: ProcessRank) -> Result<(), TneError> {
        let entry = self.entry(name)?;
        let group = self.groups.get(entry.group).ok_or_else(|| {
            TneError::CollectiveFailure(format!("group of `{name}` is gone"))
        })?;
        let my_global = group.ranks()[group.comm().rank()];
        if my_global == root {
            // Existence shrinks to the self group.
            let mut tensors = self.tensors.write().unwrap();
            let entry = tensors.get_mut(name).unwrap();
            let old_group = entry.group;
            entry.group = crate::runtime::process_group::SELF_GROUP;
            drop(tensors);
            self.groups.retain(crate::runtime::process_group::SELF_GROUP);
            self.groups.release(old_group);
        } else {
            self.destroy_tensor(name)?;
        }
        Ok(())
    }

    /// Schedules a broadcast of a tensor from `root` over its group.
    pub fn broadcast_tensor(&self, name: &str, root: ProcessRank) -> Result<(), TneError> {
        let entry = self.entry(name)?;
        let group = self.groups.get(entry.group).ok_or_else(|| {
            TneError::CollectiveFailure(format!("group of `{name}` is gone"))
        })?;
        let root_index = group
            .ranks()
            .iter()
            .position(|&r| r == root)
            .ok_or_else(|| {
                TneError::CollectiveFailure(format!("rank {root} outside the tensor group"))
            })?;
        self.append(TensorOperation::new(
            OpKind::Broadcast {
                root: root_index as ProcessRank,
                group: entry.group,
            },
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    /// Schedules an element-wise all-reduce of a tensor over its group.
    pub fn allreduce_tensor(&self, name: &str) -> Result<(), TneError> {
        let entry = self.entry(name)?;
        self.append(TensorOperation::new(
            OpKind::Allreduce { group: entry.group },
            vec![name.to_string()],
            vec![],
        ))?;
        Ok(())
    }

    // ----- evaluation --------------------------------------------------

    /// Evaluates a finalized tensor network into its output tensor
    /// (accumulative). The output tensor is created zero-initialized when it
    /// does not exist yet.
    pub fn evaluate_network(&self, network: &TensorNetwork) -> Result<(), TneError> {
        self.lower_network(network, WORLD_GROUP).map(|_| ())
    }

    /// Evaluates a network and blocks until the output settles.
    pub fn evaluate_network_sync(&self, network: &TensorNetwork) -> Result<(), TneError> {
        let output = self.lower_network(network, WORLD_GROUP)?;
        self.sync_tensor(&output)
    }

    /// Lowers a network evaluation into DAG operations. A missing output
    /// tensor is created inside `output_group`.
    fn lower_network(
        &self,
        network: &TensorNetwork,
        output_group: GroupId,
    ) -> Result<String, TneError> {
        if !network.is_finalized() {
            return Err(TneError::ShapeMismatch(format!(
                "network `{}` is not finalized",
                network.name()
            )));
        }
        let input_ids: Vec<TensorId> = network.input_ids().collect();
        if input_ids.is_empty() {
            return Err(TneError::ShapeMismatch(format!(
                "network `{}` has no input tensors",
                network.name()
            )));
        }
        // Validate operands and the nesting of their existence domains.
        let mut element_type = ElementType::Complex64;
        {
            let tensors = self.tensors.read().unwrap();
            let mut groups = Vec::with_capacity(input_ids.len());
            for (position, &id) in input_ids.iter().enumerate() {
                let conn = network.tensor_conn(id).unwrap();
                let entry = tensors.get(conn.tensor().name()).ok_or_else(|| {
                    TneError::UnknownTensor(conn.tensor().name().to_string())
                })?;
                if !entry.tensor.congruent(conn.tensor()) {
                    return Err(TneError::ShapeMismatch(format!(
                        "tensor `{}` does not match its declaration",
                        conn.tensor().name()
                    )));
                }
                if position == 0 {
                    element_type = entry.element_type;
                }
                groups.push(self.groups.get(entry.group).ok_or_else(|| {
                    TneError::CollectiveFailure(format!(
                        "group of `{}` is gone",
                        conn.tensor().name()
                    ))
                })?);
            }
            execution_domain(&groups)?;
        }

        // Ensure the output tensor exists.
        let output = network.output_tensor().clone();
        let output_name = output.name().to_string();
        match self.entry(&output_name) {
            Ok(entry) => {
                if !entry.tensor.congruent(&output) {
                    return Err(TneError::ShapeMismatch(format!(
                        "output tensor `{output_name}` exists with a different shape"
                    )));
                }
            }
            Err(TneError::UnknownTensor(_)) => {
                self.create_tensor_in_group(output, element_type, output_group)?;
            }
            Err(error) => return Err(error),
        }

        // Plan: consult the cache keyed by the structural hash.
        let key = network.structure_hash();
        let plan = match self.plan_cache.lookup(key) {
            Some(plan) => plan,
            None => {
                let (kind, config) = self.planner.read().unwrap().clone();
                let mut config = config;
                config.op_factor = element_type.op_factor();
                let plan = plan_network(network, kind, &config)?;
                debug!(
                    network = network.name(),
                    flops = plan.total_flops,
                    peak = plan.peak_volume;
                    "planned contraction sequence"
                );
                self.plan_cache.insert(key, plan.clone());
                plan
            }
        };

        if plan.is_empty() {
            // Single input: a permuted copy into the output.
            let pattern = network.identity_pattern(&output_name)?;
            let source = network
                .tensor_conn(input_ids[0])
                .unwrap()
                .tensor()
                .name()
                .to_string();
            self.append(TensorOperation::new(
                OpKind::Add { pattern },
                vec![output_name.clone(), source],
                vec![Complex64::new(1.0, 0.0)],
            ))?;
            return Ok(output_name);
        }

        // Replay the plan, emitting one contraction per triple with
        // intermediate creation before and destruction after the last use.
        let evaluation = self.evaluation_counter.fetch_add(1, Ordering::Relaxed);
        let mut work = network.clone();
        let mut actual: FxHashMap<TensorId, TensorId> =
            FxHashMap::with_capacity(input_ids.len() + plan.len());
        for (index, &id) in input_ids.iter().enumerate() {
            actual.insert_new((index + 1) as TensorId, id);
        }
        let mut next_actual = input_ids.iter().copied().max().unwrap() + 1;
        let mut intermediates: FxHashSet<String> = FxHashSet::default();
        let last = plan.len() - 1;
        for (step, triple) in plan.triples.iter().enumerate() {
            let left = actual[&triple.left];
            let right = actual[&triple.right];
            let left_name = work.tensor_conn(left).unwrap().tensor().name().to_string();
            let right_name = work.tensor_conn(right).unwrap().tensor().name().to_string();
            let result = next_actual;
            next_actual += 1;
            actual.insert(triple.result, result);

            if step == last {
                let pattern = work.merge_pattern(left, right, &output_name, true)?;
                work.merge(left, right, result)?;
                self.append(TensorOperation::new(
                    OpKind::Contract { pattern },
                    vec![output_name.clone(), left_name.clone(), right_name.clone()],
                    vec![Complex64::new(1.0, 0.0)],
                ))?;
            } else {
                let name = format!("_x{evaluation:x}n{result}");
                let pattern = work.merge_pattern(left, right, &name, false)?;
                work.merge(left, right, result)?;
                work.tensor_conn_mut(result).unwrap().rename_tensor(&name);
                let tensor = work.tensor_conn(result).unwrap().tensor().clone();
                self.append(TensorOperation::create(tensor, element_type))?;
                self.append(TensorOperation::new(
                    OpKind::Contract { pattern },
                    vec![name.clone(), left_name.clone(), right_name.clone()],
                    vec![Complex64::new(1.0, 0.0)],
                ))?;
                intermediates.insert(name);
            }
            // Intermediates are consumed exactly once: destroy after use.
            for operand in [&left_name, &right_name] {
                if intermediates.remove(operand) {
                    self.append(TensorOperation::destroy(operand.clone()))?;
                }
            }
        }
        Ok(output_name)
    }

    /// Evaluates a tensor expansion into an accumulator: every component
    /// network is evaluated into a temporary which is scaled and added. With
    /// `parallel_width > 1` the accumulator's group splits into that many
    /// subgroups; each subgroup evaluates its slice of the components, with
    /// the per-slice temporaries existing in the subgroup, and the partial
    /// accumulators are combined by an all-reduce over the full group. The
    /// subgroup is released once its slice is lowered.
    pub fn evaluate_expansion(
        &self,
        expansion: &TensorExpansion,
        accumulator: &str,
        parallel_width: usize,
    ) -> Result<(), TneError> {
        assert!(parallel_width >= 1, "parallel width must be positive");
        let entry = self.entry(accumulator)?;
        if entry.tensor.rank() != expansion.rank() {
            return Err(TneError::ShapeMismatch(format!(
                "accumulator `{accumulator}` has rank {}, expansion `{}` has rank {}",
                entry.tensor.rank(),
                expansion.name(),
                expansion.rank()
            )));
        }
        let group = self.groups.get(entry.group).ok_or_else(|| {
            TneError::CollectiveFailure(format!("group of `{accumulator}` is gone"))
        })?;
        let width = parallel_width.min(group.size()).max(1);
        let (my_slice, slice_group) = if width > 1 {
            let rank = group.comm().rank();
            let color = (rank * width / group.size()) as i32;
            let subgroup = self.groups.split(entry.group, color).ok_or_else(|| {
                TneError::CollectiveFailure(
                    "expansion slice split excluded this rank".to_string(),
                )
            })?;
            // Hold one reference for the duration of this evaluation; the
            // per-slice temporaries below add and drop their own.
            self.groups.retain(subgroup.id());
            (color as usize, Some(subgroup))
        } else {
            (0, None)
        };
        let slice_group_id = slice_group.as_ref().map_or(entry.group, |g| g.id());

        for (index, component) in expansion.iter().enumerate() {
            if index % width != my_slice {
                continue;
            }
            let evaluation = self.evaluation_counter.fetch_add(1, Ordering::Relaxed);
            let temporary = format!("_r{evaluation:x}");
            let net = component.network.duplicate(&temporary);
            self.lower_network(&net, slice_group_id)?;
            let pattern = symbolic::addition_pattern(
                entry.tensor.rank(),
                accumulator,
                &temporary,
                false,
            );
            self.append(TensorOperation::new(
                OpKind::Add { pattern },
                vec![accumulator.to_string(), temporary.clone()],
                vec![component.coefficient],
            ))?;
            self.destroy_tensor(&temporary)?;
        }
        if let Some(subgroup) = slice_group {
            self.groups.release(subgroup.id());
        }
        if width > 1 {
            self.append(TensorOperation::new(
                OpKind::Allreduce { group: entry.group },
                vec![accumulator.to_string()],
                vec![],
            ))?;
        }
        Ok(())
    }

    /// Evaluates an expansion and blocks until the accumulator settles.
    pub fn evaluate_expansion_sync(
        &self,
        expansion: &TensorExpansion,
        accumulator: &str,
        parallel_width: usize,
    ) -> Result<(), TneError> {
        self.evaluate_expansion(expansion, accumulator, parallel_width)?;
        self.sync_tensor(accumulator)
    }

    // ----- synchronization ---------------------------------------------

    /// Blocks until every operation touching the tensor has settled.
    pub fn sync_tensor(&self, name: &str) -> Result<(), TneError> {
        self.dag.await_tensor(name)
    }

    /// Blocks until all outstanding operations settle, optionally pruning
    /// completed nodes and destroyed-tensor metadata.
    pub fn sync_all(&self, clean_garbage: bool) -> Result<(), TneError> {
        let result = self.dag.await_all();
        if clean_garbage {
            self.dag.clean_garbage();
        }
        result
    }

    // ----- configuration -----------------------------------------------

    /// Selects the contraction planner (`dummy`, `heuro`, `greed`, `metis`).
    pub fn select_planner(&self, name: &str) -> Result<(), TneError> {
        let kind = PlannerKind::from_name(name).ok_or_else(|| {
            TneError::InvalidSymbolic(name.to_string(), "unknown planner".to_string())
        })?;
        self.planner.write().unwrap().0 = kind;
        Ok(())
    }

    /// Sets the planner's peak-memory ceiling in log2 elements.
    pub fn set_memory_ceiling_log2(&self, ceiling: Option<f64>) {
        self.planner.write().unwrap().1.memory_ceiling_log2 = ceiling;
    }

    /// Selects the computational backend (`default`, `cuquantum`).
    pub fn select_backend(&self, name: &str) -> Result<(), TneError> {
        let kind = BackendKind::from_name(name).ok_or_else(|| {
            TneError::BackendUnavailable(name.to_string())
        })?;
        if kind == BackendKind::CuQuantum {
            return Err(TneError::BackendUnavailable("cuquantum".to_string()));
        }
        *self.backend.write().unwrap() = kind;
        Ok(())
    }

    /// The currently selected backend.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        *self.backend.read().unwrap()
    }

    /// The whole-network queue used by network-level backends.
    #[must_use]
    pub fn network_queue(&self) -> &TensorNetworkQueue {
        &self.network_queue
    }

    /// Turns plan caching on or off.
    pub fn set_plan_caching(&self, enabled: bool) {
        self.plan_cache.set_enabled(enabled);
    }

    /// Persists all cached plans to a file.
    pub fn persist_plan_cache(&self, path: impl AsRef<Path>) -> Result<(), TneError> {
        self.plan_cache.persist(path)
    }

    /// Merges persisted plans into the cache.
    pub fn load_plan_cache(&self, path: impl AsRef<Path>) -> Result<usize, TneError> {
        self.plan_cache.load(path)
    }

    /// Plan cache hit/miss counters (test hook).
    #[must_use]
    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.plan_cache.stats()
    }

    /// Toggles dry-run mode.
    pub fn set_dry_run(&self, dry_run: bool) {
        self.node_executor.set_dry_run(dry_run);
    }

    /// Toggles fast-math mode.
    pub fn set_fast_math(&self, fast_math: bool) {
        self.node_executor.set_fast_math(fast_math);
    }

    /// Total flops executed by the backend so far.
    #[must_use]
    pub fn flop_count(&self) -> f64 {
        self.node_executor.flops()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
