//! Error taxonomy of the engine.
//!
//! Contract violations and resource problems are reported as [`TneError`]
//! values; invariant breaks inside the core (DAG cycles, domain nesting
//! violations, graph post-conditions) are programmer errors and panic.

use thiserror::Error;

use crate::types::{SpaceId, SubspaceId};

/// Any error surfaced to a client of the engine.
#[derive(Debug, Clone, Error)]
pub enum TneError {
    /// No tensor registered under this name.
    #[error("unknown tensor `{0}`")]
    UnknownTensor(String),

    /// A tensor with this name already exists.
    #[error("tensor `{0}` already exists")]
    TensorExists(String),

    /// No space registered under this id.
    #[error("unknown space id {0}")]
    UnknownSpace(SpaceId),

    /// No subspace registered under this id within the space.
    #[error("unknown subspace {subspace} in space {space}")]
    UnknownSubspace { space: SpaceId, subspace: SubspaceId },

    /// A space or subspace with this name already exists.
    #[error("space or subspace `{0}` already exists")]
    SpaceExists(String),

    /// A subspace range exceeds the extent of its space.
    #[error("subspace upper bound {upper} exceeds extent {extent} of space `{space}`")]
    SubspaceOutOfRange {
        space: String,
        upper: u64,
        extent: u64,
    },

    /// Shape mismatch in an addition or initialization.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Dimension mismatch in a contraction.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A symbolic specification could not be parsed.
    #[error("invalid symbolic specification `{0}`: {1}")]
    InvalidSymbolic(String, String),

    /// Operand existence domains are not properly nested.
    #[error("operand domains are not nested: {0}")]
    DomainNesting(String),

    /// Host or device memory exhausted, even after garbage collection.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: u64, available: u64 },

    /// A backend kernel failed; the failure propagates to all dependents.
    #[error("backend failure in operation {node}: {message}")]
    BackendFailure { node: u64, message: String },

    /// Process group membership mismatch in a collective operation.
    #[error("collective failure: {0}")]
    CollectiveFailure(String),

    /// No contraction plan satisfies the memory ceiling.
    #[error("no contraction plan meets the memory ceiling of 2^{ceiling_log2} elements")]
    PlannerInfeasible { ceiling_log2: f64 },

    /// The requested backend is not available in this build.
    #[error("backend `{0}` is not available")]
    BackendUnavailable(String),

    /// The engine is shutting down and refuses new submissions.
    #[error("engine is shut down")]
    ShutDown,

    /// A file with tensor data could not be read or written.
    #[error("tensor dump i/o failed: {0}")]
    DumpIo(String),
}

impl From<std::io::Error> for TneError {
    fn from(err: std::io::Error) -> Self {
        TneError::DumpIo(err.to_string())
    }
}
