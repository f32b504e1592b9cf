//! Numerical engine for evaluating tensor networks and tensor network
//! expansions on distributed hardware.
//!
//! Clients declare symbolic tensors, compose them into networks (contraction
//! graphs) and linear combinations of networks (expansions), and ask the
//! [`engine::Engine`] to materialize the result. The engine plans a binary
//! contraction sequence ([`contractionpath`]), lowers it into primitive
//! tensor operations on a data-flow DAG ([`dag`]), and drains the DAG with a
//! pipelined executor ([`runtime::executor`]) over a backend implementing the
//! node-executor contract ([`runtime::node_executor`]). Distribution is
//! expressed through process groups and existence domains
//! ([`runtime::process_group`]), with composite (block-split) tensors in
//! [`tensornetwork::composite`].

pub mod bytepacket;
pub mod contractionpath;
pub mod dag;
pub mod engine;
pub mod error;
pub mod io;
pub mod metisgraph;
pub mod reconstructor;
pub mod registry;
pub mod runtime;
pub mod symbolic;
pub mod tensornetwork;
pub mod types;
pub mod utils;
