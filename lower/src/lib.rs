//! Lowering layer of the forge kernel generator.
//!
//! Two subsystems live here. The iteration-domain equivalence graphs decide
//! which loop axes across fused tensors share an iteration variable: a
//! generic union-find ([`DisjointSets`]), a single equivalence relation with
//! derived definition/use edges between classes ([`IdGraph`]), and the
//! per-mapping-mode collection built from a fusion ([`IterDomainGraphs`]).
//!
//! On top of them, the double-buffer pass rewrites an already-lowered loop
//! nest so asynchronous global-to-shared loads overlap with compute: it
//! splits each annotated loop into prologue, main and epilogue stages and
//! inserts the required synchronization ([`double_buffer`]).
//!
//! # Module Organization
//!
//! - [`disjoint`] - Union-find with stable group handles
//! - [`id_graph`] - One equivalence relation over iter domains + expressions
//! - [`id_graphs`] - Per-mode graph collection, promotion, self-mapping
//! - [`kir`] - Kernel IR: the loop tree and GPU synchronization primitives
//! - [`context`] - Explicit lowering context handed to every pass
//! - [`double_buffer`] - The double/circular-buffer loop transformation

pub mod context;
pub mod disjoint;
pub mod double_buffer;
pub mod error;
pub mod id_graph;
pub mod id_graphs;
pub mod kir;

#[cfg(test)]
pub mod test;

pub use context::{LowerContext, PredicatePeelingInfo, SyncBits, SyncMap};
pub use disjoint::{DisjointSets, SetId, UniqueVec};
pub use double_buffer::{double_buffer_axis, double_buffer_axis_position, DoubleBufferInfo, DoubleBufferPass};
pub use error::{Error, Result};
pub use id_graph::{ExprGroup, IdGraph, IdGraphStmtSort, IdGroup};
pub use id_graphs::{IdMappingMode, IterDomainGraphs, SelfMappingInfo};
pub use kir::{DoubleBufferStage, ForLoop, KirExpr, StmtId};
