//! Fusion IR for the forge kernel generator.
//!
//! This crate defines the tensor-program representation the lowering passes
//! operate on: scalar values ([`Val`]), loop axes ([`IterDomain`]), tensors
//! ([`TensorView`]), the transformations connecting a tensor's root axes to
//! its leaf axes ([`Expr`]), tensor-level operations ([`TensorOp`]) and the
//! [`Fusion`] container tying them together.
//!
//! # Module Organization
//!
//! - [`val`] - Scalar value DAG with folding constructors
//! - [`iter_domain`] - Loop axes
//! - [`expr`] - Domain transforms (Split/Merge/Swizzle)
//! - [`ops`] - Tensor-level operations (LoadStore/Unary/Binary/Permute)
//! - [`tensor`] - Tensor views and tensor domains
//! - [`fusion`] - Expression/tensor registry with definition and use lookup

use std::cell::Cell;

pub mod error;
pub mod expr;
pub mod fusion;
pub mod iter_domain;
pub mod ops;
pub mod tensor;
pub mod types;
pub mod val;

#[cfg(test)]
pub mod test;

pub use error::{Error, Result};
pub use expr::{Expr, ExprKey, ExprOp, SwizzleKind, SwizzleMode};
pub use fusion::Fusion;
pub use iter_domain::{IdKey, IterDomain};
pub use ops::{BinaryOpType, LoadStoreOpType, TensorOp, TensorOpKey, TensorOpKind, UnaryOpType};
pub use tensor::{TensorDomain, TensorKey, TensorView};
pub use types::{DType, IterType, MemoryType, ParallelType};
pub use val::{BinaryScalarOp, Val, ValKind};

// Thread-local counter for node identities.
//
// Every IR node (values, iter domains, tensors, expressions) draws from the
// same monotonic counter, so an id uniquely identifies a node across kinds.
// Cell keeps this single-threaded and free of atomics; construction happens
// on one thread and shared nodes are structurally immutable afterwards.
thread_local! {
    static NODE_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

pub(crate) fn next_node_id() -> u64 {
    NODE_ID_COUNTER.with(|counter| {
        let id = counter.get();
        counter.set(id + 1);
        id
    })
}
