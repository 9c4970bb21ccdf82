//! The fusion container: ordered tensor and op registry with definition and
//! use lookup.
//!
//! Tensors do not hold back-pointers to their defining op; the fusion owns
//! both directions of the relation and is the single source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::ensure;

use crate::error::{self, Result};
use crate::ops::TensorOp;
use crate::tensor::{TensorKey, TensorView};

#[derive(Debug, Default)]
pub struct Fusion {
    tensors: Vec<Arc<TensorView>>,
    ops: Vec<Arc<TensorOp>>,
    definition: HashMap<TensorKey, Arc<TensorOp>>,
    uses: HashMap<TensorKey, Vec<Arc<TensorOp>>>,
}

impl Fusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor that has no op attached (a fusion input or a
    /// dangling output). Idempotent.
    pub fn add_tensor(&mut self, tv: &Arc<TensorView>) {
        if !self.tensors.iter().any(|t| t.id() == tv.id()) {
            self.tensors.push(tv.clone());
        }
    }

    /// Register an op, along with its input and output tensors. The output
    /// must not already have a definition.
    pub fn add_op(&mut self, op: &Arc<TensorOp>) -> Result<()> {
        let out_key = TensorKey(op.output().clone());
        ensure!(
            !self.definition.contains_key(&out_key),
            error::OutputRedefinedSnafu { tv: op.output().to_string() }
        );
        self.add_tensor(op.output());
        self.definition.insert(out_key, op.clone());
        for input in op.inputs() {
            self.add_tensor(input);
            self.uses.entry(TensorKey(input.clone())).or_default().push(op.clone());
        }
        self.ops.push(op.clone());
        Ok(())
    }

    /// Tensors in registration order.
    pub fn tensors(&self) -> &[Arc<TensorView>] {
        &self.tensors
    }

    /// Ops in registration order.
    pub fn ops(&self) -> &[Arc<TensorOp>] {
        &self.ops
    }

    /// The op defining `tv`, if any (fusion inputs have none).
    pub fn definition_of(&self, tv: &Arc<TensorView>) -> Option<&Arc<TensorOp>> {
        self.definition.get(&TensorKey(tv.clone()))
    }

    /// Every op consuming `tv`, in registration order.
    pub fn uses_of(&self, tv: &Arc<TensorView>) -> &[Arc<TensorOp>] {
        self.uses.get(&TensorKey(tv.clone())).map(Vec::as_slice).unwrap_or(&[])
    }
}
