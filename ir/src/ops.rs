//! Tensor-level operations.
//!
//! The lowering passes recognise these structurally: `LoadStore` ops are the
//! only candidates for double buffering, `Permute` realigns root domains,
//! and `Unary`/`Binary` are the compute ops consuming buffered tensors.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{self, Result};
use crate::iter_domain::IterDomain;
use crate::next_node_id;
use crate::tensor::TensorView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum LoadStoreOpType {
    /// Plain register/shared copy.
    Set,
    /// Asynchronous global-to-shared copy, L1-cached.
    CpAsyncCa,
    /// Asynchronous global-to-shared copy, L2-only.
    CpAsyncCg,
    /// Warp-collective shared-memory matrix fragment load.
    LdMatrix,
}

impl LoadStoreOpType {
    pub fn is_cp_async(self) -> bool {
        matches!(self, Self::CpAsyncCa | Self::CpAsyncCg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpType {
    Set,
    Neg,
    Exp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOpType {
    Add,
    Mul,
}

#[derive(Debug, Clone)]
pub enum TensorOpKind {
    LoadStore { op_type: LoadStoreOpType },
    Unary { op_type: UnaryOpType },
    Binary { op_type: BinaryOpType },
    /// Root-domain permutation: output root `k` reads input root `order[k]`.
    Permute { order: Vec<usize> },
}

/// A tensor-level operation with ordered tensor inputs and one output.
#[derive(Debug)]
pub struct TensorOp {
    id: u64,
    kind: TensorOpKind,
    inputs: SmallVec<[Arc<TensorView>; 2]>,
    output: Arc<TensorView>,
}

impl TensorOp {
    pub fn load_store(op_type: LoadStoreOpType, input: &Arc<TensorView>, output: &Arc<TensorView>) -> Result<Arc<Self>> {
        Self::build(TensorOpKind::LoadStore { op_type }, &[input.clone()], output)
    }

    pub fn unary(op_type: UnaryOpType, input: &Arc<TensorView>, output: &Arc<TensorView>) -> Result<Arc<Self>> {
        Self::build(TensorOpKind::Unary { op_type }, &[input.clone()], output)
    }

    pub fn binary(
        op_type: BinaryOpType,
        lhs: &Arc<TensorView>,
        rhs: &Arc<TensorView>,
        output: &Arc<TensorView>,
    ) -> Result<Arc<Self>> {
        Self::build(TensorOpKind::Binary { op_type }, &[lhs.clone(), rhs.clone()], output)
    }

    pub fn permute(order: Vec<usize>, input: &Arc<TensorView>, output: &Arc<TensorView>) -> Result<Arc<Self>> {
        let rank = input.domain().root().len();
        let mut seen = vec![false; rank];
        for &position in &order {
            if position >= rank || seen[position] {
                return error::InvalidPermutationSnafu { order: order.clone(), rank }.fail();
            }
            seen[position] = true;
        }
        ensure!(order.len() == rank, error::InvalidPermutationSnafu { order: order.clone(), rank });
        Self::build(TensorOpKind::Permute { order }, &[input.clone()], output)
    }

    fn build(kind: TensorOpKind, inputs: &[Arc<TensorView>], output: &Arc<TensorView>) -> Result<Arc<Self>> {
        for input in inputs {
            ensure!(
                input.domain().root().len() == output.domain().root().len(),
                error::RootRankMismatchSnafu {
                    producer: input.to_string(),
                    consumer: output.to_string(),
                    producer_rank: input.domain().root().len(),
                    consumer_rank: output.domain().root().len(),
                }
            );
        }
        Ok(Arc::new(Self { id: next_node_id(), kind, inputs: inputs.iter().cloned().collect(), output: output.clone() }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &TensorOpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[Arc<TensorView>] {
        &self.inputs
    }

    pub fn output(&self) -> &Arc<TensorView> {
        &self.output
    }

    pub fn load_store_type(&self) -> Option<LoadStoreOpType> {
        match self.kind {
            TensorOpKind::LoadStore { op_type } => Some(op_type),
            _ => None,
        }
    }

    pub fn is_load_store(&self) -> bool {
        self.load_store_type().is_some()
    }

    pub fn is_ld_matrix(&self) -> bool {
        self.load_store_type() == Some(LoadStoreOpType::LdMatrix)
    }

    /// Producer/consumer root axis pairs implied by this op, in consumer
    /// root order. `Permute` realigns; every other op maps positionally.
    pub fn root_pairs(&self, producer: &Arc<TensorView>) -> Vec<(Arc<IterDomain>, Arc<IterDomain>)> {
        let producer_root = producer.domain().root();
        let consumer_root = self.output.domain().root();
        match &self.kind {
            TensorOpKind::Permute { order } => order
                .iter()
                .zip(consumer_root)
                .map(|(&from, consumer_id)| (producer_root[from].clone(), consumer_id.clone()))
                .collect(),
            _ => producer_root.iter().cloned().zip(consumer_root.iter().cloned()).collect(),
        }
    }
}

impl fmt::Display for TensorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.kind {
            TensorOpKind::LoadStore { op_type } => return write_op(f, &format!("LoadStore.{op_type}"), self),
            TensorOpKind::Unary { .. } => "Unary",
            TensorOpKind::Binary { .. } => "Binary",
            TensorOpKind::Permute { .. } => "Permute",
        };
        write_op(f, name, self)
    }
}

fn write_op(f: &mut fmt::Formatter<'_>, name: &str, op: &TensorOp) -> fmt::Result {
    write!(f, "{name}({} <- ", op.output.name())?;
    for (i, input) in op.inputs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", input.name())?;
    }
    write!(f, ")")
}

/// Hash/Eq wrapper over `Arc<TensorOp>` keyed by the stable node id.
#[derive(Clone)]
pub struct TensorOpKey(pub Arc<TensorOp>);

impl fmt::Debug for TensorOpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorOpKey({})", self.0)
    }
}

impl PartialEq for TensorOpKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TensorOpKey {}

impl Hash for TensorOpKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
