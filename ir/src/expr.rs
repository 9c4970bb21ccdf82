//! Domain transforms: the expressions connecting a tensor's root axes to its
//! leaf axes.
//!
//! Three structural kinds are recognised by the equivalence graphs: `Split`
//! (one axis into outer/inner), `Merge` (outer/inner into one axis) and
//! two-dimensional `Swizzle`. Output extents are derived from the inputs at
//! construction time.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::error::{self, Result};
use crate::iter_domain::IterDomain;
use crate::next_node_id;
use crate::types::IterType;
use crate::val::Val;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SwizzleKind {
    NoSwizzle,
    ZShape,
    Xor,
    CyclicShift,
}

/// Data swizzles permute the physical layout; loop swizzles only reorder
/// traversal and are identity for indexing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SwizzleMode {
    Data,
    Loop,
}

#[derive(Debug, Clone)]
pub enum ExprOp {
    /// Split one axis by `factor`. `inner_split` puts the factor on the
    /// inner output (outer = ceilDiv(extent, factor)); otherwise the factor
    /// lands on the outer output.
    Split { factor: Arc<Val>, inner_split: bool },
    /// Merge outer and inner axes into one axis of product extent.
    Merge,
    /// Two-dimensional swizzle of a pair of axes.
    Swizzle { kind: SwizzleKind, mode: SwizzleMode },
}

impl ExprOp {
    /// Structural kind without attributes, for congruence pre-checks.
    pub fn kind_matches(&self, other: &ExprOp) -> bool {
        matches!(
            (self, other),
            (ExprOp::Split { .. }, ExprOp::Split { .. })
                | (ExprOp::Merge, ExprOp::Merge)
                | (ExprOp::Swizzle { .. }, ExprOp::Swizzle { .. })
        )
    }
}

/// A domain transform with ordered iter-domain inputs and outputs.
#[derive(Debug)]
pub struct Expr {
    id: u64,
    op: ExprOp,
    inputs: SmallVec<[Arc<IterDomain>; 2]>,
    outputs: SmallVec<[Arc<IterDomain>; 2]>,
}

impl Expr {
    /// Split `input` by `factor`; outputs are `[outer, inner]`.
    pub fn split(input: &Arc<IterDomain>, factor: Arc<Val>, inner_split: bool) -> Arc<Self> {
        let (outer_extent, inner_extent) = if inner_split {
            (Val::ceil_div(input.extent(), &factor), factor.clone())
        } else {
            (factor.clone(), Val::ceil_div(input.extent(), &factor))
        };
        let outer = input.like(outer_extent);
        let inner = input.like(inner_extent);
        Arc::new(Self {
            id: next_node_id(),
            op: ExprOp::Split { factor, inner_split },
            inputs: smallvec![input.clone()],
            outputs: smallvec![outer, inner],
        })
    }

    /// Merge `[outer, inner]` into one axis; broadcast only if both inputs
    /// are broadcast.
    pub fn merge(outer: &Arc<IterDomain>, inner: &Arc<IterDomain>) -> Arc<Self> {
        let extent = Val::mul(outer.extent(), inner.extent());
        let out = if outer.is_broadcast() && inner.is_broadcast() {
            IterDomain::builder().extent(extent).iter_type(IterType::Broadcast).build()
        } else {
            let template = if outer.is_broadcast() { inner } else { outer };
            template.like(extent)
        };
        Arc::new(Self {
            id: next_node_id(),
            op: ExprOp::Merge,
            inputs: smallvec![outer.clone(), inner.clone()],
            outputs: smallvec![out],
        })
    }

    /// Swizzle a pair of axes; outputs mirror the input extents.
    pub fn swizzle(kind: SwizzleKind, mode: SwizzleMode, x: &Arc<IterDomain>, y: &Arc<IterDomain>) -> Arc<Self> {
        let out_x = x.like(x.extent().clone());
        let out_y = y.like(y.extent().clone());
        Arc::new(Self {
            id: next_node_id(),
            op: ExprOp::Swizzle { kind, mode },
            inputs: smallvec![x.clone(), y.clone()],
            outputs: smallvec![out_x, out_y],
        })
    }

    /// Replay this transform onto new inputs, minting fresh outputs with
    /// extents derived from the new inputs.
    pub fn replay_with_inputs(&self, new_inputs: &[Arc<IterDomain>]) -> Result<Arc<Self>> {
        snafu::ensure!(
            new_inputs.len() == self.inputs.len(),
            error::ReplayArityMismatchSnafu { expected: self.inputs.len(), found: new_inputs.len() }
        );
        Ok(match &self.op {
            ExprOp::Split { factor, inner_split } => Self::split(&new_inputs[0], factor.clone(), *inner_split),
            ExprOp::Merge => Self::merge(&new_inputs[0], &new_inputs[1]),
            ExprOp::Swizzle { kind, mode } => Self::swizzle(*kind, *mode, &new_inputs[0], &new_inputs[1]),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn op(&self) -> &ExprOp {
        &self.op
    }

    pub fn inputs(&self) -> &[Arc<IterDomain>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<IterDomain>] {
        &self.outputs
    }

    pub fn is_loop_swizzle(&self) -> bool {
        matches!(self.op, ExprOp::Swizzle { mode: SwizzleMode::Loop, .. })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.op {
            ExprOp::Split { .. } => "Split",
            ExprOp::Merge => "Merge",
            ExprOp::Swizzle { kind, .. } => return write_expr(f, &format!("Swizzle.{kind}"), self),
        };
        write_expr(f, name, self)
    }
}

fn write_expr(f: &mut fmt::Formatter<'_>, name: &str, expr: &Expr) -> fmt::Result {
    write!(f, "{name}(")?;
    for (i, id) in expr.inputs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{id}")?;
    }
    write!(f, " -> ")?;
    for (i, id) in expr.outputs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{id}")?;
    }
    write!(f, ")")
}

/// Hash/Eq wrapper over `Arc<Expr>` keyed by the stable node id.
#[derive(Clone)]
pub struct ExprKey(pub Arc<Expr>);

impl fmt::Debug for ExprKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExprKey({})", self.0)
    }
}

impl PartialEq for ExprKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ExprKey {}

impl Hash for ExprKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
