//! Scalar value DAG.
//!
//! Extents, loop bounds and address arithmetic are represented as shared
//! [`Val`] nodes. Arithmetic constructors fold constant operands so the
//! lowered tree does not accumulate trivial expressions, and [`Val::same_as`]
//! implements the structural equality the equivalence graphs compare extents
//! with.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::next_node_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BinaryScalarOp {
    #[strum(to_string = "+")]
    Add,
    #[strum(to_string = "-")]
    Sub,
    #[strum(to_string = "*")]
    Mul,
    #[strum(to_string = "ceilDiv")]
    CeilDiv,
    #[strum(to_string = "%")]
    Mod,
}

#[derive(Debug)]
pub enum ValKind {
    /// Compile-time integer constant.
    Const(i64),
    /// Named symbolic scalar (loop index, runtime extent, switch index).
    Scalar { name: String },
    /// Binary arithmetic over two values.
    Binary { op: BinaryScalarOp, lhs: Arc<Val>, rhs: Arc<Val> },
}

/// A scalar value node. Identity (`id`) is unique per node; structural
/// equality goes through [`Val::same_as`].
#[derive(Debug)]
pub struct Val {
    id: u64,
    kind: ValKind,
}

// Memo for structural equality, keyed by node-identity pairs. Bounded by the
// number of distinct pairs actually compared during a build.
thread_local! {
    static SAME_AS_MEMO: RefCell<HashMap<(u64, u64), bool>> = RefCell::new(HashMap::new());
}

impl Val {
    pub fn constant(value: i64) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), kind: ValKind::Const(value) })
    }

    pub fn zero() -> Arc<Self> {
        Self::constant(0)
    }

    pub fn one() -> Arc<Self> {
        Self::constant(1)
    }

    pub fn scalar(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), kind: ValKind::Scalar { name: name.into() } })
    }

    /// A fresh uniquely-named scalar, e.g. `i12` for loop indices or `db7`
    /// for double-buffer switch registers.
    pub fn fresh_scalar(prefix: &str) -> Arc<Self> {
        let id = next_node_id();
        Arc::new(Self { id, kind: ValKind::Scalar { name: format!("{prefix}{id}") } })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ValKind {
        &self.kind
    }

    pub fn as_const(&self) -> Option<i64> {
        match self.kind {
            ValKind::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn is_zero(&self) -> bool {
        self.as_const() == Some(0)
    }

    pub fn is_one(&self) -> bool {
        self.as_const() == Some(1)
    }

    fn binary(op: BinaryScalarOp, lhs: Arc<Val>, rhs: Arc<Val>) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), kind: ValKind::Binary { op, lhs, rhs } })
    }

    /// `lhs + rhs`, folding constants and additive identities.
    pub fn add(lhs: &Arc<Val>, rhs: &Arc<Val>) -> Arc<Val> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Self::constant(a + b),
            (Some(0), _) => rhs.clone(),
            (_, Some(0)) => lhs.clone(),
            _ => Self::binary(BinaryScalarOp::Add, lhs.clone(), rhs.clone()),
        }
    }

    /// `lhs - rhs`, folding constants and `x - 0`.
    pub fn sub(lhs: &Arc<Val>, rhs: &Arc<Val>) -> Arc<Val> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Self::constant(a - b),
            (_, Some(0)) => lhs.clone(),
            _ => Self::binary(BinaryScalarOp::Sub, lhs.clone(), rhs.clone()),
        }
    }

    /// `lhs * rhs`, folding constants and multiplicative identities.
    pub fn mul(lhs: &Arc<Val>, rhs: &Arc<Val>) -> Arc<Val> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Self::constant(a * b),
            (Some(1), _) => rhs.clone(),
            (_, Some(1)) => lhs.clone(),
            _ => Self::binary(BinaryScalarOp::Mul, lhs.clone(), rhs.clone()),
        }
    }

    /// `ceil(lhs / rhs)`, folding constants and division by one.
    pub fn ceil_div(lhs: &Arc<Val>, rhs: &Arc<Val>) -> Arc<Val> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) if b > 0 => Self::constant((a + b - 1) / b),
            (_, Some(1)) => lhs.clone(),
            _ => Self::binary(BinaryScalarOp::CeilDiv, lhs.clone(), rhs.clone()),
        }
    }

    /// `lhs % rhs`, folding constants and modulo-by-one.
    pub fn modulo(lhs: &Arc<Val>, rhs: &Arc<Val>) -> Arc<Val> {
        match (lhs.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) if b > 0 => Self::constant(a % b),
            (_, Some(1)) => Self::zero(),
            _ => Self::binary(BinaryScalarOp::Mod, lhs.clone(), rhs.clone()),
        }
    }

    /// Structural equality, memoised on node identity pairs.
    ///
    /// Named scalars compare by name, so two independently created extents
    /// of the same runtime symbol are considered equal. Comparison is by
    /// value shape, never numeric evaluation of symbolic subtrees.
    pub fn same_as(self: &Arc<Val>, other: &Arc<Val>) -> bool {
        if self.id == other.id {
            return true;
        }
        let key = if self.id < other.id { (self.id, other.id) } else { (other.id, self.id) };
        if let Some(hit) = SAME_AS_MEMO.with(|memo| memo.borrow().get(&key).copied()) {
            return hit;
        }
        let result = match (&self.kind, &other.kind) {
            (ValKind::Const(a), ValKind::Const(b)) => a == b,
            (ValKind::Scalar { name: a }, ValKind::Scalar { name: b }) => a == b,
            (
                ValKind::Binary { op: op_a, lhs: lhs_a, rhs: rhs_a },
                ValKind::Binary { op: op_b, lhs: lhs_b, rhs: rhs_b },
            ) => op_a == op_b && lhs_a.same_as(lhs_b) && rhs_a.same_as(rhs_b),
            _ => false,
        };
        SAME_AS_MEMO.with(|memo| memo.borrow_mut().insert(key, result));
        result
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValKind::Const(v) => write!(f, "{v}"),
            ValKind::Scalar { name } => write!(f, "{name}"),
            ValKind::Binary { op: BinaryScalarOp::CeilDiv, lhs, rhs } => write!(f, "ceilDiv({lhs}, {rhs})"),
            ValKind::Binary { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
        }
    }
}
