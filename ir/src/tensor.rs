//! Tensor views and tensor domains.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::expr::Expr;
use crate::iter_domain::IterDomain;
use crate::next_node_id;
use crate::types::{DType, MemoryType};

/// The axis structure of a tensor: the root axes it was created with, the
/// leaf axes loops are generated from, and the transforms connecting them.
#[derive(Debug, Clone)]
pub struct TensorDomain {
    root: Vec<Arc<IterDomain>>,
    leaf: Vec<Arc<IterDomain>>,
    transforms: Vec<Arc<Expr>>,
}

impl TensorDomain {
    /// An untransformed domain: leaf axes are the root axes.
    pub fn new(root: Vec<Arc<IterDomain>>) -> Self {
        Self { leaf: root.clone(), root, transforms: Vec::new() }
    }

    /// A transformed domain. `transforms` must be topologically ordered from
    /// root towards leaf; callers build them with [`Expr::split`] and
    /// friends, which derive the outputs.
    pub fn transformed(root: Vec<Arc<IterDomain>>, leaf: Vec<Arc<IterDomain>>, transforms: Vec<Arc<Expr>>) -> Self {
        Self { root, leaf, transforms }
    }

    pub fn root(&self) -> &[Arc<IterDomain>] {
        &self.root
    }

    pub fn leaf(&self) -> &[Arc<IterDomain>] {
        &self.leaf
    }

    pub fn transforms(&self) -> &[Arc<Expr>] {
        &self.transforms
    }
}

/// A tensor in the fusion: ordered axes plus scheduling and placement
/// metadata. Immutable once built; scheduling decisions are baked in by the
/// time lowering runs.
#[derive(Debug)]
pub struct TensorView {
    id: u64,
    name: String,
    domain: TensorDomain,
    dtype: DType,
    memory_type: MemoryType,
    compute_at_pos: usize,
    compute_with: bool,
    double_buffered: bool,
    circular_buffer_depth: Option<u64>,
    lift_read_address: bool,
}

#[bon::bon]
impl TensorView {
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        domain: TensorDomain,
        #[builder(default = DType::Float32)] dtype: DType,
        #[builder(default = MemoryType::Global)] memory_type: MemoryType,
        #[builder(default = 0)] compute_at: usize,
        #[builder(default = false)] compute_with: bool,
        #[builder(default = false)] double_buffered: bool,
        circular_buffer_depth: Option<u64>,
        #[builder(default = false)] lift_read_address: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_node_id(),
            name: name.into(),
            domain,
            dtype,
            memory_type,
            compute_at_pos: compute_at,
            compute_with,
            double_buffered,
            circular_buffer_depth,
            lift_read_address,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &TensorDomain {
        &self.domain
    }

    pub fn rank(&self) -> usize {
        self.domain.leaf().len()
    }

    pub fn axis(&self, position: usize) -> &Arc<IterDomain> {
        &self.domain.leaf()[position]
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn compute_at_position(&self) -> usize {
        self.compute_at_pos
    }

    /// The position at or before which this producer is computed inside
    /// `_consumer`'s loop nest. computeWith resolution is out of scope, so
    /// this is the compute-at position for every consumer.
    pub fn compute_position_of(&self, _consumer: &TensorView) -> usize {
        self.compute_at_pos
    }

    pub fn has_compute_with(&self) -> bool {
        self.compute_with
    }

    pub fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }

    pub fn is_circular_buffered(&self) -> bool {
        self.circular_buffer_depth.is_some()
    }

    /// Stage count of a circular-buffered tensor.
    pub fn circular_buffer_depth(&self) -> Option<u64> {
        self.circular_buffer_depth
    }

    pub fn should_lift_read_address(&self) -> bool {
        self.lift_read_address
    }
}

impl fmt::Display for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}[", self.name, self.memory_type)?;
        for (i, axis) in self.domain.leaf().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{axis}")?;
        }
        write!(f, "]")
    }
}

/// Hash/Eq wrapper over `Arc<TensorView>` keyed by the stable node id.
#[derive(Clone)]
pub struct TensorKey(pub Arc<TensorView>);

impl fmt::Debug for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorKey({})", self.0.name)
    }
}

impl PartialEq for TensorKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TensorKey {}

impl Hash for TensorKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
