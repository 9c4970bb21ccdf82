//! Iteration domains: one loop axis of one tensor.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::next_node_id;
use crate::types::{IterType, ParallelType};
use crate::val::Val;

/// One loop axis. Structurally immutable after construction except for the
/// parallel type, which parallel-type propagation assigns onto every member
/// of a loop equivalence class after the loop graph is built.
#[derive(Debug)]
pub struct IterDomain {
    id: u64,
    extent: Arc<Val>,
    iter_type: IterType,
    rfactor: bool,
    ptype: RwLock<ParallelType>,
}

#[bon::bon]
impl IterDomain {
    #[builder]
    pub fn new(
        extent: Arc<Val>,
        #[builder(default = IterType::Iteration)] iter_type: IterType,
        #[builder(default = ParallelType::Serial)] parallel_type: ParallelType,
        #[builder(default = false)] rfactor: bool,
    ) -> Arc<Self> {
        Arc::new(Self { id: next_node_id(), extent, iter_type, rfactor, ptype: RwLock::new(parallel_type) })
    }

    /// A serial iteration axis with the given extent.
    pub fn iteration(extent: Arc<Val>) -> Arc<Self> {
        Self::builder().extent(extent).build()
    }

    /// A broadcast axis (extent 1).
    pub fn broadcast() -> Arc<Self> {
        Self::builder().extent(Val::one()).iter_type(IterType::Broadcast).build()
    }

    /// A fresh axis with the same attributes but a new extent, used when
    /// replaying a transform onto new inputs.
    pub fn like(&self, extent: Arc<Val>) -> Arc<Self> {
        Self::builder()
            .extent(extent)
            .iter_type(self.iter_type)
            .parallel_type(self.parallel_type())
            .rfactor(self.rfactor)
            .build()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent(&self) -> &Arc<Val> {
        &self.extent
    }

    pub fn iter_type(&self) -> IterType {
        self.iter_type
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    pub fn is_rfactor(&self) -> bool {
        self.rfactor
    }

    pub fn parallel_type(&self) -> ParallelType {
        *self.ptype.read()
    }

    pub fn set_parallel_type(&self, parallel_type: ParallelType) {
        *self.ptype.write() = parallel_type;
    }

    pub fn is_parallelized(&self) -> bool {
        self.parallel_type().is_parallel()
    }
}

impl fmt::Display for IterDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.iter_type {
            IterType::Broadcast => "b",
            IterType::Reduction => "r",
            IterType::Iteration => "i",
        };
        write!(f, "{prefix}{}{{{}}}", self.id, self.extent)?;
        let pt = self.parallel_type();
        if pt.is_parallel() {
            write!(f, ":{pt}")?;
        }
        Ok(())
    }
}

/// Hash/Eq wrapper over `Arc<IterDomain>` keyed by the stable node id, so
/// iter domains can be used in hash maps without hashing through the
/// interior lock.
#[derive(Clone)]
pub struct IdKey(pub Arc<IterDomain>);

impl fmt::Debug for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdKey({})", self.0)
    }
}

impl PartialEq for IdKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for IdKey {}

impl Hash for IdKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}
