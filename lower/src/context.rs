//! The lowering context handed to every pass entry point.
//!
//! There is no process-global lowering state: passes receive the context by
//! reference, which owns the fusion, the built iteration-domain graphs and
//! the collaborating analyses (RAW sync requirements, predicate peeling).

use std::collections::HashMap;
use std::sync::Arc;

use forge_ir::{Fusion, IdKey, IterDomain, TensorKey, TensorView, Val};
use parking_lot::Mutex;

use crate::error::Result;
use crate::id_graphs::{IdMappingMode, IterDomainGraphs};
use crate::kir::{DoubleBufferStage, ForLoop};

/// Which thread scopes a tensor needs a RAW sync across before reuse.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncBits {
    pub tid: bool,
    pub bid: bool,
}

impl SyncBits {
    pub fn tid() -> Self {
        Self { tid: true, bid: false }
    }

    pub fn has_tid(self) -> bool {
        self.tid
    }

    pub fn has_bid(self) -> bool {
        self.bid
    }
}

/// RAW synchronization requirements computed by the sync analysis. Tensors
/// without an entry need no sync.
#[derive(Debug, Default)]
pub struct SyncMap {
    raw: HashMap<TensorKey, SyncBits>,
}

impl SyncMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_raw_sync(&mut self, tv: &Arc<TensorView>, bits: SyncBits) {
        self.raw.insert(TensorKey(tv.clone()), bits);
    }

    pub fn needs_raw_sync(&self, tv: &Arc<TensorView>) -> SyncBits {
        self.raw.get(&TensorKey(tv.clone())).copied().unwrap_or_default()
    }
}

/// Which loops the predicate-peeling optimisation will peel, recorded by
/// the axes they iterate.
#[derive(Debug, Default)]
pub struct PredicatePeelingInfo {
    peeled: Vec<Arc<IterDomain>>,
}

impl PredicatePeelingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_peeled(&mut self, axis: &Arc<IterDomain>) {
        self.peeled.push(axis.clone());
    }

    pub fn peeled_axes(&self) -> &[Arc<IterDomain>] {
        &self.peeled
    }
}

/// Per-lowering state shared by the late passes.
#[derive(Debug)]
pub struct LowerContext {
    fusion: Fusion,
    id_graphs: IterDomainGraphs,
    sync_map: SyncMap,
    peel_info: PredicatePeelingInfo,
    // Loop index variables are unique per (concrete loop axis, buffer
    // stage); allocated lazily on first request.
    index_vars: Mutex<HashMap<(IdKey, DoubleBufferStage), Arc<Val>>>,
}

impl LowerContext {
    pub fn new(fusion: Fusion, sync_map: SyncMap, peel_info: PredicatePeelingInfo) -> Result<Self> {
        Self::with_options(fusion, sync_map, peel_info, false)
    }

    pub fn with_options(
        fusion: Fusion,
        sync_map: SyncMap,
        peel_info: PredicatePeelingInfo,
        allow_self_mapping: bool,
    ) -> Result<Self> {
        let id_graphs = IterDomainGraphs::build_with_options(&fusion, allow_self_mapping)?;
        Ok(Self { fusion, id_graphs, sync_map, peel_info, index_vars: Mutex::new(HashMap::new()) })
    }

    pub fn fusion(&self) -> &Fusion {
        &self.fusion
    }

    pub fn id_graphs(&self) -> &IterDomainGraphs {
        &self.id_graphs
    }

    pub fn id_graphs_mut(&mut self) -> &mut IterDomainGraphs {
        &mut self.id_graphs
    }

    pub fn sync_map(&self) -> &SyncMap {
        &self.sync_map
    }

    pub fn are_mapped(&self, a: &Arc<IterDomain>, b: &Arc<IterDomain>, mode: IdMappingMode) -> bool {
        self.id_graphs.are_mapped(a, b, mode)
    }

    pub fn concrete_mapped_id(&self, id: &Arc<IterDomain>, mode: IdMappingMode) -> Option<Arc<IterDomain>> {
        self.id_graphs.concrete_mapped_id(id, mode)
    }

    pub fn needs_raw_sync(&self, tv: &Arc<TensorView>) -> SyncBits {
        self.sync_map.needs_raw_sync(tv)
    }

    /// Whether predicate peeling will peel this loop.
    pub fn should_peel_loop(&self, for_loop: &ForLoop) -> bool {
        self.peel_info
            .peeled_axes()
            .iter()
            .any(|axis| self.are_mapped(axis, for_loop.iter_domain(), IdMappingMode::Loop))
    }

    /// The loop index variable for `id` in the given buffer stage. Loops of
    /// the same concrete axis and stage share the variable; distinct stages
    /// get distinct variables so their iteration ranges stay independent.
    pub fn index_variable(&self, id: &Arc<IterDomain>, stage: DoubleBufferStage) -> Arc<Val> {
        let concrete = self.concrete_mapped_id(id, IdMappingMode::Loop).unwrap_or_else(|| id.clone());
        let mut vars = self.index_vars.lock();
        vars.entry((IdKey(concrete), stage))
            .or_insert_with(|| {
                let prefix = match stage {
                    DoubleBufferStage::Prolog => "iProlog",
                    DoubleBufferStage::Main => "iMain",
                    DoubleBufferStage::Epilog => "iEpilog",
                    DoubleBufferStage::CircularInitProlog => "iInit",
                    DoubleBufferStage::NotApplicable => "i",
                };
                Val::fresh_scalar(prefix)
            })
            .clone()
    }
}
