//! Double/circular-buffer loop transformation.
//!
//! Tensors annotated for double buffering prefetch the next subregion of
//! their producer while the current one is consumed. The pass rewrites each
//! annotated loop into up to four stages:
//!
//! - a prologue filling the first `depth - 1` buffer stages,
//! - an optional circular-init prologue (only under predicate peeling)
//!   initializing the final stage and compensating pointer increments,
//! - the main loop, doing both the prefetch and the compute,
//! - an epilogue draining the trailing iterations when the buffered loads
//!   write shared memory.
//!
//! Asynchronous copies get a `CpAsyncCommit`/`CpAsyncWait(depth - 2)` pair
//! threaded through the stages so at most `depth - 2` batches stay
//! outstanding when a consumer reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use forge_ir::{DType, IterDomain, MemoryType, ParallelType, TensorKey, TensorView, Val};
use smallvec::SmallVec;
use snafu::{ensure, OptionExt};

use crate::context::LowerContext;
use crate::error::{self, Result};
use crate::id_graphs::{IdMappingMode, IterDomainGraphs};
use crate::kir::{AddressCompute, Allocate, DoubleBufferStage, ForLoop, KirExpr, LoadStore, StmtId};

/// The double-buffer axis position of `tv`.
///
/// The buffered subregion is spanned by the axes from the compute-at
/// position inward, so at least one axis must sit left of it to host the
/// prefetch loop. Unroll must not exist outside the buffer axis, and the
/// axis itself must be a serial non-broadcast loop.
pub fn double_buffer_axis_position(tv: &Arc<TensorView>) -> Result<usize> {
    ensure!(
        tv.compute_at_position() > 0,
        error::InvalidAnnotationSnafu { tv: tv.to_string(), reason: "compute-at position must be greater than zero" }
    );

    let first_unroll_pos = tv
        .domain()
        .leaf()
        .iter()
        .position(|axis| axis.parallel_type() == ParallelType::Unroll)
        .unwrap_or(tv.rank());

    let unroll_or_ca_pos = tv.compute_at_position().min(first_unroll_pos);
    ensure!(
        unroll_or_ca_pos > 0,
        error::AxisNotFoundSnafu { tv: tv.to_string(), reason: "not found due to unroll" }
    );

    (0..unroll_or_ca_pos)
        .rev()
        .find(|&position| {
            let axis = tv.axis(position);
            !axis.parallel_type().is_thread_dim() && !axis.is_broadcast()
        })
        .context(error::AxisNotFoundSnafu { tv: tv.to_string(), reason: "no serial non-broadcast axis left of compute-at" })
}

/// The double-buffer axis of `tv`.
pub fn double_buffer_axis(tv: &Arc<TensorView>) -> Result<Arc<IterDomain>> {
    Ok(tv.axis(double_buffer_axis_position(tv)?).clone())
}

fn validate_double_buffered_tensor(tv: &Arc<TensorView>, ctx: &LowerContext) -> Result<()> {
    let double_buffer_pos = double_buffer_axis_position(tv)?;

    let definition = ctx.fusion().definition_of(tv).context(error::InvalidAnnotationSnafu {
        tv: tv.to_string(),
        reason: "fusion inputs cannot be double buffered",
    })?;
    ensure!(
        definition.is_load_store(),
        error::InvalidAnnotationSnafu {
            tv: tv.to_string(),
            reason: format!("only tensors defined by a load/store op are supported, found {definition}"),
        }
    );
    ensure!(
        !tv.has_compute_with(),
        error::InvalidAnnotationSnafu { tv: tv.to_string(), reason: "computeWith is not supported with double buffering" }
    );

    // The producer must be fully computed outside the buffered loop, or it
    // would need to be double buffered itself.
    let producer = &definition.inputs()[0];
    ensure!(
        producer.compute_position_of(tv) <= double_buffer_pos,
        error::InvalidAnnotationSnafu {
            tv: tv.to_string(),
            reason: format!("the compute position of producer {producer} must be moved left of the buffer axis"),
        }
    );

    let producer_memory = producer.memory_type();
    let consumer_memory = tv.memory_type();
    let supported = (producer_memory == MemoryType::Global
        && (consumer_memory == MemoryType::Shared || consumer_memory == MemoryType::Local))
        || consumer_memory == MemoryType::Local;
    ensure!(
        supported,
        error::InvalidAnnotationSnafu {
            tv: tv.to_string(),
            reason: format!("unsupported memory combination {producer_memory} -> {consumer_memory}"),
        }
    );
    Ok(())
}

#[derive(Debug, Default)]
struct TvInfo {
    axis: Option<Arc<IterDomain>>,
    original_alloc_size: Option<Arc<Val>>,
    read_switch_index: Option<Arc<Val>>,
}

/// Registry of per-tensor and per-loop-axis double-buffer metadata,
/// populated once by the fusion inspector and queried by the rewrite and by
/// later passes (indexing, allocation).
#[derive(Debug, Default)]
pub struct DoubleBufferInfo {
    map: HashMap<TensorKey, TvInfo>,
    // Keyed by the promoted loop-mode representative of the buffer axis.
    stage_depth: HashMap<forge_ir::IdKey, u64>,
    concrete_buffered_loop_ids: HashSet<forge_ir::IdKey>,
}

impl DoubleBufferInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find, validate and register every annotated tensor of the fusion.
    pub fn build(&mut self, ctx: &LowerContext) -> Result<()> {
        for tv in ctx.fusion().tensors() {
            if !(tv.is_double_buffered() || tv.is_circular_buffered()) {
                continue;
            }
            validate_double_buffered_tensor(tv, ctx)?;
            let axis = double_buffer_axis(tv)?;
            self.set_double_buffer_axis(tv, &axis, ctx.id_graphs())?;
        }
        Ok(())
    }

    fn tv_info_mut(&mut self, tv: &Arc<TensorView>) -> Result<&mut TvInfo> {
        ensure!(
            tv.is_double_buffered() || tv.is_circular_buffered(),
            error::InvalidAnnotationSnafu { tv: tv.to_string(), reason: "not a double-buffered tensor" }
        );
        Ok(self.map.entry(TensorKey(tv.clone())).or_default())
    }

    fn tv_info(&self, tv: &Arc<TensorView>) -> Option<&TvInfo> {
        self.map.get(&TensorKey(tv.clone()))
    }

    /// Record the buffer axis of `tv` and its stage depth: two for a plain
    /// double buffer, the annotated depth for a circular buffer.
    pub fn set_double_buffer_axis(
        &mut self,
        tv: &Arc<TensorView>,
        axis: &Arc<IterDomain>,
        graphs: &IterDomainGraphs,
    ) -> Result<()> {
        let stage_depth = match tv.circular_buffer_depth() {
            Some(depth) => {
                ensure!(
                    depth >= 2,
                    error::InvalidAnnotationSnafu { tv: tv.to_string(), reason: "circular buffer depth must be at least 2" }
                );
                depth
            }
            None => 2,
        };
        self.tv_info_mut(tv)?.axis = Some(axis.clone());
        self.set_stage_depth(axis, stage_depth, graphs)?;
        tracing::debug!(tv = %tv, axis = %axis, stage_depth, "registered double buffer axis");
        Ok(())
    }

    /// Record the depth of the concrete loop axis `axis` maps into. Two
    /// tensors may share a loop only at equal depth.
    pub fn set_stage_depth(&mut self, axis: &Arc<IterDomain>, stage_depth: u64, graphs: &IterDomainGraphs) -> Result<()> {
        let concrete = graphs.concrete_loop_id(axis)?;
        let key = forge_ir::IdKey(concrete.clone());
        if let Some(&existing) = self.stage_depth.get(&key) {
            ensure!(
                existing == stage_depth,
                error::StageDepthConflictSnafu {
                    concrete_axis: concrete.to_string(),
                    existing,
                    requested: stage_depth,
                    axis: axis.to_string(),
                }
            );
        } else {
            self.stage_depth.insert(key.clone(), stage_depth);
        }
        self.concrete_buffered_loop_ids.insert(key);
        Ok(())
    }

    pub fn double_buffer_axis(&self, tv: &Arc<TensorView>) -> Option<Arc<IterDomain>> {
        self.tv_info(tv)?.axis.clone()
    }

    /// The stage depth recorded for the loop `axis` maps into.
    pub fn stage_depth_for(&self, axis: &Arc<IterDomain>, graphs: &IterDomainGraphs) -> Result<u64> {
        let concrete = graphs.concrete_loop_id(axis)?;
        self.stage_depth.get(&forge_ir::IdKey(concrete.clone())).copied().context(error::InternalSnafu {
            message: format!("stage depth not found for {concrete}"),
        })
    }

    /// Whether `id` maps into a loop some annotated tensor buffers through.
    pub fn is_double_buffered_iter_domain(&self, id: &Arc<IterDomain>, graphs: &IterDomainGraphs) -> bool {
        graphs
            .concrete_loop_id(id)
            .map(|concrete| self.concrete_buffered_loop_ids.contains(&forge_ir::IdKey(concrete)))
            .unwrap_or(false)
    }

    pub fn concrete_buffered_loop_ids(&self) -> impl Iterator<Item = &Arc<IterDomain>> {
        self.concrete_buffered_loop_ids.iter().map(|key| &key.0)
    }

    /// The innermost enclosing loop realising `tv`'s buffer axis, skipping
    /// prologue-stage loops when `ignore_prolog` is set.
    pub fn double_buffer_loop<'a>(
        &self,
        tv: &Arc<TensorView>,
        loops: &[&'a ForLoop],
        ctx: &LowerContext,
        ignore_prolog: bool,
    ) -> Option<&'a ForLoop> {
        let axis = self.double_buffer_axis(tv)?;
        loops
            .iter()
            .find(|fl| {
                ctx.are_mapped(fl.iter_domain(), &axis, IdMappingMode::Exact)
                    && (!ignore_prolog || !fl.stage().is_prolog())
            })
            .copied()
    }

    /// The per-stage allocation element count, recorded by the allocation
    /// pass before the rewrite runs.
    pub fn set_original_alloc_size(&mut self, tv: &Arc<TensorView>, size: Arc<Val>) -> Result<()> {
        self.tv_info_mut(tv)?.original_alloc_size = Some(size);
        Ok(())
    }

    pub fn original_alloc_size(&self, tv: &Arc<TensorView>) -> Option<Arc<Val>> {
        self.tv_info(tv)?.original_alloc_size.clone()
    }

    pub fn set_read_switch_index(&mut self, tv: &Arc<TensorView>, index: Arc<Val>) -> Result<()> {
        self.tv_info_mut(tv)?.read_switch_index = Some(index);
        Ok(())
    }

    pub fn read_switch_index(&self, tv: &Arc<TensorView>) -> Option<Arc<Val>> {
        self.tv_info(tv)?.read_switch_index.clone()
    }
}

/// The epilogue exists to drain shared-memory writes: they would otherwise
/// overrun the predicate guard in the trailing iterations. Targets under
/// natural predication (local memory) need none.
fn requires_epilogue(loads: &[LoadStore]) -> bool {
    loads.iter().any(|load| load.out().memory_type() == MemoryType::Shared)
}

type InsertionInfo = HashMap<StmtId, Vec<LoadStore>>;

/// Walks the lowered nest, groups buffered load statements by their
/// enclosing double-buffer loop and validates the loop shape.
struct LoopNestInspector<'a> {
    ctx: &'a LowerContext,
    info: &'a DoubleBufferInfo,
    insertion: InsertionInfo,
}

impl<'a> LoopNestInspector<'a> {
    fn run(exprs: &[KirExpr], ctx: &'a LowerContext, info: &'a DoubleBufferInfo) -> Result<InsertionInfo> {
        let mut inspector = Self { ctx, info, insertion: HashMap::new() };
        let mut stack = SmallVec::new();
        inspector.walk(exprs, &mut stack, false)?;
        Ok(inspector.insertion)
    }

    fn walk<'e>(&mut self, exprs: &'e [KirExpr], stack: &mut SmallVec<[&'e ForLoop; 8]>, staged: bool) -> Result<()> {
        for expr in exprs {
            match expr {
                KirExpr::For(fl) => {
                    let staged = staged || fl.stage() != DoubleBufferStage::NotApplicable;
                    stack.push(fl);
                    self.walk(fl.body(), stack, staged)?;
                    stack.pop();
                }
                KirExpr::IfThenElse { then_body, else_body, .. } => {
                    self.walk(then_body, stack, staged)?;
                    self.walk(else_body, stack, staged)?;
                }
                KirExpr::LoadStore(load) => self.handle_load(load, stack, staged)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_load(&mut self, load: &LoadStore, stack: &[&ForLoop], staged: bool) -> Result<()> {
        let out_tv = load.out();
        if !(out_tv.is_double_buffered() || out_tv.is_circular_buffered()) {
            return Ok(());
        }
        // Loads inside an already-staged nest belong to a previous rewrite;
        // re-processing them would stack transformations.
        if staged {
            return Ok(());
        }
        let db_loop = self
            .info
            .double_buffer_loop(out_tv, stack, self.ctx, false)
            .context(error::MissingDoubleBufferLoopSnafu { tv: out_tv.to_string() })?;
        Self::validate_loop(db_loop)?;
        self.insertion.entry(db_loop.id()).or_default().push(load.clone());
        Ok(())
    }

    fn validate_loop(fl: &ForLoop) -> Result<()> {
        ensure!(
            fl.start().is_zero(),
            error::UnsupportedLoopShapeSnafu { for_loop: fl.to_string(), reason: "loop start must be zero" }
        );
        ensure!(
            fl.step().is_one(),
            error::UnsupportedLoopShapeSnafu { for_loop: fl.to_string(), reason: "loop step must be one" }
        );
        ensure!(
            !fl.is_vectorized(),
            error::UnsupportedLoopShapeSnafu {
                for_loop: fl.to_string(),
                reason: "a vectorized loop cannot allocate a double-buffered tensor",
            }
        );
        Ok(())
    }
}

/// Produces the specialized clone of the annotated loop for one stage.
struct LoopCloner<'a> {
    ctx: &'a LowerContext,
    info: &'a DoubleBufferInfo,
    source: &'a ForLoop,
    loads: &'a [LoadStore],
    stage: DoubleBufferStage,
    load_tv_ids: HashSet<u64>,
}

fn clone_stage(
    ctx: &LowerContext,
    info: &DoubleBufferInfo,
    source: &ForLoop,
    loads: &[LoadStore],
    stage: DoubleBufferStage,
) -> Result<ForLoop> {
    let load_tv_ids = loads.iter().map(|load| load.out().id()).collect();
    LoopCloner { ctx, info, source, loads, stage, load_tv_ids }.clone_loop()
}

impl LoopCloner<'_> {
    fn clone_loop(&self) -> Result<ForLoop> {
        let stage_depth = self.info.stage_depth_for(self.source.iter_domain(), self.ctx.id_graphs())?;
        let depth = stage_depth as i64;

        let (start, stop) = match self.stage {
            DoubleBufferStage::Prolog => {
                self.ensure_zero_start()?;
                (Val::zero(), Val::constant(depth - 1))
            }
            DoubleBufferStage::Main => {
                let stop = if requires_epilogue(self.loads) {
                    Val::sub(self.source.stop(), &Val::one())
                } else {
                    self.source.stop().clone()
                };
                (self.source.start().clone(), stop)
            }
            DoubleBufferStage::Epilog => {
                ensure!(
                    requires_epilogue(self.loads),
                    error::InternalSnafu { message: "epilogue requested without shared-memory loads".to_string() }
                );
                (Val::sub(self.source.stop(), &Val::constant(depth - 1)), self.source.stop().clone())
            }
            DoubleBufferStage::CircularInitProlog => {
                self.ensure_zero_start()?;
                (Val::constant(depth - 1), Val::constant(depth))
            }
            DoubleBufferStage::NotApplicable => {
                return error::InternalSnafu { message: "cloning a loop without a buffer stage".to_string() }.fail();
            }
        };

        let mut body = self.clone_scope(self.source.body())?;

        if self.stage == DoubleBufferStage::Main {
            self.append_read_switch_updates(&mut body, stage_depth)?;

            // Pointer increments move to the top of the main body when the
            // loop is peeled: the circular-init prologue has already emitted
            // the compensating decrement, so the first iteration's address
            // is correct with the increment leading the load.
            if self.ctx.should_peel_loop(self.source) && body.iter().any(KirExpr::is_gmem_increment) {
                let (increments, others): (Vec<_>, Vec<_>) =
                    body.into_iter().partition(KirExpr::is_gmem_increment);
                body = increments;
                body.extend(others);
            }
        }

        Ok(ForLoop::builder()
            .iter_domain(self.source.iter_domain().clone())
            .index(self.ctx.index_variable(self.source.iter_domain(), self.stage))
            .start(start)
            .stop(stop)
            .step(self.source.step().clone())
            .unroll_required(self.source.is_unroll_required())
            .stage(self.stage)
            .body(body)
            .build())
    }

    fn ensure_zero_start(&self) -> Result<()> {
        ensure!(
            self.source.start().is_zero(),
            error::InternalSnafu { message: format!("double-buffer loop must start at zero: {}", self.source) }
        );
        Ok(())
    }

    fn clone_scope(&self, exprs: &[KirExpr]) -> Result<Vec<KirExpr>> {
        let mut cloned = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                KirExpr::For(fl) => {
                    let body = self.clone_scope(fl.body())?;
                    if !body.is_empty() {
                        cloned.push(KirExpr::For(
                            ForLoop::builder()
                                .iter_domain(fl.iter_domain().clone())
                                .index(fl.index().clone())
                                .start(fl.start().clone())
                                .stop(fl.stop().clone())
                                .step(fl.step().clone())
                                .vectorize(fl.is_vectorized())
                                .unroll_required(fl.is_unroll_required())
                                .stage(fl.stage())
                                .body(body)
                                .build(),
                        ));
                    }
                }
                KirExpr::IfThenElse { .. } => {
                    return error::InternalSnafu {
                        message: "no IfThenElse should exist inside a double-buffer loop yet".to_string(),
                    }
                    .fail();
                }
                KirExpr::AddressCompute(ac) => self.clone_address_compute(ac, &mut cloned),
                leaf => self.clone_leaf(leaf, &mut cloned),
            }
        }
        Ok(cloned)
    }

    fn writes_load_tv(&self, expr: &KirExpr) -> bool {
        expr.output_tv().map(|tv| self.load_tv_ids.contains(&tv.id())).unwrap_or(false)
    }

    fn clone_leaf(&self, expr: &KirExpr, cloned: &mut Vec<KirExpr>) {
        match self.stage {
            DoubleBufferStage::Main => {
                if !self.can_omit_init_in_main(expr) {
                    cloned.push(expr.clone());
                }
            }
            DoubleBufferStage::Prolog | DoubleBufferStage::Epilog => {
                // The prologue keeps only the buffered copies (and their
                // initializations); the epilogue keeps everything else.
                let is_load_write = self.writes_load_tv(expr);
                let keep = if self.stage == DoubleBufferStage::Prolog { is_load_write } else { !is_load_write };
                if !keep {
                    return;
                }
                match expr {
                    KirExpr::LoadStore(load) if load.supports_inline_predicate() => {
                        cloned.push(KirExpr::LoadStore(load.fresh()));
                    }
                    _ => cloned.push(expr.clone()),
                }
            }
            DoubleBufferStage::CircularInitProlog => {
                if matches!(expr, KirExpr::ScalarFill(_)) && self.writes_load_tv(expr) {
                    cloned.push(expr.clone());
                }
            }
            DoubleBufferStage::NotApplicable => {}
        }
    }

    fn clone_address_compute(&self, ac: &AddressCompute, cloned: &mut Vec<KirExpr>) {
        match self.stage {
            DoubleBufferStage::Main => cloned.push(KirExpr::AddressCompute(ac.clone())),
            DoubleBufferStage::Prolog => {
                // The prologue writes into the buffered space too, so it
                // keeps the rotation updates of its own loads alongside the
                // pointer increments.
                let keeps_update =
                    ac.is_double_buffer_update() && self.load_tv_ids.contains(&ac.data_tv().id());
                if keeps_update || ac.is_gmem_increment() {
                    cloned.push(KirExpr::AddressCompute(ac.clone()));
                }
            }
            DoubleBufferStage::Epilog => {
                if ac.is_gmem_increment() {
                    cloned.push(KirExpr::AddressCompute(ac.clone()));
                }
            }
            DoubleBufferStage::CircularInitProlog => {
                if ac.is_gmem_increment() {
                    if let Some(decrement) = ac.as_decrement() {
                        cloned.push(KirExpr::AddressCompute(decrement));
                    }
                }
            }
            DoubleBufferStage::NotApplicable => {}
        }
    }

    /// cp.async buffer initializations are dead in the main loop when the
    /// loop is peeled and every axis inside the buffer axis is either
    /// parallel or of compile-time-constant extent.
    fn can_omit_init_in_main(&self, expr: &KirExpr) -> bool {
        let KirExpr::ScalarFill(fill) = expr else {
            return false;
        };
        let out_tv = fill.out();
        let is_cp_async_init = self
            .ctx
            .fusion()
            .definition_of(out_tv)
            .and_then(|definition| definition.load_store_type())
            .is_some_and(|op_type| op_type.is_cp_async());
        if !is_cp_async_init || !self.ctx.should_peel_loop(self.source) {
            return false;
        }

        if !(out_tv.is_double_buffered() || out_tv.is_circular_buffered()) {
            return false;
        }
        let Some(axis) = self.info.double_buffer_axis(out_tv) else {
            return false;
        };
        if !self.ctx.are_mapped(&axis, self.source.iter_domain(), IdMappingMode::Loop) {
            return false;
        }

        let mut db_loop_found = false;
        for id in out_tv.domain().leaf() {
            if db_loop_found {
                let concrete = self.ctx.concrete_mapped_id(id, IdMappingMode::Loop).unwrap_or_else(|| id.clone());
                if !concrete.is_parallelized() && !concrete.extent().is_const() {
                    return false;
                }
            }
            db_loop_found =
                db_loop_found || self.ctx.are_mapped(id, self.source.iter_domain(), IdMappingMode::Loop);
        }
        db_loop_found
    }

    /// Rotate the uniform read offsets at the end of the main body, one
    /// update per buffered load with a registered switch index.
    fn append_read_switch_updates(&self, body: &mut Vec<KirExpr>, stage_depth: u64) -> Result<()> {
        for load in self.loads {
            let out_tv = load.out();
            let Some(switch_index) = self.info.read_switch_index(out_tv) else {
                continue;
            };
            let element_count = self.info.original_alloc_size(out_tv).context(error::InternalSnafu {
                message: format!("original allocation size not recorded for {out_tv}"),
            })?;
            let switch_size_bytes = Val::mul(&element_count, &Val::constant(out_tv.dtype().bytes() as i64));
            body.push(KirExpr::AddressCompute(AddressCompute::double_buffer_update(
                out_tv,
                switch_index,
                switch_size_bytes,
                stage_depth,
            )));
        }
        Ok(())
    }
}

/// Orchestrates cloning, synchronization insertion and loop replacement.
/// One traversal processes exactly one annotated loop; the pass driver
/// repeats until the insertion table drains, handling inner loops first.
struct Inserter<'a> {
    ctx: &'a LowerContext,
    info: &'a mut DoubleBufferInfo,
    insertion: &'a mut InsertionInfo,
    processed: bool,
}

impl Inserter<'_> {
    fn rewrite(&mut self, exprs: Vec<KirExpr>) -> Result<Vec<KirExpr>> {
        let mut rewritten = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                KirExpr::For(mut fl) => {
                    if !self.processed {
                        let body = fl.take_body();
                        *fl.body_mut() = self.rewrite(body)?;
                    }
                    if !self.processed {
                        if let Some(loads) = self.insertion.remove(&fl.id()) {
                            self.insert(&mut rewritten, fl, &loads)?;
                            self.processed = true;
                            continue;
                        }
                    }
                    rewritten.push(KirExpr::For(fl));
                }
                KirExpr::IfThenElse { id, predicate, then_body, else_body } => {
                    let then_body = self.rewrite(then_body)?;
                    let else_body = self.rewrite(else_body)?;
                    rewritten.push(KirExpr::IfThenElse { id, predicate, then_body, else_body });
                }
                other => rewritten.push(other),
            }
        }
        Ok(rewritten)
    }

    fn insert(&mut self, rewritten: &mut Vec<KirExpr>, db_loop: ForLoop, loads: &[LoadStore]) -> Result<()> {
        // Shared-memory buffered tensors whose reads all go through ldmatrix
        // keep their rotating read offset in a uniform register; allocate it
        // ahead of the loop.
        for load in loads {
            let out_tv = load.out();
            let uses = self.ctx.fusion().uses_of(out_tv);
            if out_tv.memory_type() == MemoryType::Shared
                && (out_tv.is_double_buffered() || out_tv.is_circular_buffered())
                && out_tv.should_lift_read_address()
                && uses.iter().all(|consumer| consumer.is_ld_matrix())
            {
                let switch_val = Val::fresh_scalar("dbSwitch");
                self.info.set_read_switch_index(out_tv, switch_val.clone())?;
                rewritten.push(KirExpr::Allocate(Allocate::local_scalar(switch_val, DType::Int32)));
            }
        }

        let stage_depth = self.info.stage_depth_for(db_loop.iter_domain(), self.ctx.id_graphs())?;
        let writes_smem = loads.iter().any(|load| load.out().memory_type() == MemoryType::Shared);
        let has_cp_async = loads.iter().any(LoadStore::is_cp_async);

        let mut prologue = clone_stage(self.ctx, self.info, &db_loop, loads, DoubleBufferStage::Prolog)?;
        if has_cp_async {
            // Batch the prologue's outstanding copies; the wait below keeps
            // depth - 2 batches in flight when the main loop starts.
            prologue.push(KirExpr::cp_async_commit());
        }
        rewritten.push(KirExpr::For(prologue));

        // A peeled loop needs the final circular stage initialized before
        // entry, along with the pointer decrement compensating the hoisted
        // increments.
        if self.ctx.should_peel_loop(&db_loop) && writes_smem {
            let circular_init =
                clone_stage(self.ctx, self.info, &db_loop, loads, DoubleBufferStage::CircularInitProlog)?;
            rewritten.push(KirExpr::For(circular_init));
        }

        if has_cp_async {
            rewritten.push(KirExpr::cp_async_wait(stage_depth - 2));
        }

        // RAW sync is elided inside buffered loops; the prologue fills are
        // the exception and must be visible before the main loop reads.
        if loads.iter().any(|load| self.ctx.needs_raw_sync(load.out()).has_tid()) {
            rewritten.push(KirExpr::block_sync(false));
        }

        let mut main = clone_stage(self.ctx, self.info, &db_loop, loads, DoubleBufferStage::Main)?;
        if has_cp_async {
            insert_cp_async_commit_wait(&mut main, loads, stage_depth)?;
        }
        tracing::debug!(
            for_loop = %db_loop,
            loads = loads.len(),
            stage_depth,
            has_cp_async,
            epilogue = requires_epilogue(loads),
            "double buffer loop rewritten"
        );
        rewritten.push(KirExpr::For(main));

        if requires_epilogue(loads) {
            let epilogue = clone_stage(self.ctx, self.info, &db_loop, loads, DoubleBufferStage::Epilog)?;
            rewritten.push(KirExpr::For(epilogue));
        }
        Ok(())
    }
}

/// Commit after the last buffered load of the main body, then wait with
/// `depth - 2` batches outstanding before the body's trailing sync (or at
/// the end of the body when the WAR pass inserted none).
fn insert_cp_async_commit_wait(main: &mut ForLoop, loads: &[LoadStore], stage_depth: u64) -> Result<()> {
    ensure!(
        !main.body().is_empty(),
        error::InternalSnafu { message: "double buffer sync insertion: empty main loop".to_string() }
    );
    let load_ids: HashSet<StmtId> = loads.iter().map(LoadStore::id).collect();
    let body = main.body_mut();
    let last_load = body
        .iter()
        .rposition(|expr| expr.contains_any(&load_ids))
        .context(error::InternalSnafu { message: "no buffered load found in the main loop".to_string() })?;
    let commit_pos = last_load + 1;
    body.insert(commit_pos, KirExpr::cp_async_commit());

    match body[commit_pos + 1..].iter().rposition(KirExpr::is_block_sync) {
        Some(relative) => body.insert(commit_pos + 1 + relative, KirExpr::cp_async_wait(stage_depth - 2)),
        None => body.push(KirExpr::cp_async_wait(stage_depth - 2)),
    }
    Ok(())
}

/// The double-buffer pass: inspect the fusion annotations, group loads by
/// their enclosing loops, then rewrite inner-to-outer. Running the pass on
/// its own output is a no-op, as staged loops are never re-inspected.
pub struct DoubleBufferPass;

impl DoubleBufferPass {
    pub fn run(exprs: Vec<KirExpr>, ctx: &LowerContext, info: &mut DoubleBufferInfo) -> Result<Vec<KirExpr>> {
        info.build(ctx)?;
        let mut insertion = LoopNestInspector::run(&exprs, ctx, info)?;
        tracing::debug!(loops = insertion.len(), "double buffer insertion table built");

        let mut exprs = exprs;
        while !insertion.is_empty() {
            let mut inserter = Inserter { ctx, info, insertion: &mut insertion, processed: false };
            exprs = inserter.rewrite(exprs)?;
            let processed = inserter.processed;
            ensure!(
                processed,
                error::InternalSnafu { message: "insertion table references a loop missing from the nest".to_string() }
            );
        }
        Ok(exprs)
    }
}
