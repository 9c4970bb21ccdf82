//! Test utilities: fusion and loop-nest builders for the lowering tests.

use std::sync::Arc;

use forge_ir::{
    Fusion, IterDomain, IterType, LoadStoreOpType, MemoryType, ParallelType, TensorDomain, TensorOp, TensorView, Val,
};

use crate::context::{LowerContext, PredicatePeelingInfo, SyncBits, SyncMap};
use crate::double_buffer::DoubleBufferInfo;
use crate::kir::{ForLoop, KirExpr, LoadStore, ScalarFill};

/// A serial iteration axis with a constant extent.
pub fn iter(extent: i64) -> Arc<IterDomain> {
    IterDomain::iteration(Val::constant(extent))
}

/// An iteration axis with the given parallel type.
pub fn iter_with(extent: i64, parallel_type: ParallelType) -> Arc<IterDomain> {
    IterDomain::builder().extent(Val::constant(extent)).parallel_type(parallel_type).build()
}

/// A broadcast axis.
pub fn bcast() -> Arc<IterDomain> {
    IterDomain::builder().extent(Val::one()).iter_type(IterType::Broadcast).build()
}

/// A global-memory tensor over fresh serial axes.
pub fn global_tv(name: &str, extents: &[i64]) -> Arc<TensorView> {
    TensorView::builder().name(name).domain(TensorDomain::new(extents.iter().map(|&e| iter(e)).collect())).build()
}

pub fn as_for(expr: &KirExpr) -> &ForLoop {
    match expr {
        KirExpr::For(fl) => fl,
        other => panic!("expected a loop, found {other:?}"),
    }
}

pub fn const_of(val: &Arc<Val>) -> i64 {
    val.as_const().unwrap_or_else(|| panic!("expected a constant, found {val}"))
}

/// Options for [`double_buffer_scenario`].
pub struct ScenarioOptions {
    pub extent: i64,
    pub inner_extent: i64,
    /// `None` marks plain double buffering; `Some(d)` circular of depth `d`.
    pub circular_depth: Option<u64>,
    pub buffer_memory: MemoryType,
    pub load_op: LoadStoreOpType,
    /// Insert a WAR `BlockSync` between the load and the consumer, the way
    /// the sync pass would have.
    pub war_sync_in_body: bool,
    /// Mark the buffered loop for predicate peeling.
    pub peel: bool,
    /// Prepend a scalar-fill initialization of the buffer.
    pub init_fill: bool,
    /// Add a global-memory pointer increment after the load.
    pub gmem_increment: bool,
    /// Consume the buffer through ldmatrix and lift its read address.
    pub lift_read_address: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            extent: 8,
            inner_extent: 16,
            circular_depth: None,
            buffer_memory: MemoryType::Shared,
            load_op: LoadStoreOpType::Set,
            war_sync_in_body: false,
            peel: false,
            init_fill: false,
            gmem_increment: false,
            lift_read_address: false,
        }
    }
}

/// A fusion with one buffered load and its lowered single-loop nest:
///
/// ```text
/// for i in [0, extent) over consumer axis 0:
///     [fill tv_buf]           (optional)
///     tv_buf = load(tv_in)
///     [gmem increment]        (optional)
///     [block sync]            (optional, WAR)
///     tv_out = set(tv_buf)
/// ```
pub struct DoubleBufferScenario {
    pub ctx: LowerContext,
    pub info: DoubleBufferInfo,
    pub nest: Vec<KirExpr>,
    pub tv_in: Arc<TensorView>,
    pub tv_buf: Arc<TensorView>,
    pub tv_out: Arc<TensorView>,
    pub load: LoadStore,
    pub consume: LoadStore,
}

pub fn double_buffer_scenario(options: ScenarioOptions) -> DoubleBufferScenario {
    let tv_in = global_tv("tv_in", &[options.extent, options.inner_extent]);
    let tv_buf = TensorView::builder()
        .name("tv_buf")
        .domain(TensorDomain::new(vec![iter(options.extent), iter(options.inner_extent)]))
        .memory_type(options.buffer_memory)
        .compute_at(1)
        .double_buffered(options.circular_depth.is_none())
        .maybe_circular_buffer_depth(options.circular_depth)
        .lift_read_address(options.lift_read_address)
        .build();
    let tv_out = TensorView::builder()
        .name("tv_out")
        .domain(TensorDomain::new(vec![iter(options.extent), iter(options.inner_extent)]))
        .memory_type(MemoryType::Local)
        .build();

    let mut fusion = Fusion::new();
    let load_op = TensorOp::load_store(options.load_op, &tv_in, &tv_buf).unwrap();
    let consume_type = if options.lift_read_address { LoadStoreOpType::LdMatrix } else { LoadStoreOpType::Set };
    let consume_op = TensorOp::load_store(consume_type, &tv_buf, &tv_out).unwrap();
    fusion.add_op(&load_op).unwrap();
    fusion.add_op(&consume_op).unwrap();

    let mut sync_map = SyncMap::new();
    if options.buffer_memory == MemoryType::Shared {
        sync_map.mark_raw_sync(&tv_buf, SyncBits::tid());
    }
    let mut peel_info = PredicatePeelingInfo::new();
    if options.peel {
        peel_info.mark_peeled(tv_out.axis(0));
    }

    let ctx = LowerContext::new(fusion, sync_map, peel_info).unwrap();

    let load = LoadStore::new(options.load_op, &tv_in, &tv_buf);
    let consume = LoadStore::new(consume_type, &tv_buf, &tv_out);
    let mut body = Vec::new();
    if options.init_fill {
        body.push(KirExpr::ScalarFill(ScalarFill::new(&tv_buf, Val::zero())));
    }
    body.push(KirExpr::LoadStore(load.clone()));
    if options.gmem_increment {
        body.push(KirExpr::AddressCompute(crate::kir::AddressCompute::gmem_increment(&tv_in, Val::constant(128))));
    }
    if options.war_sync_in_body {
        body.push(KirExpr::block_sync(true));
    }
    body.push(KirExpr::LoadStore(consume.clone()));

    let nest = vec![KirExpr::For(ForLoop::builder().iter_domain(tv_out.axis(0).clone()).body(body).build())];

    DoubleBufferScenario { ctx, info: DoubleBufferInfo::new(), nest, tv_in, tv_buf, tv_out, load, consume }
}
