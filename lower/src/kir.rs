//! Kernel IR: the lowered loop tree the late passes rewrite.
//!
//! A tagged-variant tree, not an inheritance hierarchy: passes match
//! pre-order and rebuild post-order. Statements that passes need to track
//! across a rewrite (loops, loads) carry stable [`StmtId`]s; `Clone`
//! preserves ids, the `fresh_*` constructors mint new ones.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use forge_ir::{DType, IterDomain, LoadStoreOpType, MemoryType, TensorView, Val};

thread_local! {
    static STMT_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

fn next_stmt_id() -> StmtId {
    STMT_ID_COUNTER.with(|counter| {
        let id = counter.get();
        counter.set(id + 1);
        StmtId(id)
    })
}

/// Stable identity of a kernel-IR statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(u64);

/// Which double-buffer stage a loop realises. Untransformed loops are
/// `NotApplicable`; the double-buffer pass never re-processes a loop that
/// already carries a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DoubleBufferStage {
    NotApplicable,
    Prolog,
    Main,
    Epilog,
    CircularInitProlog,
}

impl DoubleBufferStage {
    pub fn is_prolog(self) -> bool {
        matches!(self, Self::Prolog | Self::CircularInitProlog)
    }
}

/// A counted loop over one iter domain.
#[derive(Debug, Clone)]
pub struct ForLoop {
    id: StmtId,
    iter_domain: Arc<IterDomain>,
    index: Arc<Val>,
    start: Arc<Val>,
    stop: Arc<Val>,
    step: Arc<Val>,
    vectorize: bool,
    unroll_required: bool,
    stage: DoubleBufferStage,
    body: Vec<KirExpr>,
}

#[bon::bon]
impl ForLoop {
    #[builder]
    pub fn new(
        iter_domain: Arc<IterDomain>,
        index: Option<Arc<Val>>,
        start: Option<Arc<Val>>,
        stop: Option<Arc<Val>>,
        step: Option<Arc<Val>>,
        #[builder(default = false)] vectorize: bool,
        #[builder(default = false)] unroll_required: bool,
        #[builder(default = DoubleBufferStage::NotApplicable)] stage: DoubleBufferStage,
        #[builder(default = Vec::new())] body: Vec<KirExpr>,
    ) -> Self {
        let stop = stop.unwrap_or_else(|| iter_domain.extent().clone());
        Self {
            id: next_stmt_id(),
            iter_domain,
            index: index.unwrap_or_else(|| Val::fresh_scalar("i")),
            start: start.unwrap_or_else(Val::zero),
            stop,
            step: step.unwrap_or_else(Val::one),
            vectorize,
            unroll_required,
            stage,
            body,
        }
    }

    pub fn id(&self) -> StmtId {
        self.id
    }

    pub fn iter_domain(&self) -> &Arc<IterDomain> {
        &self.iter_domain
    }

    pub fn index(&self) -> &Arc<Val> {
        &self.index
    }

    pub fn start(&self) -> &Arc<Val> {
        &self.start
    }

    pub fn stop(&self) -> &Arc<Val> {
        &self.stop
    }

    pub fn step(&self) -> &Arc<Val> {
        &self.step
    }

    pub fn is_vectorized(&self) -> bool {
        self.vectorize
    }

    pub fn is_unroll_required(&self) -> bool {
        self.unroll_required
    }

    pub fn stage(&self) -> DoubleBufferStage {
        self.stage
    }

    pub fn body(&self) -> &[KirExpr] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Vec<KirExpr> {
        &mut self.body
    }

    pub fn take_body(&mut self) -> Vec<KirExpr> {
        std::mem::take(&mut self.body)
    }

    pub fn push(&mut self, expr: KirExpr) {
        self.body.push(expr);
    }
}

impl fmt::Display for ForLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "for {} in [{}, {}) over {}", self.index, self.start, self.stop, self.iter_domain)?;
        if self.stage != DoubleBufferStage::NotApplicable {
            write!(f, " /* {} */", self.stage)?;
        }
        Ok(())
    }
}

/// A memory movement statement; the only statements eligible for double
/// buffering.
#[derive(Debug, Clone)]
pub struct LoadStore {
    id: StmtId,
    op_type: LoadStoreOpType,
    out: Arc<TensorView>,
    input: Arc<TensorView>,
}

impl LoadStore {
    pub fn new(op_type: LoadStoreOpType, input: &Arc<TensorView>, out: &Arc<TensorView>) -> Self {
        Self { id: next_stmt_id(), op_type, out: out.clone(), input: input.clone() }
    }

    /// A copy under a fresh identity; used by the stage cloner to decouple
    /// predication of the staged copy from the original statement.
    pub fn fresh(&self) -> Self {
        Self { id: next_stmt_id(), op_type: self.op_type, out: self.out.clone(), input: self.input.clone() }
    }

    pub fn id(&self) -> StmtId {
        self.id
    }

    pub fn op_type(&self) -> LoadStoreOpType {
        self.op_type
    }

    pub fn out(&self) -> &Arc<TensorView> {
        &self.out
    }

    pub fn input(&self) -> &Arc<TensorView> {
        &self.input
    }

    pub fn is_cp_async(&self) -> bool {
        self.op_type.is_cp_async()
    }

    /// cp.async copies carry their predicate inline with the instruction,
    /// so a staged clone may rebuild them without the surrounding guard.
    pub fn supports_inline_predicate(&self) -> bool {
        self.is_cp_async()
    }
}

impl fmt::Display for LoadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}({})", self.out.name(), self.op_type, self.input.name())
    }
}

/// Fill a tensor with a scalar; buffer initialization for predicated and
/// asynchronous copies.
#[derive(Debug, Clone)]
pub struct ScalarFill {
    id: StmtId,
    out: Arc<TensorView>,
    value: Arc<Val>,
}

impl ScalarFill {
    pub fn new(out: &Arc<TensorView>, value: Arc<Val>) -> Self {
        Self { id: next_stmt_id(), out: out.clone(), value }
    }

    pub fn id(&self) -> StmtId {
        self.id
    }

    pub fn out(&self) -> &Arc<TensorView> {
        &self.out
    }

    pub fn value(&self) -> &Arc<Val> {
        &self.value
    }
}

/// Address bookkeeping attached to a tensor's access stream.
#[derive(Debug, Clone)]
pub enum AddressComputeKind {
    /// In-place increment of the global-memory pointer; `decrement` marks
    /// the compensating step the circular-init prologue emits.
    GmemIncrement { increment: Arc<Val>, decrement: bool },
    /// Rotate the uniform read offset of a buffered shared-memory tensor.
    DoubleBufferUpdate { switch_index: Arc<Val>, switch_size_bytes: Arc<Val>, stage_depth: u64 },
}

#[derive(Debug, Clone)]
pub struct AddressCompute {
    id: StmtId,
    data_tv: Arc<TensorView>,
    kind: AddressComputeKind,
}

impl AddressCompute {
    pub fn gmem_increment(data_tv: &Arc<TensorView>, increment: Arc<Val>) -> Self {
        Self { id: next_stmt_id(), data_tv: data_tv.clone(), kind: AddressComputeKind::GmemIncrement { increment, decrement: false } }
    }

    /// The decrement twin of a recorded increment.
    pub fn as_decrement(&self) -> Option<Self> {
        match &self.kind {
            AddressComputeKind::GmemIncrement { increment, .. } => Some(Self {
                id: next_stmt_id(),
                data_tv: self.data_tv.clone(),
                kind: AddressComputeKind::GmemIncrement { increment: increment.clone(), decrement: true },
            }),
            AddressComputeKind::DoubleBufferUpdate { .. } => None,
        }
    }

    pub fn double_buffer_update(
        data_tv: &Arc<TensorView>,
        switch_index: Arc<Val>,
        switch_size_bytes: Arc<Val>,
        stage_depth: u64,
    ) -> Self {
        Self {
            id: next_stmt_id(),
            data_tv: data_tv.clone(),
            kind: AddressComputeKind::DoubleBufferUpdate { switch_index, switch_size_bytes, stage_depth },
        }
    }

    pub fn id(&self) -> StmtId {
        self.id
    }

    pub fn data_tv(&self) -> &Arc<TensorView> {
        &self.data_tv
    }

    pub fn kind(&self) -> &AddressComputeKind {
        &self.kind
    }

    pub fn is_gmem_increment(&self) -> bool {
        matches!(self.kind, AddressComputeKind::GmemIncrement { decrement: false, .. })
    }

    pub fn is_double_buffer_update(&self) -> bool {
        matches!(self.kind, AddressComputeKind::DoubleBufferUpdate { .. })
    }
}

/// Scalar allocation placed ahead of a loop (double-buffer switch indices
/// live in 32-bit local registers).
#[derive(Debug, Clone)]
pub struct Allocate {
    id: StmtId,
    val: Arc<Val>,
    dtype: DType,
    memory_type: MemoryType,
    size: Arc<Val>,
    zero_init: bool,
}

impl Allocate {
    pub fn local_scalar(val: Arc<Val>, dtype: DType) -> Self {
        Self { id: next_stmt_id(), val, dtype, memory_type: MemoryType::Local, size: Val::one(), zero_init: true }
    }

    pub fn id(&self) -> StmtId {
        self.id
    }

    pub fn val(&self) -> &Arc<Val> {
        &self.val
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn size(&self) -> &Arc<Val> {
        &self.size
    }

    pub fn is_zero_init(&self) -> bool {
        self.zero_init
    }
}

/// One statement of the lowered kernel.
#[derive(Debug, Clone)]
pub enum KirExpr {
    For(ForLoop),
    IfThenElse { id: StmtId, predicate: Arc<Val>, then_body: Vec<KirExpr>, else_body: Vec<KirExpr> },
    Allocate(Allocate),
    BlockSync { id: StmtId, war_hazard: bool },
    CpAsyncCommit { id: StmtId },
    CpAsyncWait { id: StmtId, pending_stages: u64 },
    AddressCompute(AddressCompute),
    LoadStore(LoadStore),
    ScalarFill(ScalarFill),
}

impl KirExpr {
    pub fn block_sync(war_hazard: bool) -> Self {
        Self::BlockSync { id: next_stmt_id(), war_hazard }
    }

    pub fn cp_async_commit() -> Self {
        Self::CpAsyncCommit { id: next_stmt_id() }
    }

    pub fn cp_async_wait(pending_stages: u64) -> Self {
        Self::CpAsyncWait { id: next_stmt_id(), pending_stages }
    }

    pub fn if_then_else(predicate: Arc<Val>, then_body: Vec<KirExpr>, else_body: Vec<KirExpr>) -> Self {
        Self::IfThenElse { id: next_stmt_id(), predicate, then_body, else_body }
    }

    pub fn id(&self) -> StmtId {
        match self {
            Self::For(fl) => fl.id(),
            Self::IfThenElse { id, .. }
            | Self::BlockSync { id, .. }
            | Self::CpAsyncCommit { id }
            | Self::CpAsyncWait { id, .. } => *id,
            Self::Allocate(alloc) => alloc.id(),
            Self::AddressCompute(ac) => ac.id(),
            Self::LoadStore(ls) => ls.id(),
            Self::ScalarFill(fill) => fill.id(),
        }
    }

    /// The tensor this statement writes, when it writes one.
    pub fn output_tv(&self) -> Option<&Arc<TensorView>> {
        match self {
            Self::LoadStore(ls) => Some(ls.out()),
            Self::ScalarFill(fill) => Some(fill.out()),
            _ => None,
        }
    }

    pub fn is_block_sync(&self) -> bool {
        matches!(self, Self::BlockSync { .. })
    }

    /// A global-memory pointer increment, possibly wrapped in a
    /// single-statement loop.
    pub fn is_gmem_increment(&self) -> bool {
        match self {
            Self::AddressCompute(ac) => ac.is_gmem_increment(),
            Self::For(fl) => match fl.body() {
                [only] => only.is_gmem_increment(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether this statement, or anything nested inside it, is one of
    /// `targets`.
    pub fn contains_any(&self, targets: &HashSet<StmtId>) -> bool {
        if targets.contains(&self.id()) {
            return true;
        }
        match self {
            Self::For(fl) => fl.body().iter().any(|expr| expr.contains_any(targets)),
            Self::IfThenElse { then_body, else_body, .. } => {
                then_body.iter().chain(else_body).any(|expr| expr.contains_any(targets))
            }
            _ => false,
        }
    }
}
