//! The per-mapping-mode collection of iteration-domain graphs.
//!
//! Four coexisting equivalence modes refine each other, built in order, each
//! initialised from the previous:
//!
//! - `Exact`: producer/consumer axes map one-to-one through each connecting
//!   op; broadcast axes never map to non-broadcast axes and broadcasts are
//!   not forwarded through.
//! - `AlmostExact`: Exact plus identification across split-by-one and
//!   merge-with-one transforms.
//! - `Permissive`: AlmostExact plus broadcast axes mapped to the concrete
//!   axes resolving them, with forwarding through broadcast merges.
//! - `Loop`: Permissive plus producer/consumer leaf axes left of the
//!   producer's compute position; parallel types are validated and
//!   propagated per group.
//!
//! A fifth `Index` graph (Exact with loop swizzles identified) serves the
//! indexing pass. The collection also resolves each loop group to a
//! promoted concrete axis and detects self-mappings, where two distinct
//! axes of one tensor collapse into the same group.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use forge_ir::{Expr, ExprKey, Fusion, IdKey, IterDomain, ParallelType, TensorView};
use snafu::OptionExt;

use crate::disjoint::UniqueVec;
use crate::error::{self, Result};
use crate::id_graph::{IdGraph, IdGraphStmtSort, IdGroup};

/// The fixed, closed set of mapping modes. Used to index a dense graph
/// array, never a hashed map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum IdMappingMode {
    Exact,
    AlmostExact,
    Permissive,
    Loop,
    Index,
}

impl IdMappingMode {
    pub const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            Self::Exact => 0,
            Self::AlmostExact => 1,
            Self::Permissive => 2,
            Self::Loop => 3,
            Self::Index => 4,
        }
    }
}

/// Two distinct axes of one tensor landed in the same group under a mode
/// the rest of lowering relies on to keep them distinct.
#[derive(Debug, Clone)]
pub struct SelfMappingInfo {
    pub tv: Arc<TensorView>,
    pub id_a: Arc<IterDomain>,
    pub id_b: Arc<IterDomain>,
    pub mode: IdMappingMode,
}

#[derive(Debug)]
pub struct IterDomainGraphs {
    graphs: [IdGraph; IdMappingMode::COUNT],
    // Active definition/use edges per iter domain, gathered from every
    // tensor's transform history. Root-ward transforms of other tensors are
    // never consulted through these.
    id_definitions: HashMap<IdKey, UniqueVec<ExprKey>>,
    id_uses: HashMap<IdKey, UniqueVec<ExprKey>>,
    all_ids: UniqueVec<IdKey>,
    view_rfactor_ids: HashSet<IdKey>,
    loop_promotion: HashMap<IdGroup, IdKey>,
    self_mapping: Option<SelfMappingInfo>,
}

impl IterDomainGraphs {
    /// Build every mode from the fusion; errors on parallel-type conflicts
    /// and on self-mapping.
    pub fn build(fusion: &Fusion) -> Result<Self> {
        Self::build_with_options(fusion, false)
    }

    /// Build, optionally tolerating self-mapping (detection still runs and
    /// is queryable through [`Self::self_mapping_info`]).
    pub fn build_with_options(fusion: &Fusion, allow_self_mapping: bool) -> Result<Self> {
        let mut graphs = Self {
            graphs: Default::default(),
            id_definitions: HashMap::new(),
            id_uses: HashMap::new(),
            all_ids: UniqueVec::new(),
            view_rfactor_ids: HashSet::new(),
            loop_promotion: HashMap::new(),
            self_mapping: None,
        };

        graphs.build_iter_domain_definitions_and_uses(fusion);
        let base = graphs.initialize_id_graph();

        graphs.graphs[IdMappingMode::Exact.slot()] = base;
        graphs.build_exact_map(fusion);

        graphs.graphs[IdMappingMode::AlmostExact.slot()] = graphs.graph(IdMappingMode::Exact).clone();
        graphs.build_almost_exact_map();

        graphs.graphs[IdMappingMode::Permissive.slot()] = graphs.graph(IdMappingMode::AlmostExact).clone();
        graphs.build_permissive_map(fusion);

        graphs.graphs[IdMappingMode::Loop.slot()] = graphs.graph(IdMappingMode::Permissive).clone();
        graphs.build_loop_map(fusion);
        graphs.validate_and_propagate_ptype()?;
        graphs.build_loop_promotion_map();

        graphs.build_index_map();

        graphs.detect_self_mapping(fusion);
        if !allow_self_mapping {
            graphs.assert_no_self_mapping()?;
        }

        tracing::debug!(
            ids = graphs.all_ids.len(),
            exact_groups = graphs.graph(IdMappingMode::Exact).disjoint_ids().set_count(),
            loop_groups = graphs.graph(IdMappingMode::Loop).disjoint_ids().set_count(),
            "iteration domain graphs built"
        );
        Ok(graphs)
    }

    pub fn graph(&self, mode: IdMappingMode) -> &IdGraph {
        &self.graphs[mode.slot()]
    }

    pub fn graph_mut(&mut self, mode: IdMappingMode) -> &mut IdGraph {
        &mut self.graphs[mode.slot()]
    }

    pub fn are_mapped(&self, a: &Arc<IterDomain>, b: &Arc<IterDomain>, mode: IdMappingMode) -> bool {
        self.graph(mode).disjoint_ids().strict_are_mapped(&IdKey(a.clone()), &IdKey(b.clone()))
    }

    /// The concrete axis representing `id`'s group under `mode`. Loop mode
    /// resolves through the promotion map; other modes prefer the first
    /// non-broadcast member.
    pub fn concrete_mapped_id(&self, id: &Arc<IterDomain>, mode: IdMappingMode) -> Option<Arc<IterDomain>> {
        let graph = self.graph(mode);
        let group = graph.disjoint_id_set(id)?;
        if mode == IdMappingMode::Loop {
            if let Some(promoted) = self.loop_promotion.get(&group) {
                return Some(promoted.0.clone());
            }
        }
        Some(Self::promote_within(graph, group))
    }

    pub fn has_self_mapping(&self) -> bool {
        self.self_mapping.is_some()
    }

    pub fn self_mapping_info(&self) -> Option<&SelfMappingInfo> {
        self.self_mapping.as_ref()
    }

    pub fn view_rfactor_ids(&self) -> &HashSet<IdKey> {
        &self.view_rfactor_ids
    }

    /// The active defining transform of `id`, if exactly one exists.
    pub fn id_definition(&self, id: &Arc<IterDomain>) -> Option<&Arc<Expr>> {
        let definitions = self.id_definitions.get(&IdKey(id.clone()))?;
        match definitions.as_slice() {
            [only] => Some(&only.0),
            _ => None,
        }
    }

    /// The active consuming transform of `id`, if exactly one exists.
    pub fn id_use(&self, id: &Arc<IterDomain>) -> Option<&Arc<Expr>> {
        let uses = self.id_uses.get(&IdKey(id.clone()))?;
        match uses.as_slice() {
            [only] => Some(&only.0),
            _ => None,
        }
    }

    /// Replay `expr` onto `new_inputs`: mint a fresh transform mirroring its
    /// structure, register the fresh outputs in every mode, and map the new
    /// transform with the old one in each mode where the inputs already
    /// align.
    pub fn add_replay_as(&mut self, new_inputs: &[Arc<IterDomain>], expr: &Arc<Expr>) -> Result<Arc<Expr>> {
        let replay = expr.replay_with_inputs(new_inputs)?;

        for output in replay.outputs() {
            let key = IdKey(output.clone());
            self.id_definitions.insert(key.clone(), [ExprKey(replay.clone())].into_iter().collect());
            self.id_uses.insert(key.clone(), UniqueVec::new());
            self.all_ids.push_back(key);
        }
        for input in new_inputs {
            self.id_uses.entry(IdKey(input.clone())).or_default().push_back(ExprKey(replay.clone()));
        }

        for graph in &mut self.graphs {
            for output in replay.outputs() {
                graph.initialize_id(output, &[replay.clone()], &[]);
            }
            for input in new_inputs {
                graph.add_use(input, &replay);
            }
            graph.map_through_expr(expr, &replay, true);
        }

        self.build_loop_promotion_map();
        Ok(replay)
    }

    /// Merge the loop groups of `tv` and `consumer` up to `position` after a
    /// compute-with resolution, then refresh promotion.
    pub fn update_compute_with(&mut self, tv: &Arc<TensorView>, consumer: &Arc<TensorView>, position: usize) {
        let bound = position.min(tv.rank()).min(consumer.rank());
        for axis in 0..bound {
            let producer_axis = tv.axis(axis).clone();
            let consumer_axis = consumer.axis(axis).clone();
            self.graph_mut(IdMappingMode::Loop).map_ids(&producer_axis, &consumer_axis);
        }
        self.build_loop_promotion_map();
    }

    // ======= Build process, in order called =======

    fn build_iter_domain_definitions_and_uses(&mut self, fusion: &Fusion) {
        for tv in fusion.tensors() {
            for id in tv.domain().root() {
                self.register_id(id);
            }
            for transform in tv.domain().transforms() {
                for input in transform.inputs() {
                    self.register_id(input);
                    self.id_uses.entry(IdKey(input.clone())).or_default().push_back(ExprKey(transform.clone()));
                }
                for output in transform.outputs() {
                    self.register_id(output);
                    self.id_definitions.entry(IdKey(output.clone())).or_default().push_back(ExprKey(transform.clone()));
                }
            }
            for id in tv.domain().leaf() {
                self.register_id(id);
            }
        }
    }

    fn register_id(&mut self, id: &Arc<IterDomain>) {
        let key = IdKey(id.clone());
        if self.all_ids.push_back(key.clone()) {
            self.id_definitions.insert(key.clone(), UniqueVec::new());
            self.id_uses.insert(key.clone(), UniqueVec::new());
            if id.is_rfactor() {
                self.view_rfactor_ids.insert(key);
            }
        }
    }

    fn initialize_id_graph(&self) -> IdGraph {
        let mut graph = IdGraph::new();
        for key in &self.all_ids {
            let definitions: Vec<Arc<Expr>> =
                self.id_definitions[key].iter().map(|expr_key| expr_key.0.clone()).collect();
            let uses: Vec<Arc<Expr>> = self.id_uses[key].iter().map(|expr_key| expr_key.0.clone()).collect();
            graph.initialize_id(&key.0, &definitions, &uses);
        }
        graph
    }

    fn build_exact_map(&mut self, fusion: &Fusion) {
        for op in fusion.ops() {
            for producer in op.inputs() {
                for (producer_id, consumer_id) in op.root_pairs(producer) {
                    if producer_id.is_broadcast() != consumer_id.is_broadcast() {
                        continue;
                    }
                    self.graph_mut(IdMappingMode::Exact).map_ids(&producer_id, &consumer_id);
                }
            }
        }
    }

    fn build_almost_exact_map(&mut self) {
        let graph = self.graph(IdMappingMode::AlmostExact);
        let trivial_pairs: Vec<Vec<Arc<IterDomain>>> = graph
            .disjoint_exprs()
            .elements()
            .flat_map(|key| IdGraph::trivial_expr_mappings(&key.0))
            .collect();
        let graph = self.graph_mut(IdMappingMode::AlmostExact);
        for pair in trivial_pairs {
            for window in pair.windows(2) {
                graph.map_ids(&window[0], &window[1]);
            }
        }
    }

    fn build_permissive_map(&mut self, fusion: &Fusion) {
        // Broadcast roots map to the concrete roots resolving them.
        for op in fusion.ops() {
            for producer in op.inputs() {
                for (producer_id, consumer_id) in op.root_pairs(producer) {
                    self.graph_mut(IdMappingMode::Permissive).map_ids(&producer_id, &consumer_id);
                }
            }
        }
        // Forward through broadcast merges: the concrete input identifies
        // with the merged output.
        let graph = self.graph(IdMappingMode::Permissive);
        let forwarded: Vec<(Arc<IterDomain>, Arc<IterDomain>)> = graph
            .disjoint_exprs()
            .elements()
            .filter_map(|key| {
                let expr = &key.0;
                if !matches!(expr.op(), forge_ir::ExprOp::Merge) {
                    return None;
                }
                let outer = &expr.inputs()[0];
                let inner = &expr.inputs()[1];
                match (outer.is_broadcast(), inner.is_broadcast()) {
                    (true, false) => Some((inner.clone(), expr.outputs()[0].clone())),
                    (false, true) => Some((outer.clone(), expr.outputs()[0].clone())),
                    _ => None,
                }
            })
            .collect();
        let graph = self.graph_mut(IdMappingMode::Permissive);
        for (concrete, merged) in forwarded {
            graph.map_ids(&concrete, &merged);
        }
    }

    fn build_loop_map(&mut self, fusion: &Fusion) {
        for op in fusion.ops() {
            let consumer = op.output();
            for producer in op.inputs() {
                let position = producer.compute_position_of(consumer).min(producer.rank()).min(consumer.rank());
                for axis in 0..position {
                    let producer_axis = producer.axis(axis).clone();
                    let consumer_axis = consumer.axis(axis).clone();
                    self.graph_mut(IdMappingMode::Loop).map_ids(&producer_axis, &consumer_axis);
                }
            }
        }
    }

    /// Each loop group may carry at most one non-serial parallel type; that
    /// type is assigned onto every member.
    fn validate_and_propagate_ptype(&self) -> Result<()> {
        let graph = self.graph(IdMappingMode::Loop);
        for group in graph.id_groups() {
            let mut non_serial: Option<ParallelType> = None;
            for id in graph.group_ids(group) {
                let ptype = id.parallel_type();
                if !ptype.is_parallel() {
                    continue;
                }
                match non_serial {
                    None => non_serial = Some(ptype),
                    Some(existing) if existing == ptype => {}
                    Some(existing) => {
                        return error::ParallelTypeConflictSnafu {
                            group: render_group(graph, group),
                            first: existing.to_string(),
                            second: ptype.to_string(),
                        }
                        .fail();
                    }
                }
            }
            if let Some(ptype) = non_serial {
                for id in graph.group_ids(group) {
                    id.set_parallel_type(ptype);
                }
            }
        }
        Ok(())
    }

    /// Resolve every loop group to a promoted concrete axis, walking groups
    /// in forward topological order for determinism.
    fn build_loop_promotion_map(&mut self) {
        let graph = self.graph(IdMappingMode::Loop);
        let sort = IdGraphStmtSort::new(graph);
        let mut promotion = HashMap::new();
        for &group in sort.ids() {
            promotion.insert(group, IdKey(Self::promote_within(graph, group)));
        }
        // Groups a cyclic or disconnected region kept out of the sort still
        // need an entry.
        for group in graph.id_groups() {
            if !promotion.contains_key(&group) {
                promotion.insert(group, IdKey(Self::promote_within(graph, group)));
            }
        }
        self.loop_promotion = promotion;
    }

    fn promote_within(graph: &IdGraph, group: IdGroup) -> Arc<IterDomain> {
        graph
            .group_ids(group)
            .find(|id| !id.is_broadcast())
            .cloned()
            .unwrap_or_else(|| graph.representative_id(group).clone())
    }

    fn build_index_map(&mut self) {
        let mut index_graph = self.graph(IdMappingMode::Exact).clone();
        index_graph.map_through_loop_swizzles();
        self.graphs[IdMappingMode::Index.slot()] = index_graph;
    }

    /// Record the first pair of distinct same-tensor axes that share a
    /// group under a mode requiring them distinct: Exact over root and leaf
    /// domains, Loop over leaf domains.
    fn detect_self_mapping(&mut self, fusion: &Fusion) {
        for tv in fusion.tensors() {
            let checks: [(&[Arc<IterDomain>], IdMappingMode); 3] = [
                (tv.domain().root(), IdMappingMode::Exact),
                (tv.domain().leaf(), IdMappingMode::Exact),
                (tv.domain().leaf(), IdMappingMode::Loop),
            ];
            for (ids, mode) in checks {
                if let Some((id_a, id_b)) = self.first_mapped_pair(ids, mode) {
                    self.self_mapping = Some(SelfMappingInfo { tv: tv.clone(), id_a, id_b, mode });
                    return;
                }
            }
        }
    }

    fn first_mapped_pair(
        &self,
        ids: &[Arc<IterDomain>],
        mode: IdMappingMode,
    ) -> Option<(Arc<IterDomain>, Arc<IterDomain>)> {
        for (position, id_a) in ids.iter().enumerate() {
            for id_b in &ids[position + 1..] {
                if id_a.id() != id_b.id() && self.are_mapped(id_a, id_b, mode) {
                    return Some((id_a.clone(), id_b.clone()));
                }
            }
        }
        None
    }

    fn assert_no_self_mapping(&self) -> Result<()> {
        match &self.self_mapping {
            None => Ok(()),
            Some(info) => error::SelfMappingSnafu {
                tv: info.tv.to_string(),
                id_a: info.id_a.to_string(),
                id_b: info.id_b.to_string(),
                mode: info.mode.to_string(),
            }
            .fail(),
        }
    }

    /// Stage-depth registration and loop lookup key: the promoted loop-mode
    /// representative, erroring when `id` is unknown to the loop graph.
    pub(crate) fn concrete_loop_id(&self, id: &Arc<IterDomain>) -> Result<Arc<IterDomain>> {
        self.concrete_mapped_id(id, IdMappingMode::Loop)
            .context(error::InternalSnafu { message: format!("iter domain {id} is not part of the loop graph") })
    }
}

fn render_group(graph: &IdGraph, group: IdGroup) -> String {
    let mut rendered = String::from("{");
    for (i, id) in graph.group_ids(group).enumerate() {
        if i > 0 {
            rendered.push_str("; ");
        }
        rendered.push_str(&id.to_string());
    }
    rendered.push('}');
    rendered
}

impl fmt::Display for IterDomainGraphs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for mode in [
            IdMappingMode::Exact,
            IdMappingMode::AlmostExact,
            IdMappingMode::Permissive,
            IdMappingMode::Loop,
            IdMappingMode::Index,
        ] {
            writeln!(f, "{mode}: {}", self.graph(mode))?;
        }
        Ok(())
    }
}
