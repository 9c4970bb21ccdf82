//! A single equivalence relation over iteration domains, with the derived
//! definition/use edges between equivalence classes.
//!
//! The graph holds two coupled union-finds: one over iter domains, one over
//! the transforms defining and using them. Merging two iter-domain groups
//! merges their definition and use sets and may cascade merges of transform
//! groups whose inputs (or outputs) now align under the new equivalence;
//! that congruence closure runs to a fixed point through a worklist.
//!
//! Both relations are monotonic: groups only merge, never split.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use forge_ir::{Expr, ExprKey, ExprOp, IdKey, IterDomain, SwizzleKind};

use crate::disjoint::{DisjointSets, SetId, UniqueVec};

/// Handle to an equivalence class of iter domains. Stale handles are
/// resolved through the owning graph; identity is on the group, not its
/// contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdGroup(pub(crate) SetId);

/// Handle to an equivalence class of transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprGroup(pub(crate) SetId);

#[derive(Debug, Clone, Default)]
pub struct IdGraph {
    disjoint_ids: DisjointSets<IdKey>,
    disjoint_exprs: DisjointSets<ExprKey>,
    // Keyed by the canonical group at the time of the last write; values may
    // hold stale expr-group handles, which the accessors canonicalise.
    unique_definitions: HashMap<IdGroup, UniqueVec<ExprGroup>>,
    unique_uses: HashMap<IdGroup, UniqueVec<ExprGroup>>,
    id_definitions: HashMap<IdKey, UniqueVec<ExprKey>>,
    id_uses: HashMap<IdKey, UniqueVec<ExprKey>>,
}

impl IdGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disjoint_ids(&self) -> &DisjointSets<IdKey> {
        &self.disjoint_ids
    }

    pub fn disjoint_exprs(&self) -> &DisjointSets<ExprKey> {
        &self.disjoint_exprs
    }

    /// Create the singleton group for `id` and record its definition and
    /// use edges. Transforms shared with already-initialized ids keep their
    /// existing groups.
    pub fn initialize_id(&mut self, id: &Arc<IterDomain>, definitions: &[Arc<Expr>], uses: &[Arc<Expr>]) {
        let key = IdKey(id.clone());
        let set = self.disjoint_ids.initialize_set(key.clone());
        let group = IdGroup(set);

        let mut definition_groups = UniqueVec::new();
        for expr in definitions {
            let expr_set = self.disjoint_exprs.initialize_set(ExprKey(expr.clone()));
            definition_groups.push_back(ExprGroup(expr_set));
        }
        let mut use_groups = UniqueVec::new();
        for expr in uses {
            let expr_set = self.disjoint_exprs.initialize_set(ExprKey(expr.clone()));
            use_groups.push_back(ExprGroup(expr_set));
        }

        self.id_definitions.insert(key.clone(), definitions.iter().map(|e| ExprKey(e.clone())).collect());
        self.id_uses.insert(key, uses.iter().map(|e| ExprKey(e.clone())).collect());
        self.unique_definitions.insert(group, definition_groups);
        self.unique_uses.insert(group, use_groups);
    }

    /// Record `expr` as an additional use of `id` (replayed transforms
    /// append uses after initialization).
    pub fn add_use(&mut self, id: &Arc<IterDomain>, expr: &Arc<Expr>) {
        let key = IdKey(id.clone());
        let expr_set = self.disjoint_exprs.initialize_set(ExprKey(expr.clone()));
        self.id_uses.entry(key.clone()).or_default().push_back(ExprKey(expr.clone()));
        if let Some(group) = self.disjoint_id_set_key(&key) {
            self.unique_uses.entry(group).or_default().push_back(ExprGroup(expr_set));
        }
    }

    pub fn has_id(&self, id: &Arc<IterDomain>) -> bool {
        self.disjoint_ids.contains(&IdKey(id.clone()))
    }

    /// The group `id` belongs to, canonicalised.
    pub fn disjoint_id_set(&self, id: &Arc<IterDomain>) -> Option<IdGroup> {
        self.disjoint_id_set_key(&IdKey(id.clone()))
    }

    fn disjoint_id_set_key(&self, key: &IdKey) -> Option<IdGroup> {
        self.disjoint_ids.find_set(key).map(IdGroup)
    }

    /// The group `expr` belongs to, canonicalised.
    pub fn disjoint_expr_set(&self, expr: &Arc<Expr>) -> Option<ExprGroup> {
        self.disjoint_exprs.find_set(&ExprKey(expr.clone())).map(ExprGroup)
    }

    pub fn canonical_id_group(&self, group: IdGroup) -> IdGroup {
        IdGroup(self.disjoint_ids.canonical(group.0))
    }

    pub fn canonical_expr_group(&self, group: ExprGroup) -> ExprGroup {
        ExprGroup(self.disjoint_exprs.canonical(group.0))
    }

    /// Members of an iter-domain group.
    pub fn group_ids(&self, group: IdGroup) -> impl Iterator<Item = &Arc<IterDomain>> {
        self.disjoint_ids.members(group.0).map(|key| &key.0)
    }

    /// Members of a transform group.
    pub fn group_exprs(&self, group: ExprGroup) -> impl Iterator<Item = &Arc<Expr>> {
        self.disjoint_exprs.members(group.0).map(|key| &key.0)
    }

    /// A deterministic representative transform of the group.
    pub fn representative_expr(&self, group: ExprGroup) -> &Arc<Expr> {
        &self.disjoint_exprs.representative(group.0).0
    }

    /// A deterministic representative iter domain of the group.
    pub fn representative_id(&self, group: IdGroup) -> &Arc<IterDomain> {
        &self.disjoint_ids.representative(group.0).0
    }

    /// Live iter-domain groups in arena order.
    pub fn id_groups(&self) -> impl Iterator<Item = IdGroup> + '_ {
        self.disjoint_ids.sets().map(IdGroup)
    }

    /// Live transform groups in arena order.
    pub fn expr_groups(&self) -> impl Iterator<Item = ExprGroup> + '_ {
        self.disjoint_exprs.sets().map(ExprGroup)
    }

    pub fn to_id_groups<'a>(&self, ids: impl IntoIterator<Item = &'a Arc<IterDomain>>) -> UniqueVec<IdGroup> {
        ids.into_iter().filter_map(|id| self.disjoint_id_set(id)).collect()
    }

    pub fn to_expr_groups<'a>(&self, exprs: impl IntoIterator<Item = &'a Arc<Expr>>) -> UniqueVec<ExprGroup> {
        exprs.into_iter().filter_map(|expr| self.disjoint_expr_set(expr)).collect()
    }

    /// Output iter-domain groups of a transform group, through any
    /// representative.
    pub fn output_groups(&self, group: ExprGroup) -> UniqueVec<IdGroup> {
        let expr = self.representative_expr(group).clone();
        self.to_id_groups(expr.outputs().iter())
    }

    /// Input iter-domain groups of a transform group.
    pub fn input_groups(&self, group: ExprGroup) -> UniqueVec<IdGroup> {
        let expr = self.representative_expr(group).clone();
        self.to_id_groups(expr.inputs().iter())
    }

    /// Definition transform groups of `group`, canonicalised and deduped.
    pub fn unique_definitions_of(&self, group: IdGroup) -> UniqueVec<ExprGroup> {
        self.canonical_edge_list(&self.unique_definitions, group)
    }

    /// Use transform groups of `group`, canonicalised and deduped.
    pub fn unique_uses_of(&self, group: IdGroup) -> UniqueVec<ExprGroup> {
        self.canonical_edge_list(&self.unique_uses, group)
    }

    fn canonical_edge_list(&self, map: &HashMap<IdGroup, UniqueVec<ExprGroup>>, group: IdGroup) -> UniqueVec<ExprGroup> {
        let canonical = self.canonical_id_group(group);
        match map.get(&canonical) {
            Some(groups) => groups.iter().map(|&g| self.canonical_expr_group(g)).collect(),
            None => UniqueVec::new(),
        }
    }

    /// Every transform group reachable forwards from `of` through use edges.
    pub fn all_uses_of(&self, of: &UniqueVec<IdGroup>) -> UniqueVec<ExprGroup> {
        self.reach(of, true)
    }

    /// Every transform group reachable backwards from `of` through
    /// definition edges.
    pub fn all_definitions_of(&self, of: &UniqueVec<IdGroup>) -> UniqueVec<ExprGroup> {
        self.reach(of, false)
    }

    fn reach(&self, of: &UniqueVec<IdGroup>, forward: bool) -> UniqueVec<ExprGroup> {
        let mut result = UniqueVec::new();
        let mut visited: HashSet<IdGroup> = HashSet::new();
        let mut frontier: VecDeque<IdGroup> = of.iter().map(|&g| self.canonical_id_group(g)).collect();
        while let Some(group) = frontier.pop_front() {
            if !visited.insert(group) {
                continue;
            }
            let edges = if forward { self.unique_uses_of(group) } else { self.unique_definitions_of(group) };
            for expr_group in &edges {
                result.push_back(*expr_group);
                let next = if forward { self.output_groups(*expr_group) } else { self.input_groups(*expr_group) };
                for next_group in &next {
                    frontier.push_back(*next_group);
                }
            }
        }
        result
    }

    /// Transform groups on the frontier from `from` towards `to`, in
    /// topological order. A transform fires once all of its input groups are
    /// reached; traversal does not expand past groups in `to`.
    pub fn exprs_between(&self, from: &UniqueVec<IdGroup>, to: &UniqueVec<IdGroup>) -> UniqueVec<ExprGroup> {
        let stop: HashSet<IdGroup> = to.iter().map(|&g| self.canonical_id_group(g)).collect();
        let start: UniqueVec<IdGroup> = from.iter().map(|&g| self.canonical_id_group(g)).collect();
        let mut reached: HashSet<IdGroup> = start.iter().copied().collect();
        let mut result = UniqueVec::new();
        let mut frontier: VecDeque<IdGroup> = start.iter().copied().collect();
        while let Some(group) = frontier.pop_front() {
            if stop.contains(&group) {
                continue;
            }
            for expr_group in &self.unique_uses_of(group) {
                if result.contains(expr_group) {
                    continue;
                }
                let inputs = self.input_groups(*expr_group);
                if !inputs.iter().all(|input| reached.contains(input)) {
                    continue;
                }
                result.push_back(*expr_group);
                for output in &self.output_groups(*expr_group) {
                    if reached.insert(*output) {
                        frontier.push_back(*output);
                    }
                }
            }
        }
        result
    }

    /// For each `f` in `from`, the iter domains of `to` equivalent to it,
    /// preserving the order `to` was supplied in.
    pub fn build_map_between(
        &self,
        from: &[Arc<IterDomain>],
        to: &[Arc<IterDomain>],
    ) -> HashMap<IdKey, UniqueVec<IdKey>> {
        let mut map = HashMap::new();
        for f in from {
            let mut matches = UniqueVec::new();
            for t in to {
                if self.disjoint_ids.strict_are_mapped(&IdKey(f.clone()), &IdKey(t.clone())) {
                    matches.push_back(IdKey(t.clone()));
                }
            }
            map.insert(IdKey(f.clone()), matches);
        }
        map
    }

    /// Structural congruence of two transforms under the current id
    /// equivalence. `forward` compares inputs (so outputs may be mapped);
    /// backward compares outputs.
    pub fn exprs_map(&self, first: &Arc<Expr>, second: &Arc<Expr>, forward: bool) -> bool {
        if !first.op().kind_matches(second.op()) {
            return false;
        }
        let (first_side, second_side) =
            if forward { (first.inputs(), second.inputs()) } else { (first.outputs(), second.outputs()) };
        if first_side.len() != second_side.len() {
            return false;
        }
        for (a, b) in first_side.iter().zip(second_side) {
            if !self.disjoint_ids.strict_are_mapped(&IdKey(a.clone()), &IdKey(b.clone())) {
                return false;
            }
        }
        match (first.op(), second.op()) {
            (
                ExprOp::Split { factor: first_factor, inner_split: first_inner },
                ExprOp::Split { factor: second_factor, inner_split: second_inner },
            ) => first_inner == second_inner && first_factor.same_as(second_factor),
            (ExprOp::Merge, ExprOp::Merge) => {
                // Merges must combine matching original extents in matching
                // order; extents compare structurally, never numerically.
                first
                    .inputs()
                    .iter()
                    .zip(second.inputs())
                    .all(|(a, b)| a.extent().same_as(b.extent()))
            }
            (
                ExprOp::Swizzle { kind: first_kind, mode: first_mode },
                ExprOp::Swizzle { kind: second_kind, mode: second_mode },
            ) => first_kind == second_kind && first_mode == second_mode,
            _ => false,
        }
    }

    /// Map two iter domains as equivalent and run the congruence closure to
    /// a fixed point. Entries missing from the graph are initialized as
    /// singletons with no edges.
    pub fn map_ids(&mut self, a: &Arc<IterDomain>, b: &Arc<IterDomain>) {
        let mut pending = vec![(IdKey(a.clone()), IdKey(b.clone()))];
        while let Some((key_a, key_b)) = pending.pop() {
            self.merge_id_pair(key_a, key_b, &mut pending);
        }
    }

    fn merge_id_pair(&mut self, key_a: IdKey, key_b: IdKey, pending: &mut Vec<(IdKey, IdKey)>) {
        let group_a = IdGroup(self.disjoint_ids.initialize_set(key_a.clone()));
        let group_b = IdGroup(self.disjoint_ids.initialize_set(key_b.clone()));
        if group_a == group_b {
            return;
        }

        let definitions_a = self.unique_definitions_of(group_a);
        let definitions_b = self.unique_definitions_of(group_b);
        let uses_a = self.unique_uses_of(group_a);
        let uses_b = self.unique_uses_of(group_b);

        let merged = IdGroup(self.disjoint_ids.map_entries(&key_a, &key_b));
        self.unique_definitions.remove(&group_a);
        self.unique_definitions.remove(&group_b);
        self.unique_uses.remove(&group_a);
        self.unique_uses.remove(&group_b);

        let mut merged_definitions = definitions_a.clone();
        merged_definitions.extend(definitions_b.iter().copied());
        let mut merged_uses = uses_a.clone();
        merged_uses.extend(uses_b.iter().copied());
        self.unique_definitions.insert(merged, merged_definitions);
        self.unique_uses.insert(merged, merged_uses);

        // Congruence closure: definitions of the merged group that now agree
        // on their outputs map their inputs, uses that agree on their inputs
        // map their outputs.
        for def_a in &definitions_a {
            for def_b in &definitions_b {
                self.propagate_through(*def_a, *def_b, false, pending);
            }
        }
        for use_a in &uses_a {
            for use_b in &uses_b {
                self.propagate_through(*use_a, *use_b, true, pending);
            }
        }
    }

    fn propagate_through(&mut self, first: ExprGroup, second: ExprGroup, forward: bool, pending: &mut Vec<(IdKey, IdKey)>) {
        let first = self.canonical_expr_group(first);
        let second = self.canonical_expr_group(second);
        if first == second {
            return;
        }
        let expr_a = self.representative_expr(first).clone();
        let expr_b = self.representative_expr(second).clone();
        if !self.exprs_map(&expr_a, &expr_b, forward) {
            return;
        }
        self.map_exprs(&expr_a, &expr_b);
        let (side_a, side_b) =
            if forward { (expr_a.outputs(), expr_b.outputs()) } else { (expr_a.inputs(), expr_b.inputs()) };
        for (out_a, out_b) in side_a.iter().zip(side_b) {
            pending.push((IdKey(out_a.clone()), IdKey(out_b.clone())));
        }
    }

    /// Union two transforms. Group-handle values stored in the edge lists
    /// are canonicalised on read, so no rewrite is needed here.
    pub fn map_exprs(&mut self, a: &Arc<Expr>, b: &Arc<Expr>) {
        self.disjoint_exprs.map_entries(&ExprKey(a.clone()), &ExprKey(b.clone()));
    }

    /// Map `first` and `second` through each other if they are congruent,
    /// mapping outputs when `forward`, inputs otherwise. Returns whether the
    /// transforms were mapped.
    pub fn map_through_expr(&mut self, first: &Arc<Expr>, second: &Arc<Expr>, forward: bool) -> bool {
        if !self.exprs_map(first, second, forward) {
            return false;
        }
        self.map_exprs(first, second);
        let (side_a, side_b) = if forward { (first.outputs(), second.outputs()) } else { (first.inputs(), second.inputs()) };
        for (a, b) in side_a.iter().zip(side_b) {
            self.map_ids(a, b);
        }
        true
    }

    /// Loop swizzles only reorder traversal: identify their inputs with the
    /// corresponding outputs.
    pub fn map_through_loop_swizzles(&mut self) {
        let loop_swizzles: Vec<Arc<Expr>> =
            self.disjoint_exprs.elements().filter(|key| key.0.is_loop_swizzle()).map(|key| key.0.clone()).collect();
        for swizzle in loop_swizzles {
            for (input, output) in swizzle.inputs().iter().zip(swizzle.outputs()) {
                self.map_ids(input, output);
            }
        }
    }

    /// Identity-mapped pairs of a trivial transform: split by one, merge
    /// with a size-one axis, no-op swizzle. Empty when the transform is not
    /// trivial.
    pub fn trivial_expr_mappings(expr: &Arc<Expr>) -> Vec<Vec<Arc<IterDomain>>> {
        match expr.op() {
            ExprOp::Split { factor, inner_split } if factor.is_one() => {
                let passthrough = if *inner_split { &expr.outputs()[0] } else { &expr.outputs()[1] };
                vec![vec![expr.inputs()[0].clone(), passthrough.clone()]]
            }
            ExprOp::Merge => {
                let outer = &expr.inputs()[0];
                let inner = &expr.inputs()[1];
                if outer.extent().is_one() {
                    vec![vec![inner.clone(), expr.outputs()[0].clone()]]
                } else if inner.extent().is_one() {
                    vec![vec![outer.clone(), expr.outputs()[0].clone()]]
                } else {
                    Vec::new()
                }
            }
            ExprOp::Swizzle { kind: SwizzleKind::NoSwizzle, .. } => expr
                .inputs()
                .iter()
                .zip(expr.outputs())
                .map(|(input, output)| vec![input.clone(), output.clone()])
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for IdGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IdGraph {{")?;
        for group in self.id_groups() {
            write!(f, "  {{")?;
            for (i, id) in self.group_ids(group).enumerate() {
                if i > 0 {
                    write!(f, "; ")?;
                }
                write!(f, "{id}")?;
            }
            writeln!(f, "}}")?;
        }
        write!(f, "}}")
    }
}

/// Forward-topological traversal of an [`IdGraph`]: iter-domain groups come
/// out after every definition that can fire has fired, transform groups
/// after all of their input groups. Transform groups with an input and an
/// output in the same iter-domain group are ignored.
pub struct IdGraphStmtSort {
    sorted_ids: UniqueVec<IdGroup>,
    sorted_exprs: UniqueVec<ExprGroup>,
}

impl IdGraphStmtSort {
    pub fn new(graph: &IdGraph) -> Self {
        let mut sorted_ids = UniqueVec::new();
        let mut sorted_exprs = UniqueVec::new();

        let all_ids: Vec<IdGroup> = graph.id_groups().collect();
        let all_exprs: Vec<ExprGroup> = graph.expr_groups().collect();
        let is_self_edge = |expr_group: ExprGroup| {
            let inputs = graph.input_groups(expr_group);
            graph.output_groups(expr_group).iter().any(|out| inputs.contains(out))
        };

        loop {
            let mut progressed = false;
            for &id_group in &all_ids {
                if sorted_ids.contains(&id_group) {
                    continue;
                }
                let ready = graph
                    .unique_definitions_of(id_group)
                    .iter()
                    .all(|&def| sorted_exprs.contains(&def) || is_self_edge(def));
                if ready {
                    progressed |= sorted_ids.push_back(id_group);
                }
            }
            for &expr_group in &all_exprs {
                if sorted_exprs.contains(&expr_group) || is_self_edge(expr_group) {
                    continue;
                }
                let ready = graph.input_groups(expr_group).iter().all(|input| sorted_ids.contains(input));
                if ready {
                    progressed |= sorted_exprs.push_back(expr_group);
                }
            }
            if !progressed {
                break;
            }
        }

        Self { sorted_ids, sorted_exprs }
    }

    pub fn ids(&self) -> &UniqueVec<IdGroup> {
        &self.sorted_ids
    }

    pub fn exprs(&self) -> &UniqueVec<ExprGroup> {
        &self.sorted_exprs
    }
}
