//! Property-based tests over the equivalence structures.

use proptest::prelude::*;

use forge_ir::{Fusion, IdKey, LoadStoreOpType, MemoryType, TensorDomain, TensorOp, TensorView};

use crate::disjoint::DisjointSets;
use crate::id_graph::IdGraph;
use crate::id_graphs::{IdMappingMode, IterDomainGraphs};
use crate::test::helpers::{bcast, iter};

const ELEMENTS: u8 = 12;

fn union_ops() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((0..ELEMENTS, 0..ELEMENTS), 0..40)
}

proptest! {
    /// Property: group count never increases, and mapped entries stay
    /// mapped through any further unions.
    #[test]
    fn union_find_is_monotonic(ops in union_ops()) {
        let mut sets = DisjointSets::new();
        for value in 0..ELEMENTS {
            sets.initialize_set(value);
        }
        let mut mapped_pairs: Vec<(u8, u8)> = Vec::new();
        let mut previous_count = sets.set_count();

        for (a, b) in ops {
            sets.map_entries(&a, &b);
            mapped_pairs.push((a, b));

            let count = sets.set_count();
            prop_assert!(count <= previous_count);
            previous_count = count;
            for &(x, y) in &mapped_pairs {
                prop_assert!(sets.strict_are_mapped(&x, &y), "({x}, {y}) unmapped after later unions");
            }
        }
    }

    /// Property: handles taken before any sequence of unions still resolve
    /// to the group their element lives in.
    #[test]
    fn handles_survive_unions(ops in union_ops()) {
        let mut sets = DisjointSets::new();
        let handles: Vec<_> = (0..ELEMENTS).map(|value| sets.initialize_set(value)).collect();
        for (a, b) in ops {
            sets.map_entries(&a, &b);
        }
        for (value, &handle) in handles.iter().enumerate() {
            let live = sets.find_set(&(value as u8)).unwrap();
            prop_assert_eq!(sets.canonical(handle), sets.canonical(live));
        }
    }

    /// Property: `build_map_between` lists matches for each source in
    /// exactly the order the targets were supplied.
    #[test]
    fn map_between_preserves_target_order(
        ops in union_ops(),
        target_order in Just((0..ELEMENTS as usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut graph = IdGraph::new();
        let ids: Vec<_> = (0..ELEMENTS).map(|_| iter(4)).collect();
        for id in &ids {
            graph.initialize_id(id, &[], &[]);
        }
        for (a, b) in ops {
            graph.map_ids(&ids[a as usize], &ids[b as usize]);
        }

        let to: Vec<_> = target_order.iter().map(|&i| ids[i].clone()).collect();
        let map = graph.build_map_between(&ids, &to);
        for id in &ids {
            let matches = &map[&IdKey(id.clone())];
            // Every match position must be non-decreasing in target order.
            let positions: Vec<usize> = matches
                .iter()
                .map(|key| to.iter().position(|t| t.id() == key.0.id()).unwrap())
                .collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            prop_assert_eq!(&positions, &sorted, "matches out of supplied order");
        }
    }

    /// Property: over randomly broadcast-shaped chains, exact equivalence
    /// implies almost-exact implies permissive.
    #[test]
    fn mode_refinement(broadcast_mask in prop::collection::vec(any::<bool>(), 1..4), extent in 2i64..32) {
        let rank = broadcast_mask.len();
        let producer_axes: Vec<_> =
            broadcast_mask.iter().map(|&is_bcast| if is_bcast { bcast() } else { iter(extent) }).collect();
        let consumer_axes: Vec<_> = (0..rank).map(|_| iter(extent)).collect();

        let producer = TensorView::builder().name("p").domain(TensorDomain::new(producer_axes)).build();
        let consumer = TensorView::builder()
            .name("c")
            .domain(TensorDomain::new(consumer_axes))
            .memory_type(MemoryType::Local)
            .compute_at(1)
            .build();
        let mut fusion = Fusion::new();
        fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, &producer, &consumer).unwrap()).unwrap();
        let graphs = IterDomainGraphs::build(&fusion).unwrap();

        let all_ids: Vec<_> =
            producer.domain().leaf().iter().chain(consumer.domain().leaf()).cloned().collect();
        for a in &all_ids {
            for b in &all_ids {
                if graphs.are_mapped(a, b, IdMappingMode::Exact) {
                    prop_assert!(graphs.are_mapped(a, b, IdMappingMode::AlmostExact));
                }
                if graphs.are_mapped(a, b, IdMappingMode::AlmostExact) {
                    prop_assert!(graphs.are_mapped(a, b, IdMappingMode::Permissive));
                }
            }
        }
    }
}
