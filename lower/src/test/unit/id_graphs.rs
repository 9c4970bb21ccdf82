//! Tests for the per-mode graph collection.

use std::sync::Arc;

use forge_ir::{
    BinaryOpType, Expr, Fusion, LoadStoreOpType, MemoryType, ParallelType, TensorDomain, TensorOp, TensorView, Val,
};

use crate::error::Error;
use crate::id_graphs::{IdMappingMode, IterDomainGraphs};
use crate::test::helpers::{bcast, global_tv, iter, iter_with};

fn chain_fusion(a: &Arc<TensorView>, b: &Arc<TensorView>) -> Fusion {
    let mut fusion = Fusion::new();
    fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, a, b).unwrap()).unwrap();
    fusion
}

#[test]
fn exact_map_skips_broadcast_to_concrete() {
    let a = TensorView::builder().name("a").domain(TensorDomain::new(vec![iter(8), bcast()])).build();
    let b = global_tv("b", &[8, 16]);
    let graphs = IterDomainGraphs::build(&chain_fusion(&a, &b)).unwrap();

    assert!(graphs.are_mapped(a.axis(0), b.axis(0), IdMappingMode::Exact));
    assert!(!graphs.are_mapped(a.axis(1), b.axis(1), IdMappingMode::Exact));
    // Permissive resolves the broadcast to the concrete axis.
    assert!(graphs.are_mapped(a.axis(1), b.axis(1), IdMappingMode::Permissive));
}

#[test]
fn almost_exact_maps_across_trivial_transforms() {
    // b's axis is split by one: the pass-through output stays almost-exact
    // mapped to the input, but not exact mapped.
    let root = iter(8);
    let split = Expr::split(&root, Val::one(), true);
    let leaf = vec![split.outputs()[0].clone(), split.outputs()[1].clone()];
    let a = global_tv("a", &[8]);
    let b = TensorView::builder()
        .name("b")
        .domain(TensorDomain::transformed(vec![root.clone()], leaf, vec![split.clone()]))
        .build();
    let graphs = IterDomainGraphs::build(&chain_fusion(&a, &b)).unwrap();

    let passthrough = &split.outputs()[0];
    assert!(!graphs.are_mapped(&root, passthrough, IdMappingMode::Exact));
    assert!(graphs.are_mapped(&root, passthrough, IdMappingMode::AlmostExact));
    assert!(graphs.are_mapped(&a.domain().root()[0], passthrough, IdMappingMode::AlmostExact));
}

#[test]
fn mode_refinement_holds_across_all_ids() {
    let a = TensorView::builder().name("a").domain(TensorDomain::new(vec![iter(8), bcast(), iter(4)])).build();
    let b = global_tv("b", &[8, 16, 4]);
    let c = TensorView::builder()
        .name("c")
        .domain(TensorDomain::new(vec![iter(8), iter(16), iter(4)]))
        .memory_type(MemoryType::Local)
        .compute_at(2)
        .build();
    let mut fusion = Fusion::new();
    fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, &a, &b).unwrap()).unwrap();
    fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, &b, &c).unwrap()).unwrap();
    let graphs = IterDomainGraphs::build(&fusion).unwrap();

    let all_ids: Vec<_> = [&a, &b, &c].iter().flat_map(|tv| tv.domain().leaf().iter().cloned()).collect();
    for x in &all_ids {
        for y in &all_ids {
            if graphs.are_mapped(x, y, IdMappingMode::Exact) {
                assert!(graphs.are_mapped(x, y, IdMappingMode::AlmostExact), "exact ⊆ almost-exact violated");
            }
            if graphs.are_mapped(x, y, IdMappingMode::AlmostExact) {
                assert!(graphs.are_mapped(x, y, IdMappingMode::Permissive), "almost-exact ⊆ permissive violated");
            }
            if graphs.are_mapped(x, y, IdMappingMode::Permissive) {
                assert!(graphs.are_mapped(x, y, IdMappingMode::Loop), "permissive ⊆ loop violated");
            }
        }
    }
}

#[test]
fn parallel_type_propagates_over_loop_groups() {
    let a = TensorView::builder()
        .name("a")
        .domain(TensorDomain::new(vec![iter(8), iter(32)]))
        .memory_type(MemoryType::Shared)
        .build();
    let b = TensorView::builder()
        .name("b")
        .domain(TensorDomain::new(vec![iter(8), iter_with(32, ParallelType::TIDx)]))
        .memory_type(MemoryType::Local)
        .compute_at(1)
        .build();
    let graphs = IterDomainGraphs::build(&chain_fusion(&a, &b)).unwrap();

    assert_eq!(a.axis(1).parallel_type(), ParallelType::TIDx);
    assert!(graphs.are_mapped(a.axis(1), b.axis(1), IdMappingMode::Loop));
}

#[test]
fn conflicting_parallel_types_fail() {
    let a = TensorView::builder()
        .name("a")
        .domain(TensorDomain::new(vec![iter(8), iter_with(32, ParallelType::TIDy)]))
        .build();
    let b = TensorView::builder()
        .name("b")
        .domain(TensorDomain::new(vec![iter(8), iter_with(32, ParallelType::TIDx)]))
        .compute_at(2)
        .build();
    let result = IterDomainGraphs::build(&chain_fusion(&a, &b));
    assert!(matches!(result, Err(Error::ParallelTypeConflict { .. })), "got {result:?}");
}

#[test]
fn permute_cycle_is_detected_as_self_mapping() {
    // t4 = t2 + transpose-view of t1 forces t1's two axes into one exact
    // group through congruence.
    let t1 = global_tv("t1", &[4, 6]);
    let t2 = global_tv("t2", &[4, 6]);
    let t3 = TensorView::builder().name("t3").domain(TensorDomain::new(vec![iter(6), iter(4)])).build();
    let t4 = TensorView::builder().name("t4").domain(TensorDomain::new(vec![iter(4), iter(6)])).build();

    let mut fusion = Fusion::new();
    fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, &t1, &t2).unwrap()).unwrap();
    fusion.add_op(&TensorOp::permute(vec![1, 0], &t1, &t3).unwrap()).unwrap();
    fusion.add_op(&TensorOp::binary(BinaryOpType::Add, &t2, &t3, &t4).unwrap()).unwrap();

    let result = IterDomainGraphs::build(&fusion);
    assert!(matches!(result, Err(Error::SelfMapping { .. })), "got {result:?}");

    // With self-mapping tolerated, the detection is still queryable.
    let graphs = IterDomainGraphs::build_with_options(&fusion, true).unwrap();
    assert!(graphs.has_self_mapping());
    let info = graphs.self_mapping_info().unwrap();
    assert_eq!(info.mode, IdMappingMode::Exact);
    assert!(graphs.are_mapped(&info.id_a, &info.id_b, IdMappingMode::Exact));
}

#[test]
fn concrete_mapped_id_prefers_non_broadcast() {
    let a = TensorView::builder().name("a").domain(TensorDomain::new(vec![iter(8), bcast()])).build();
    let b = global_tv("b", &[8, 16]);
    let graphs = IterDomainGraphs::build(&chain_fusion(&a, &b)).unwrap();

    let concrete = graphs.concrete_mapped_id(a.axis(1), IdMappingMode::Permissive).unwrap();
    assert!(!concrete.is_broadcast());
    assert_eq!(concrete.id(), b.axis(1).id());
}

#[test]
fn add_replay_as_extends_each_mode() {
    let root_a = iter(16);
    let split_a = Expr::split(&root_a, Val::constant(4), true);
    let a = TensorView::builder()
        .name("a")
        .domain(TensorDomain::transformed(
            vec![root_a.clone()],
            split_a.outputs().to_vec(),
            vec![split_a.clone()],
        ))
        .build();
    let b = global_tv("b", &[16]);
    let mut fusion = Fusion::new();
    fusion.add_op(&TensorOp::load_store(LoadStoreOpType::Set, &a, &b).unwrap()).unwrap();
    let mut graphs = IterDomainGraphs::build(&fusion).unwrap();

    // Replaying a's split onto b's exact-mapped root makes the fresh
    // outputs exact-equivalent to a's split outputs.
    let replay = graphs.add_replay_as(&[b.domain().root()[0].clone()], &split_a).unwrap();
    assert!(graphs.are_mapped(&replay.outputs()[0], &split_a.outputs()[0], IdMappingMode::Exact));
    assert!(graphs.are_mapped(&replay.outputs()[1], &split_a.outputs()[1], IdMappingMode::Exact));

    // Replaying onto an unrelated axis extends the graph without mapping.
    let lone = iter(16);
    let mut graph_input = IterDomainGraphs::build(&fusion).unwrap();
    graph_input.graph_mut(IdMappingMode::Exact).initialize_id(&lone, &[], &[]);
    let unrelated = graph_input.add_replay_as(&[lone.clone()], &split_a).unwrap();
    assert!(!graph_input.are_mapped(&unrelated.outputs()[0], &split_a.outputs()[0], IdMappingMode::Exact));
}

#[test]
fn update_compute_with_merges_loop_groups() {
    let a = global_tv("a", &[8, 16]);
    let b = TensorView::builder()
        .name("b")
        .domain(TensorDomain::new(vec![iter(8), iter(16)]))
        .memory_type(MemoryType::Local)
        .build();
    let mut fusion = Fusion::new();
    fusion.add_tensor(&a);
    fusion.add_tensor(&b);
    let mut graphs = IterDomainGraphs::build(&fusion).unwrap();

    assert!(!graphs.are_mapped(a.axis(0), b.axis(0), IdMappingMode::Loop));
    graphs.update_compute_with(&a, &b, 1);
    assert!(graphs.are_mapped(a.axis(0), b.axis(0), IdMappingMode::Loop));
    assert!(!graphs.are_mapped(a.axis(1), b.axis(1), IdMappingMode::Loop));
}
