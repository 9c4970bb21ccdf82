//! Tests for iter domains, domain transforms and the fusion registry.

use crate::expr::Expr;
use crate::fusion::Fusion;
use crate::iter_domain::IterDomain;
use crate::ops::{LoadStoreOpType, TensorOp};
use crate::tensor::{TensorDomain, TensorView};
use crate::types::{MemoryType, ParallelType};
use crate::val::Val;

fn tv(name: &str, extents: &[i64]) -> std::sync::Arc<TensorView> {
    let root = extents.iter().map(|&e| IterDomain::iteration(Val::constant(e))).collect();
    TensorView::builder().name(name).domain(TensorDomain::new(root)).build()
}

#[test]
fn split_derives_output_extents() {
    let id = IterDomain::iteration(Val::constant(12));
    let inner_split = Expr::split(&id, Val::constant(4), true);
    assert_eq!(inner_split.outputs()[0].extent().as_const(), Some(3));
    assert_eq!(inner_split.outputs()[1].extent().as_const(), Some(4));

    let outer_split = Expr::split(&id, Val::constant(4), false);
    assert_eq!(outer_split.outputs()[0].extent().as_const(), Some(4));
    assert_eq!(outer_split.outputs()[1].extent().as_const(), Some(3));
}

#[test]
fn merge_of_broadcast_keeps_concrete_side() {
    let concrete = IterDomain::iteration(Val::constant(8));
    let bcast = IterDomain::broadcast();
    let merge = Expr::merge(&concrete, &bcast);
    let out = &merge.outputs()[0];
    assert!(!out.is_broadcast());
    assert_eq!(out.extent().as_const(), Some(8));

    let both = Expr::merge(&IterDomain::broadcast(), &IterDomain::broadcast());
    assert!(both.outputs()[0].is_broadcast());
}

#[test]
fn replay_mirrors_structure_onto_new_inputs() {
    let id = IterDomain::iteration(Val::constant(16));
    let split = Expr::split(&id, Val::constant(2), true);

    let other = IterDomain::iteration(Val::constant(32));
    let replayed = split.replay_with_inputs(&[other.clone()]).unwrap();
    assert_eq!(replayed.outputs()[0].extent().as_const(), Some(16));
    assert_eq!(replayed.outputs()[1].extent().as_const(), Some(2));
    assert!(replayed.replay_with_inputs(&[]).is_err());
}

#[test]
fn parallel_type_is_assignable_post_construction() {
    let id = IterDomain::iteration(Val::constant(32));
    assert_eq!(id.parallel_type(), ParallelType::Serial);
    id.set_parallel_type(ParallelType::TIDx);
    assert!(id.is_parallelized());
    assert_eq!(id.to_string(), format!("i{}{{32}}:threadIdx.x", id.id()));
}

#[test]
fn fusion_tracks_definitions_and_uses() {
    let mut fusion = Fusion::new();
    let a = tv("a", &[8]);
    let b = tv("b", &[8]);
    let c = tv("c", &[8]);
    let load = TensorOp::load_store(LoadStoreOpType::Set, &a, &b).unwrap();
    let consume = TensorOp::load_store(LoadStoreOpType::Set, &b, &c).unwrap();
    fusion.add_op(&load).unwrap();
    fusion.add_op(&consume).unwrap();

    assert!(fusion.definition_of(&a).is_none());
    assert_eq!(fusion.definition_of(&b).unwrap().id(), load.id());
    assert_eq!(fusion.uses_of(&b).len(), 1);
    assert!(fusion.uses_of(&c).is_empty());

    // Redefining b must be rejected.
    let again = TensorOp::load_store(LoadStoreOpType::Set, &c, &b).unwrap();
    assert!(fusion.add_op(&again).is_err());
}

#[test]
fn permute_realigns_root_pairs() {
    let src = tv("src", &[4, 6]);
    let dst = TensorView::builder()
        .name("dst")
        .domain(TensorDomain::new(vec![
            IterDomain::iteration(Val::constant(6)),
            IterDomain::iteration(Val::constant(4)),
        ]))
        .memory_type(MemoryType::Local)
        .build();
    let op = TensorOp::permute(vec![1, 0], &src, &dst).unwrap();
    let pairs = op.root_pairs(&src);
    assert_eq!(pairs[0].0.id(), src.domain().root()[1].id());
    assert_eq!(pairs[0].1.id(), dst.domain().root()[0].id());

    assert!(TensorOp::permute(vec![0, 0], &src, &dst).is_err());
    assert!(TensorOp::permute(vec![0], &src, &dst).is_err());
}
