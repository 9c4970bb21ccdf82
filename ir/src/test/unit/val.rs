//! Tests for scalar value folding and structural equality.

use test_case::test_case;

use crate::val::Val;

#[test_case(3, 5, 8; "plain sum")]
#[test_case(0, 7, 7; "zero left")]
#[test_case(7, 0, 7; "zero right")]
fn add_folds_constants(a: i64, b: i64, expected: i64) {
    let sum = Val::add(&Val::constant(a), &Val::constant(b));
    assert_eq!(sum.as_const(), Some(expected));
}

#[test]
fn additive_identity_returns_operand() {
    let x = Val::scalar("x");
    let sum = Val::add(&x, &Val::zero());
    assert_eq!(sum.id(), x.id());
}

#[test_case(8, 2, 4)]
#[test_case(9, 2, 5)]
#[test_case(1, 1, 1)]
fn ceil_div_folds_constants(a: i64, b: i64, expected: i64) {
    let q = Val::ceil_div(&Val::constant(a), &Val::constant(b));
    assert_eq!(q.as_const(), Some(expected));
}

#[test]
fn same_as_is_structural_not_identity() {
    let a = Val::mul(&Val::scalar("n"), &Val::constant(4));
    let b = Val::mul(&Val::scalar("n"), &Val::constant(4));
    assert_ne!(a.id(), b.id());
    assert!(a.same_as(&b));

    let c = Val::mul(&Val::scalar("m"), &Val::constant(4));
    assert!(!a.same_as(&c));
}

#[test]
fn same_as_distinguishes_operators() {
    let lhs = Val::scalar("n");
    let rhs = Val::constant(2);
    // Non-foldable operands so both stay Binary nodes.
    let a = Val::mul(&lhs, &rhs);
    let b = Val::ceil_div(&lhs, &rhs);
    assert!(!a.same_as(&b));
}

#[test]
fn fresh_scalars_are_distinct() {
    let a = Val::fresh_scalar("i");
    let b = Val::fresh_scalar("i");
    assert!(!a.same_as(&b));
}
