//! Tests for the union-find and the order-preserving set.

use crate::disjoint::{DisjointSets, UniqueVec};

fn populated(n: u32) -> DisjointSets<u32> {
    let mut sets = DisjointSets::new();
    for value in 0..n {
        sets.initialize_set(value);
    }
    sets
}

#[test]
fn initialize_is_idempotent() {
    let mut sets = populated(3);
    assert_eq!(sets.set_count(), 3);
    let first = sets.initialize_set(1);
    let second = sets.initialize_set(1);
    assert_eq!(sets.canonical(first), sets.canonical(second));
    assert_eq!(sets.set_count(), 3);
}

#[test]
fn map_entries_merges_and_counts() {
    let mut sets = populated(4);
    assert!(!sets.strict_are_mapped(&0, &1));
    sets.map_entries(&0, &1);
    assert!(sets.strict_are_mapped(&0, &1));
    assert_eq!(sets.set_count(), 3);

    // Merging already-merged entries changes nothing.
    sets.map_entries(&1, &0);
    assert_eq!(sets.set_count(), 3);

    sets.map_entries(&1, &2);
    assert!(sets.strict_are_mapped(&0, &2));
    assert_eq!(sets.set_count(), 2);
}

#[test]
fn handles_stay_valid_across_merges() {
    let mut sets = populated(4);
    let handle_zero = sets.find_set(&0).unwrap();
    let handle_one = sets.find_set(&1).unwrap();
    assert_ne!(handle_zero, handle_one);

    sets.map_entries(&0, &1);
    // Both pre-merge handles resolve to the same live group.
    assert_eq!(sets.canonical(handle_zero), sets.canonical(handle_one));
    let members: Vec<u32> = sets.members(handle_zero).copied().collect();
    assert_eq!(members.len(), 2);
    assert!(members.contains(&0) && members.contains(&1));
}

#[test]
fn strict_are_mapped_is_false_for_unknown_entries() {
    let sets = populated(2);
    assert!(!sets.strict_are_mapped(&0, &7));
    assert!(sets.find_set(&7).is_none());
}

#[test]
fn sets_iterates_live_groups_deterministically() {
    let mut sets = populated(5);
    sets.map_entries(&1, &3);
    sets.map_entries(&0, &4);
    let groups: Vec<Vec<u32>> = sets.sets().map(|set| sets.members(set).copied().collect()).collect();
    assert_eq!(groups.len(), 3);
    let total: usize = groups.iter().map(Vec::len).sum();
    assert_eq!(total, 5);
}

#[test]
fn unique_vec_preserves_first_insertion_order() {
    let mut unique = UniqueVec::new();
    assert!(unique.push_back("b"));
    assert!(unique.push_back("a"));
    assert!(!unique.push_back("b"));
    assert!(unique.push_back("c"));
    let items: Vec<&str> = unique.iter().copied().collect();
    assert_eq!(items, vec!["b", "a", "c"]);
    assert!(unique.contains(&"a"));
    assert_eq!(unique.len(), 3);
}
