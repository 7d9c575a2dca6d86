//! # Snapshot DAG
//!
//! Snapshots form a directed acyclic graph through their parent pointers.
//! A **root** is a snapshot no other snapshot names as a parent; under
//! convergence every replica has exactly one. Two roots mean two peers
//! committed concurrently and a merge is required; the merge base is the
//! lowest common ancestor of the two roots.

use crate::backend::Backend;
use crate::error::Result;
use crate::hasher::ObjectId;
use crate::record::Snapshot;
use std::collections::{HashMap, HashSet, VecDeque};

/// Downloads the full snapshot set of a backend and computes its roots.
pub fn tree_snapshot(
    backend: &dyn Backend,
) -> Result<(Vec<ObjectId>, HashMap<ObjectId, Snapshot>)> {
    let mut snapshots = HashMap::new();
    for id in backend.list_snapshots()?.keys() {
        snapshots.insert(*id, backend.get_snapshot(id)?);
    }
    let roots = roots(&snapshots);
    Ok((roots, snapshots))
}

/// Ids that no snapshot in the set names as a parent, in sorted order.
pub fn roots(snapshots: &HashMap<ObjectId, Snapshot>) -> Vec<ObjectId> {
    let mut ids: HashSet<ObjectId> = snapshots.keys().copied().collect();
    for snap in snapshots.values() {
        for parent in &snap.parents {
            ids.remove(parent);
        }
    }
    let mut roots: Vec<ObjectId> = ids.into_iter().collect();
    roots.sort();
    roots
}

/// Every transitive ancestor of `id`, including `id` itself. Parent pointers
/// leading outside the set are skipped — garbage collection on another
/// replica can leave them dangling until its next sync.
pub fn ancestors(id: &ObjectId, snapshots: &HashMap<ObjectId, Snapshot>) -> HashSet<ObjectId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*id]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(snap) = snapshots.get(&current) {
            queue.extend(snap.parents.iter().copied());
        }
    }
    seen
}

/// Lowest common ancestor of two roots.
///
/// Collects every ancestor of `r1`, then walks ancestors of `r2` breadth
/// first, returning the first one found in the collection. A root counts as
/// its own ancestor, so if one root descends from the other the ancestor
/// itself is returned. `None` means the histories share nothing and the
/// merge base is the synthetic empty snapshot.
pub fn lowest_common_ancestor(
    r1: &ObjectId,
    r2: &ObjectId,
    snapshots: &HashMap<ObjectId, Snapshot>,
) -> Option<ObjectId> {
    let reachable = ancestors(r1, snapshots);

    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*r2]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        if reachable.contains(&current) {
            return Some(current);
        }
        if let Some(snap) = snapshots.get(&current) {
            queue.extend(snap.parents.iter().copied());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(tag: &str, parents: &[ObjectId]) -> (ObjectId, Snapshot) {
        let snapshot = Snapshot::new(ObjectId::of(tag.as_bytes()), parents.to_vec());
        (ObjectId::of(snapshot.encode().as_slice()), snapshot)
    }

    /// base ← a ← b  and  base ← c : two roots, LCA = base.
    fn forked() -> (ObjectId, ObjectId, ObjectId, HashMap<ObjectId, Snapshot>) {
        let mut map = HashMap::new();
        let (base_id, base) = snap("base", &[]);
        let (a_id, a) = snap("a", &[base_id]);
        let (b_id, b) = snap("b", &[a_id]);
        let (c_id, c) = snap("c", &[base_id]);
        map.insert(base_id, base);
        map.insert(a_id, a);
        map.insert(b_id, b);
        map.insert(c_id, c);
        (base_id, b_id, c_id, map)
    }

    #[test]
    fn single_chain_has_one_root() {
        let mut map = HashMap::new();
        let (first_id, first) = snap("first", &[]);
        let (head_id, head) = snap("head", &[first_id]);
        map.insert(first_id, first);
        map.insert(head_id, head);
        assert_eq!(roots(&map), vec![head_id]);
    }

    #[test]
    fn fork_has_two_roots() {
        let (_base, b, c, map) = forked();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(roots(&map), expected);
    }

    #[test]
    fn lca_of_fork_is_fork_point() {
        let (base, b, c, map) = forked();
        assert_eq!(lowest_common_ancestor(&b, &c, &map), Some(base));
        assert_eq!(lowest_common_ancestor(&c, &b, &map), Some(base));
    }

    #[test]
    fn lca_when_one_is_ancestor_of_other() {
        let mut map = HashMap::new();
        let (old_id, old) = snap("old", &[]);
        let (new_id, new) = snap("new", &[old_id]);
        map.insert(old_id, old);
        map.insert(new_id, new);
        assert_eq!(lowest_common_ancestor(&old_id, &new_id, &map), Some(old_id));
        assert_eq!(lowest_common_ancestor(&new_id, &old_id, &map), Some(old_id));
    }

    #[test]
    fn lca_of_disjoint_histories_is_none() {
        let mut map = HashMap::new();
        let (x_id, x) = snap("x", &[]);
        let (y_id, y) = snap("y", &[]);
        map.insert(x_id, x);
        map.insert(y_id, y);
        assert_eq!(lowest_common_ancestor(&x_id, &y_id, &map), None);
    }

    #[test]
    fn lca_through_merge_snapshot() {
        // base ← l, base ← r, (l,r) ← m ; fork again from m.
        let mut map = HashMap::new();
        let (base_id, base) = snap("base", &[]);
        let (l_id, l) = snap("l", &[base_id]);
        let (r_id, r) = snap("r", &[base_id]);
        let (m_id, m) = snap("m", &[l_id, r_id]);
        let (p_id, p) = snap("p", &[m_id]);
        let (q_id, q) = snap("q", &[m_id]);
        for (id, s) in [
            (base_id, base),
            (l_id, l),
            (r_id, r),
            (m_id, m),
            (p_id, p),
            (q_id, q),
        ] {
            map.insert(id, s);
        }
        assert_eq!(lowest_common_ancestor(&p_id, &q_id, &map), Some(m_id));
    }

    #[test]
    fn lca_is_sound() {
        let (_base, b, c, map) = forked();
        let lca = lowest_common_ancestor(&b, &c, &map).unwrap();
        // The LCA is an ancestor of both roots...
        assert!(ancestors(&b, &map).contains(&lca));
        assert!(ancestors(&c, &map).contains(&lca));
        // ...and no common ancestor strictly descends from it.
        let common: Vec<ObjectId> = ancestors(&b, &map)
            .intersection(&ancestors(&c, &map))
            .copied()
            .collect();
        for candidate in common {
            assert!(
                candidate == lca || !ancestors(&candidate, &map).contains(&lca),
                "a common ancestor strictly below the LCA exists"
            );
        }
    }

    #[test]
    fn dangling_parents_are_skipped() {
        let mut map = HashMap::new();
        let ghost = ObjectId::of(b"pruned-elsewhere");
        let (a_id, a) = snap("a", &[ghost]);
        map.insert(a_id, a);
        // The ghost is not listed, so `a` is still the sole root.
        assert_eq!(roots(&map), vec![a_id]);
        assert!(ancestors(&a_id, &map).contains(&ghost));
    }
}
