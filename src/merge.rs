//! # Three-Way Merge
//!
//! Merges two divergent directory trees against their common-ancestor base,
//! producing a new tree plus the list of newly created directories so the
//! caller can upload each exactly once.
//!
//! Conflicts are never fatal and nothing is silently dropped: a
//! modify/modify conflict keeps both versions side by side, renaming the one
//! with the lexicographically smaller id under the `modify.conf.` prefix; a
//! delete/modify conflict keeps the modification and emits the deleted base
//! version under `delete.conf.`.

use crate::decorator::Decorator;
use crate::error::{CumulusError, Result};
use crate::hierarchy::Hierarchy;
use crate::record::{Dir, DirEntry, DELETE_CONF, MODIFY_CONF};
use std::collections::BTreeSet;

/// Merges `branch1` and `branch2` against `base`, recursively.
///
/// Returns the sealed self-entry of the merged directory; every directory
/// created along the way (the merged root included) is appended to
/// `new_dirs` for bulk upload.
pub fn merge_dirs(
    branch1: &Dir,
    hier1: &Hierarchy,
    branch2: &Dir,
    hier2: &Hierarchy,
    base: &Dir,
    base_hier: &Hierarchy,
    decorator: &Decorator,
    new_dirs: &mut Vec<Dir>,
) -> Result<DirEntry> {
    let mut merged = Dir::new(branch1.self_entry().clone());

    let names: BTreeSet<&str> = branch1.names().chain(branch2.names()).collect();
    for name in names {
        let e1 = branch1.get(name);
        let e2 = branch2.get(name);
        let e0 = base.get(name);

        match (e1, e2) {
            (Some(e1), Some(e2)) => {
                if e1.obj_id == e2.obj_id {
                    merged.add_entry(e1.clone());
                } else if let Some(e0) = e0 {
                    if e0.is_dir() && e1.is_dir() && e2.is_dir() {
                        // Divergent subtrees over a directory base: merge
                        // them against that base subtree.
                        let sub1 = subdir(hier1, e1)?;
                        let sub2 = subdir(hier2, e2)?;
                        let sub_base = subdir(base_hier, e0)?;
                        let mut entry = merge_dirs(
                            sub1, hier1, sub2, hier2, sub_base, base_hier, decorator, new_dirs,
                        )?;
                        entry.fname = name.to_string();
                        merged.add_entry(entry);
                    } else if e0.obj_id == e1.obj_id {
                        // branch2 modified
                        merged.add_entry(e2.clone());
                    } else if e0.obj_id == e2.obj_id {
                        // branch1 modified
                        merged.add_entry(e1.clone());
                    } else {
                        add_conflict(&mut merged, e1, e2);
                    }
                } else {
                    // Both branches created the name independently with
                    // different content. There is no base to merge against,
                    // so this is a conflict even for two directories.
                    add_conflict(&mut merged, e1, e2);
                }
            }
            (Some(e1), None) => match e0 {
                // branch2 deleted an unmodified entry: the deletion wins.
                Some(e0) if e0.obj_id == e1.obj_id => {}
                // branch1 modified what branch2 deleted: keep the
                // modification and a tombstone of the deleted version.
                Some(e0) => {
                    merged.add_entry(e1.clone());
                    merged.add_entry(tombstone(e0));
                }
                None => merged.add_entry(e1.clone()),
            },
            (None, Some(e2)) => match e0 {
                Some(e0) if e0.obj_id == e2.obj_id => {}
                Some(e0) => {
                    merged.add_entry(e2.clone());
                    merged.add_entry(tombstone(e0));
                }
                None => merged.add_entry(e2.clone()),
            },
            (None, None) => unreachable!("name drawn from the union of both branches"),
        }
    }

    let (id, _) = decorator.object_id(&merged.encode()?)?;
    merged.seal(id);
    new_dirs.push(merged.clone());
    Ok(merged.self_entry().clone())
}

fn subdir<'h>(hierarchy: &'h Hierarchy, entry: &DirEntry) -> Result<&'h Dir> {
    hierarchy.get(&entry.obj_id).ok_or_else(|| {
        CumulusError::Invariant(format!(
            "directory {} ({}) missing from hierarchy",
            entry.fname, entry.obj_id
        ))
    })
}

/// Keeps both conflicting versions; the lexicographically smaller id is the
/// one renamed, so the outcome is independent of argument order.
fn add_conflict(merged: &mut Dir, e1: &DirEntry, e2: &DirEntry) {
    let mut a = e1.clone();
    let mut b = e2.clone();
    if a.obj_id < b.obj_id {
        a.fname = format!("{MODIFY_CONF}{}", a.fname);
    } else {
        b.fname = format!("{MODIFY_CONF}{}", b.fname);
    }
    merged.add_entry(a);
    merged.add_entry(b);
}

fn tombstone(e0: &DirEntry) -> DirEntry {
    let mut entry = e0.clone();
    entry.fname = format!("{DELETE_CONF}{}", entry.fname);
    entry
}
