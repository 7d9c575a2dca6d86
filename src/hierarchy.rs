//! # Directory Hierarchy Loader
//!
//! Materializes the transitive closure of directories reachable from a
//! snapshot root as a `{hash → Dir}` map. Each directory payload is looked
//! up in the local cache first, then in the backends (populating the cache
//! on success). Only directory entries are traversed; file entries are
//! leaves.
//!
//! Path resolution over a loaded hierarchy returns the stack of directories
//! from the root down to the target, which is exactly what the mutator needs
//! for an upward Merkle rebuild.

use crate::backend::Backend;
use crate::cache::CacheStore;
use crate::error::Result;
use crate::hasher::ObjectId;
use crate::record::{Dir, DirEntry, ROOT_DIR, SELF_REF};
use log::debug;
use std::collections::{HashMap, VecDeque};

pub type Hierarchy = HashMap<ObjectId, Dir>;

/// Loads the hierarchy rooted at `root` breadth first.
///
/// Duplicate enqueues (the same directory reachable by two paths) are
/// deduplicated on the output map. An empty root short-circuits to a
/// singleton map holding the empty directory.
pub fn load(
    root: &DirEntry,
    cache: &CacheStore,
    backends: &[Box<dyn Backend>],
) -> Result<Hierarchy> {
    let mut hierarchy = Hierarchy::new();
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(entry) = queue.pop_front() {
        if hierarchy.contains_key(&entry.obj_id) {
            continue;
        }
        let data = fetch(&entry.obj_id, cache, backends)?;
        let dir = Dir::from_bytes(entry.clone(), &data)?;
        for child in dir.entries() {
            if child.is_dir() && !hierarchy.contains_key(&child.obj_id) {
                queue.push_back(child.clone());
            }
        }
        hierarchy.insert(entry.obj_id, dir);
    }
    Ok(hierarchy)
}

/// Cache-first payload fetch; a miss falls through to the backends in
/// configuration order and populates the cache.
fn fetch(id: &ObjectId, cache: &CacheStore, backends: &[Box<dyn Backend>]) -> Result<Vec<u8>> {
    match cache.retrieve(id) {
        Ok(data) => Ok(data),
        Err(miss) => {
            for backend in backends {
                match backend.retrieve(id) {
                    Ok(data) => {
                        debug!("cache miss for {id}, filled from {}", backend.id());
                        cache.store(id, &data)?;
                        return Ok(data);
                    }
                    Err(_) => continue,
                }
            }
            Err(miss)
        }
    }
}

/// Resolves a `/`-rooted path to the stack of directories leading to it.
///
/// The returned stack starts at the root directory; each following element
/// carries a self-entry taken from its parent, so names stay correct even
/// for content shared between paths. A path that does not resolve returns
/// just the root (callers detect this by length).
pub fn find(hierarchy: &Hierarchy, root: &ObjectId, path: &str) -> Vec<Dir> {
    let Some(root_dir) = hierarchy.get(root) else {
        return Vec::new();
    };
    let mut stack = vec![root_dir.clone()];

    if path == ROOT_DIR || path.is_empty() || path == SELF_REF {
        return stack;
    }

    for component in path.split('/').filter(|c| !c.is_empty()) {
        let Some(entry) = stack
            .last()
            .and_then(|dir| dir.get(component))
            .filter(|e| e.is_dir())
            .cloned()
        else {
            return vec![root_dir.clone()];
        };
        let Some(next) = hierarchy.get(&entry.obj_id) else {
            return vec![root_dir.clone()];
        };
        let mut next = next.clone();
        next.set_self_entry(entry);
        stack.push(next);
    }
    stack
}

/// Resolves a path to the entries along it: the self-entries of every
/// directory on the way, plus the file entry itself when the path does not
/// end in `/`. A result of length 1 (just the root) means the path does not
/// exist.
pub fn find_entry(hierarchy: &Hierarchy, root: &ObjectId, path: &str) -> Vec<DirEntry> {
    let (dir_path, file_name) = if path == ROOT_DIR || path.ends_with('/') {
        (path, None)
    } else {
        match path.rsplit_once('/') {
            Some((dir, name)) => (if dir.is_empty() { ROOT_DIR } else { dir }, Some(name)),
            None => (ROOT_DIR, Some(path)),
        }
    };

    let stack = find(hierarchy, root, dir_path);
    let mut entries: Vec<DirEntry> = stack.iter().map(|d| d.self_entry().clone()).collect();

    if let Some(name) = file_name {
        match stack.last().and_then(|dir| dir.get(name)) {
            Some(entry) => entries.push(entry.clone()),
            None => return entries.into_iter().take(1).collect(),
        }
        // A dir path that failed to resolve leaves just the root on the
        // stack; appending an entry found there is only right if the file
        // really lives in the root.
        if stack.len() == 1 && dir_path != ROOT_DIR {
            return entries.into_iter().take(1).collect();
        }
    }
    entries
}
