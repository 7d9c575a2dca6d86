//! # Garbage Collection
//!
//! Collapses snapshot history per policy and reclaims unreachable blobs.
//!
//! - **KeepOne** retains only the current root snapshot.
//! - **KeepLandmark** walks the history from the head (following the first
//!   parent; for merge snapshots, the LCA of both parents) and promotes a
//!   snapshot to landmark when it carries the marked flag or sits more than
//!   [`LONG_TERM_TIME_DELTA`] seconds before its successor.
//!
//! Surviving snapshots are rewritten into a linear marked chain, then every
//! blob not reachable from a survivor is deleted from the backend and the
//! cache. Each backend is synced first so the pass always starts from a
//! single root.

use crate::backend::Backend;
use crate::dag;
use crate::engine::Engine;
use crate::error::{CumulusError, Result};
use crate::hasher::ObjectId;
use crate::sync;
use log::{debug, info};
use std::collections::HashSet;

/// Seconds of stability that promote a snapshot to landmark.
pub const LONG_TERM_TIME_DELTA: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    KeepOne,
    KeepLandmark,
}

pub struct Collector<'e> {
    engine: &'e Engine,
    policy: Policy,
}

impl<'e> Collector<'e> {
    pub fn new(engine: &'e Engine, policy: Policy) -> Self {
        Collector { engine, policy }
    }

    /// Collects every backend in turn.
    pub fn run(&self) -> Result<()> {
        for backend in &self.engine.backends {
            // Eliminate branches before collecting.
            sync::sync(self.engine, backend.as_ref())?;
            let _guard = self.engine.lock_hierarchy();
            match self.policy {
                Policy::KeepOne => self.keep_one(backend.as_ref())?,
                Policy::KeepLandmark => self.keep_landmark(backend.as_ref())?,
            }
        }
        Ok(())
    }

    fn keep_one(&self, backend: &dyn Backend) -> Result<()> {
        let (roots, snapshots) = dag::tree_snapshot(backend)?;
        let head = single_root(&roots, backend)?;

        for id in snapshots.keys() {
            if *id != head {
                backend.remove_snapshot(id)?;
                self.engine.cache.remove_snapshot(id)?;
            }
        }
        self.prune(backend, vec![head])
    }

    fn keep_landmark(&self, backend: &dyn Backend) -> Result<()> {
        let (roots, snapshots) = dag::tree_snapshot(backend)?;
        let head = single_root(&roots, backend)?;
        let timestamps = backend.list_snapshots()?;

        // Walk the history chain, newest first, collecting landmarks. A
        // snapshot is promoted when it is marked or sits more than the
        // stability window before the last landmark taken.
        let mut landmarks = vec![head];
        let mut last_landmark_ts = timestamps.get(&head).copied();
        let mut current = head;
        loop {
            let snap = &snapshots[&current];
            current = match snap.parents.as_slice() {
                [] => break,
                [parent] => *parent,
                [p1, p2, ..] => match dag::lowest_common_ancestor(p1, p2, &snapshots) {
                    Some(lca) => lca,
                    None => break,
                },
            };
            let Some(next) = snapshots.get(&current) else {
                // Chain leads into history already pruned elsewhere.
                break;
            };
            if next.marked() {
                landmarks.push(current);
                last_landmark_ts = timestamps.get(&current).copied();
            } else if let (Some(landmark_ts), Some(older)) =
                (last_landmark_ts, timestamps.get(&current))
            {
                if (landmark_ts - *older).num_seconds() > LONG_TERM_TIME_DELTA {
                    landmarks.push(current);
                    last_landmark_ts = Some(*older);
                }
            }
        }
        debug!("landmarks: {landmarks:?}");

        for id in snapshots.keys() {
            if !landmarks.contains(id) {
                backend.remove_snapshot(id)?;
                self.engine.cache.remove_snapshot(id)?;
            }
        }
        self.prune(backend, landmarks)
    }

    /// Rewrites the surviving snapshots into a linear marked chain, then
    /// sweeps every blob not reachable from a survivor.
    fn prune(&self, backend: &dyn Backend, mut landmarks: Vec<ObjectId>) -> Result<()> {
        let engine = self.engine;
        let objects = backend.list_objects()?;
        let mut referred: HashSet<ObjectId> = HashSet::new();

        // Oldest first, so each rewritten landmark can point at the one
        // before it.
        landmarks.reverse();
        let mut parent: Option<ObjectId> = None;

        for landmark in &landmarks {
            let snapshot = backend.get_snapshot(landmark)?;

            // Everything reachable from this snapshot's root stays live.
            let hierarchy = engine.load_hierarchy(&snapshot.root_entry())?;
            let mut stack = vec![snapshot.root_entry()];
            while let Some(entry) = stack.pop() {
                if !referred.insert(entry.obj_id) {
                    continue;
                }
                if entry.is_dir() {
                    if let Some(dir) = hierarchy.get(&entry.obj_id) {
                        stack.extend(dir.entries().cloned());
                    }
                }
            }

            if snapshot.marked() {
                // Already part of a collapsed chain.
                parent = Some(*landmark);
            } else {
                let mut rewritten = snapshot.clone();
                rewritten.mark();
                rewritten.parents = parent.into_iter().collect();
                let new_id = backend.append_snapshot(&rewritten, None)?;
                engine.cache.append_snapshot(&rewritten, Some(new_id))?;
                backend.remove_snapshot(landmark)?;
                engine.cache.remove_snapshot(landmark)?;
                parent = Some(new_id);
            }
        }

        if let Some(new_root) = parent.or_else(|| landmarks.last().copied()) {
            engine.pointer.set_root_snapshot(&new_root)?;
        }

        // Sweep.
        let mut swept = 0usize;
        for object in objects {
            if !referred.contains(&object) {
                engine.cache.remove(&object)?;
                backend.remove(&object)?;
                swept += 1;
            }
        }
        info!(
            "gc on {}: kept {} snapshot(s), swept {swept} object(s)",
            backend.id(),
            landmarks.len()
        );
        Ok(())
    }
}

fn single_root(roots: &[ObjectId], backend: &dyn Backend) -> Result<ObjectId> {
    match roots {
        [one] => Ok(*one),
        _ => Err(CumulusError::Invariant(format!(
            "{} roots on {} during gc",
            roots.len(),
            backend.id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{memory_engine, memory_engine_with_handles};
    use crate::mutator::{Mutator, WatchEvent};
    use crate::record::Snapshot;
    use chrono::{Duration, Utc};
    use globset::GlobSet;
    use std::collections::HashMap;

    fn commit_file(engine: &Engine, rel: &str, content: &[u8]) {
        let path = engine.config.src_dir.join(rel);
        std::fs::write(&path, content).unwrap();
        let mut m = Mutator::new(engine, GlobSet::empty());
        m.handle(WatchEvent::Create {
            path: path.clone(),
            is_dir: false,
        });
        m.handle(WatchEvent::CloseWrite { path });
    }

    /// First-parent chain from `head`, for asserting on collapsed history.
    fn chain_of(head: ObjectId, snapshots: &HashMap<ObjectId, Snapshot>) -> Vec<ObjectId> {
        let mut chain = vec![head];
        let mut current = head;
        while let Some(parent) = snapshots.get(&current).and_then(|s| s.parents.first()) {
            chain.push(*parent);
            current = *parent;
        }
        chain
    }

    #[test]
    fn landmark_collapse_keeps_only_head() {
        let (_tmp, engine) = memory_engine(1);

        // Ten quick edits, all inside the stability window.
        for i in 0..10 {
            commit_file(&engine, "churn.txt", format!("version {i}").as_bytes());
        }
        assert_eq!(engine.backends[0].list_snapshots().unwrap().len(), 10);
        let objects_before = engine.backends[0].list_objects().unwrap().len();
        assert!(objects_before >= 10);

        Collector::new(&engine, Policy::KeepLandmark).run().unwrap();

        // One (rewritten, marked, parentless) snapshot survives.
        let listed = engine.backends[0].list_snapshots().unwrap();
        assert_eq!(listed.len(), 1);
        let (head, _) = listed.into_iter().next().unwrap();
        let snap = engine.backends[0].get_snapshot(&head).unwrap();
        assert!(snap.marked());
        assert!(snap.parents.is_empty());
        assert_eq!(engine.current_root().unwrap(), Some(head));

        // Only the live blob and its directory record remain.
        let objects = engine.backends[0].list_objects().unwrap();
        assert_eq!(objects.len(), 2);
        for id in &objects {
            assert!(engine.cache.contains(id));
        }
        // The surviving tree is fully retrievable.
        let hier = engine.load_hierarchy(&snap.root_entry()).unwrap();
        let entry = hier[&snap.root].get("churn.txt").unwrap();
        assert_eq!(
            engine.backends[0].retrieve(&entry.obj_id).unwrap(),
            b"version 9"
        );
    }

    #[test]
    fn keep_one_removes_everything_but_the_root() {
        let (_tmp, engine) = memory_engine(1);
        for i in 0..5 {
            commit_file(&engine, "f.txt", format!("v{i}").as_bytes());
        }

        Collector::new(&engine, Policy::KeepOne).run().unwrap();

        assert_eq!(engine.backends[0].list_snapshots().unwrap().len(), 1);
        assert_eq!(engine.cache.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn aged_history_retains_landmarks() {
        let (_tmp, engine, handles) = memory_engine_with_handles(1);

        commit_file(&engine, "a.txt", b"old enough");
        let old_head = engine.current_root().unwrap().unwrap();
        commit_file(&engine, "a.txt", b"fresh");

        // Age the first snapshot beyond the stability window.
        handles[0].set_snapshot_time(
            &old_head,
            Utc::now() - Duration::seconds(LONG_TERM_TIME_DELTA + 60),
        );

        Collector::new(&engine, Policy::KeepLandmark).run().unwrap();

        // Both the head and the aged snapshot survived, as a linear marked
        // chain.
        let listed = engine.backends[0].list_snapshots().unwrap();
        assert_eq!(listed.len(), 2);
        let (roots, snapshots) = dag::tree_snapshot(engine.backends[0].as_ref()).unwrap();
        assert_eq!(roots.len(), 1);
        let chain = chain_of(roots[0], &snapshots);
        assert_eq!(chain.len(), 2);
        for snap in snapshots.values() {
            assert!(snap.marked());
            // Both versions of the file are still retrievable.
            let hier = engine.load_hierarchy(&snap.root_entry()).unwrap();
            let entry = hier[&snap.root].get("a.txt").unwrap();
            assert!(engine.backends[0].retrieve(&entry.obj_id).is_ok());
        }
    }

    #[test]
    fn gc_preserves_reachability() {
        let (_tmp, engine) = memory_engine(1);
        commit_file(&engine, "keep1.txt", b"one");
        commit_file(&engine, "keep2.txt", b"two");
        commit_file(&engine, "keep3.txt", b"three");

        Collector::new(&engine, Policy::KeepLandmark).run().unwrap();

        // Every entry reachable from the surviving snapshot still resolves
        // on the backend and in the cache.
        let (roots, snapshots) = dag::tree_snapshot(engine.backends[0].as_ref()).unwrap();
        let head = &snapshots[&roots[0]];
        let hier = engine.load_hierarchy(&head.root_entry()).unwrap();
        for dir in hier.values() {
            for entry in dir.entries() {
                assert!(engine.backends[0].retrieve(&entry.obj_id).is_ok());
                assert!(engine.cache.contains(&entry.obj_id));
            }
        }
    }
}
