//! # Sync Orchestrator
//!
//! Reconciles the local cache with one backend at a time: pull unknown
//! snapshots, recompute the DAG roots over the union, merge if two peers
//! diverged, then materialize the difference between the previously
//! installed tree and the new head into the working directory.
//!
//! The `source` flag is lowered for the whole pass so the watcher does not
//! feed the orchestrator's own file writes back into the mutator, and raised
//! again on every exit path.

use crate::backend::Backend;
use crate::dag;
use crate::engine::Engine;
use crate::error::{CumulusError, Result};
use crate::hasher::ObjectId;
use crate::hierarchy::{self, Hierarchy};
use crate::merge;
use crate::record::{Dir, DirEntry, Snapshot, ROOT_DIR};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Lowers the source flag on construction and raises it on drop, so the
/// gate is re-armed on every exit path, errors included.
struct SourceGate<'e> {
    engine: &'e Engine,
}

impl<'e> SourceGate<'e> {
    fn lower(engine: &'e Engine) -> Self {
        engine.set_source(false);
        SourceGate { engine }
    }
}

impl Drop for SourceGate<'_> {
    fn drop(&mut self) {
        self.engine.set_source(true);
    }
}

/// One full sync pass against `backend`.
pub fn sync(engine: &Engine, backend: &dyn Backend) -> Result<()> {
    debug!("syncing with {}", backend.id());
    let _gate = SourceGate::lower(engine);
    let mut installed = engine.lock_hierarchy();

    // Pull snapshots unknown locally. A snapshot that fails to download is
    // skipped; the pass continues with what it has.
    let local: HashSet<ObjectId> = engine.cache.list_snapshots()?.into_iter().collect();
    for id in backend.list_snapshots()?.keys() {
        if local.contains(id) {
            continue;
        }
        match backend.get_snapshot(id) {
            Ok(snap) => {
                engine.cache.append_snapshot(&snap, Some(*id))?;
            }
            Err(e) => warn!("skipping snapshot {id} from {}: {e}", backend.id()),
        }
    }

    // Recompute the DAG over the union.
    let (roots, snapshots) = engine.cache.snapshot_tree()?;
    let (head_id, head) = match roots.as_slice() {
        // First startup against empty storage: nothing to install.
        [] => return Ok(()),
        [single] => (*single, snapshots[single].clone()),
        [r1, r2] => merge_roots(engine, r1, r2, &snapshots)?,
        many => {
            return Err(CumulusError::Invariant(format!(
                "{} snapshot roots after syncing {}",
                many.len(),
                backend.id()
            )))
        }
    };

    // Materialize the difference against the previously installed tree.
    let new_hier = engine.load_hierarchy(&head.root_entry())?;
    let old = match engine.pointer.root_snapshot()? {
        Some(previous) => match engine.cache.get_snapshot(&previous) {
            Ok(snap) => Some((snap.root, engine.load_hierarchy(&snap.root_entry())?)),
            Err(_) => None,
        },
        None => None,
    };
    apply_update(engine, &new_hier, &head, old.as_ref())?;

    engine.pointer.set_root_snapshot(&head_id)?;
    *installed = new_hier;
    info!("synced with {}: head {head_id}", backend.id());
    Ok(())
}

/// Two peers committed concurrently: three-way merge over the LCA, with the
/// merge snapshot appended everywhere, parented on both prior roots.
fn merge_roots(
    engine: &Engine,
    r1: &ObjectId,
    r2: &ObjectId,
    snapshots: &HashMap<ObjectId, Snapshot>,
) -> Result<(ObjectId, Snapshot)> {
    info!("divergent history: merging {r1} and {r2}");
    let base = match dag::lowest_common_ancestor(r1, r2, snapshots) {
        Some(id) => snapshots[&id].clone(),
        // Histories share nothing: merge against the empty tree.
        None => Snapshot::empty(),
    };

    let branch1 = &snapshots[r1];
    let branch2 = &snapshots[r2];
    let hier1 = engine.load_hierarchy(&branch1.root_entry())?;
    let hier2 = engine.load_hierarchy(&branch2.root_entry())?;
    let base_hier = engine.load_hierarchy(&base.root_entry())?;

    let mut new_dirs = Vec::new();
    let root_entry = merge::merge_dirs(
        &hier1[&branch1.root],
        &hier1,
        &hier2[&branch2.root],
        &hier2,
        &base_hier[&base.root],
        &base_hier,
        &engine.decorator,
        &mut new_dirs,
    )?;

    // Every directory the merge produced is written exactly once, to all
    // backends and the cache.
    for dir in &new_dirs {
        engine.store_object_as(&dir.self_entry().obj_id, &dir.encode()?)?;
    }

    let snapshot = Snapshot::new(root_entry.obj_id, vec![*r1, *r2]);
    let id = engine.append_snapshot_everywhere(&snapshot)?;
    Ok((id, snapshot))
}

/// Applies the diff between the installed tree and the new head to the
/// working directory, pre-order. Per-file failures are logged and skipped;
/// the pass continues.
fn apply_update(
    engine: &Engine,
    new_hier: &Hierarchy,
    head: &Snapshot,
    old: Option<&(ObjectId, Hierarchy)>,
) -> Result<()> {
    let mut stack: Vec<(ObjectId, String)> = vec![(head.root, ROOT_DIR.to_string())];

    while let Some((node_id, path)) = stack.pop() {
        let Some(node) = new_hier.get(&node_id) else {
            warn!("directory {node_id} missing from hierarchy, skipping {path}");
            continue;
        };

        for entry in node.entries().filter(|e| e.is_dir()) {
            stack.push((entry.obj_id, join_native(&path, &entry.fname)));
        }

        match installed_dir(old, &path) {
            Some(dated) => {
                let (created, updated, removed) = node.diff(&dated);
                for entry in created {
                    install_entry(engine, &path, &entry);
                }
                for entry in updated {
                    materialize_file(engine, &path, &entry);
                }
                for entry in removed {
                    remove_local(engine, &path, &entry);
                }
            }
            // A directory the installed tree never had: everything in it is
            // new.
            None => {
                for entry in node.entries() {
                    install_entry(engine, &path, entry);
                }
            }
        }
    }
    Ok(())
}

/// Resolves `path` in the previously installed hierarchy, if it exists
/// there.
fn installed_dir(old: Option<&(ObjectId, Hierarchy)>, path: &str) -> Option<Dir> {
    let (old_root, old_hier) = old?;
    let stack = hierarchy::find(old_hier, old_root, path);
    if path == ROOT_DIR {
        return stack.into_iter().last();
    }
    let components = path.split('/').filter(|c| !c.is_empty()).count();
    if stack.len() == components + 1 {
        stack.into_iter().last()
    } else {
        None
    }
}

fn install_entry(engine: &Engine, dir_path: &str, entry: &DirEntry) {
    let abs = abs_path(engine, dir_path, &entry.fname);
    if entry.is_dir() {
        if let Err(e) = std::fs::create_dir_all(&abs) {
            warn!("mkdir {} failed: {e}", abs.display());
        }
    } else {
        materialize_file(engine, dir_path, entry);
    }
}

fn materialize_file(engine: &Engine, dir_path: &str, entry: &DirEntry) {
    let abs = abs_path(engine, dir_path, &entry.fname);
    if let Err(e) = engine.materialize(&entry.obj_id, &abs) {
        warn!("failed to materialize {}: {e}", abs.display());
    }
}

fn remove_local(engine: &Engine, dir_path: &str, entry: &DirEntry) {
    let abs = abs_path(engine, dir_path, &entry.fname);
    let result = if entry.is_dir() {
        std::fs::remove_dir_all(&abs)
    } else {
        std::fs::remove_file(&abs)
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!("failed to remove {}: {e}", abs.display());
        }
        _ => {}
    }
}

fn join_native(path: &str, name: &str) -> String {
    if path == ROOT_DIR {
        format!("/{name}")
    } else {
        format!("{path}/{name}")
    }
}

fn abs_path(engine: &Engine, dir_path: &str, name: &str) -> PathBuf {
    let native = join_native(dir_path, name);
    engine
        .config
        .src_dir
        .join(native.trim_start_matches('/'))
}

/// Periodic reconciliation: every `interval` seconds, sync each backend in
/// turn. Errors are logged; the timer keeps running.
pub fn spawn_timer(engine: Arc<Engine>, interval: u64) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(interval));
        for backend in &engine.backends {
            if let Err(e) = sync(&engine, backend.as_ref()) {
                warn!("periodic sync with {} failed: {e}", backend.id());
            }
        }
    })
}
