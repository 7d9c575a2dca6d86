//! # Event-Driven Mutator
//!
//! Translates filesystem events from the watcher into incremental rewrites
//! of the Merkle chain: copy-on-write the affected directory, then re-hash
//! and re-store every ancestor up to a new root, which becomes a freshly
//! appended snapshot.
//!
//! Events are gated on the engine's `source` flag (events generated by the
//! sync orchestrator applying remote updates must not feed back in) and on
//! the exclude patterns.
//!
//! Moves arrive as a `MovedFrom`/`MovedTo` pair sharing a cookie. The
//! `MovedFrom` performs a delete-style rewrite as an intermediate snapshot
//! and remembers the entry; the matching `MovedTo` rewrites at the
//! destination and removes the intermediate snapshot, so a rename nets a
//! single snapshot and the content blob is not re-uploaded.

use crate::engine::Engine;
use crate::error::{CumulusError, Result};
use crate::hasher::ObjectId;
use crate::hierarchy::{self, Hierarchy};
use crate::record::{Dir, DirEntry, Snapshot, ROOT_DIR};
use globset::GlobSet;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// A filesystem change reported by the watcher. `path` is the absolute path
/// of the affected file or directory.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Create { path: PathBuf, is_dir: bool },
    Delete { path: PathBuf, is_dir: bool },
    CloseWrite { path: PathBuf },
    MovedFrom { path: PathBuf, cookie: u32 },
    MovedTo { path: PathBuf, is_dir: bool, cookie: u32 },
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Create { path, .. }
            | WatchEvent::Delete { path, .. }
            | WatchEvent::CloseWrite { path }
            | WatchEvent::MovedFrom { path, .. }
            | WatchEvent::MovedTo { path, .. } => path,
        }
    }
}

pub struct Mutator<'e> {
    engine: &'e Engine,
    excludes: GlobSet,
    // Pending move source, keyed by the kernel's rename cookie.
    move_cookie: u32,
    move_src: Option<DirEntry>,
    move_from: String,
}

impl<'e> Mutator<'e> {
    pub fn new(engine: &'e Engine, excludes: GlobSet) -> Self {
        Mutator {
            engine,
            excludes,
            move_cookie: 0,
            move_src: None,
            move_from: String::new(),
        }
    }

    /// Processes one event. Transient failures are retried once; an event
    /// that still fails is logged and dropped — the next snapshot subsumes
    /// the lost edit once the backend recovers, because cache state is
    /// preserved.
    pub fn handle(&mut self, event: WatchEvent) {
        if !self.engine.source() {
            debug!("sync in progress, filtering out {:?}", event);
            return;
        }
        if self.engine.is_excluded(event.path(), &self.excludes) {
            debug!("ignored by exclude patterns: {}", event.path().display());
            return;
        }

        if let Err(e) = self.apply(&event) {
            if e.is_transient() {
                warn!("retrying event after transient failure: {e}");
                if let Err(e) = self.apply(&event) {
                    warn!("event dropped after retry: {e}");
                }
            } else {
                warn!("event dropped: {e}");
            }
        }
    }

    fn apply(&mut self, event: &WatchEvent) -> Result<()> {
        let name = match event.path().file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Ok(()),
        };
        // Held for the whole rebuild.
        let mut installed = self.engine.lock_hierarchy();

        match event {
            WatchEvent::Create { path, is_dir: true } => {
                let (mut hier, stack) = self.path_stack(path)?;
                let entry = DirEntry::dir(name, ObjectId::empty());
                self.update_dir(&mut hier, stack, Some(entry), false)?;
                *installed = hier;
                self.clear_move_pair();
            }
            WatchEvent::Create { path, is_dir: false } => {
                // Buffer the new file under the session temp dir so a later
                // CLOSE_WRITE observes a stable byte sequence.
                link_into_tmp(path, &self.engine.cache.tmp_file(&name))?;
                self.clear_move_pair();
            }
            WatchEvent::Delete { path, .. } => {
                let (mut hier, mut stack) = self.path_stack(path)?;
                if let Some(mut dir) = stack.pop() {
                    if dir.remove_entry(&name).is_none() {
                        warn!("delete event for untracked entry {name}");
                    }
                    stack.push(dir);
                    self.update_dir(&mut hier, stack, None, false)?;
                    *installed = hier;
                }
                let tmp = self.engine.cache.tmp_file(&name);
                if tmp.exists() {
                    let _ = std::fs::remove_file(&tmp);
                }
                self.clear_move_pair();
            }
            WatchEvent::CloseWrite { path } => {
                let tmp = self.engine.cache.tmp_file(&name);
                if !tmp.exists() {
                    link_into_tmp(path, &tmp)?;
                }
                let (mut hier, stack) = self.path_stack(path)?;
                let (id, size) = self.engine.store_file(&tmp)?;
                let entry = DirEntry::file(name, id, size as u32);
                self.update_dir(&mut hier, stack, Some(entry), false)?;
                *installed = hier;
                self.clear_move_pair();
            }
            WatchEvent::MovedFrom { path, cookie } => {
                let (mut hier, mut stack) = self.path_stack(path)?;
                if let Some(mut dir) = stack.pop() {
                    self.move_cookie = *cookie;
                    self.move_src = dir.remove_entry(&name);
                    self.move_from = name.clone();
                    if self.move_src.is_none() {
                        warn!("move of untracked entry {name}");
                    }
                    stack.push(dir);
                    self.update_dir(&mut hier, stack, None, false)?;
                    *installed = hier;
                }
                // Deliberately no clear: the matching MOVED_TO pairs on the
                // cookie.
            }
            WatchEvent::MovedTo {
                path,
                is_dir,
                cookie,
            } => {
                let (mut hier, stack) = self.path_stack(path)?;
                let (entry, rm_current_ss) = match self.move_src.take() {
                    Some(mut src) if self.move_cookie == *cookie => {
                        // Rename inside the tree: reuse the entry, content
                        // is already uploaded.
                        src.fname = name.clone();
                        (src, true)
                    }
                    _ => {
                        // Moved in from outside the tree: the content is
                        // new, upload it from where it landed.
                        let (id, size) = self.engine.upload_subtree(path, &self.excludes)?;
                        let entry = if *is_dir {
                            DirEntry::dir(name.clone(), id)
                        } else {
                            DirEntry::file(name.clone(), id, size as u32)
                        };
                        (entry, false)
                    }
                };
                self.update_dir(&mut hier, stack, Some(entry), rm_current_ss)?;
                *installed = hier;

                let tmp_from = self.engine.cache.tmp_file(&self.move_from);
                let tmp_to = self.engine.cache.tmp_file(&name);
                if tmp_from.exists() {
                    let _ = std::fs::rename(&tmp_from, &tmp_to);
                } else if !tmp_to.exists() && !*is_dir {
                    let _ = std::fs::hard_link(path, &tmp_to);
                }
                self.clear_move_pair();
            }
        }
        Ok(())
    }

    /// Rebuilds the hierarchy from the current root snapshot and resolves
    /// the stack of directories from the root down to the parent of the
    /// affected path.
    fn path_stack(&self, affected: &Path) -> Result<(Hierarchy, Vec<Dir>)> {
        let (roots, _) = self.engine.cache.snapshot_tree()?;
        if roots.len() > 1 {
            return Err(CumulusError::Invariant(format!(
                "{} local roots while mutating",
                roots.len()
            )));
        }
        let Some(root_ss) = roots.first() else {
            // Nothing committed yet; the rebuild starts from scratch.
            return Ok((Hierarchy::new(), Vec::new()));
        };
        let snap = self.engine.cache.get_snapshot(root_ss)?;
        let hier = self.engine.load_hierarchy(&snap.root_entry())?;

        let parent = affected.parent().unwrap_or(affected);
        let stack = hierarchy::find(&hier, &snap.root, &self.engine.native_path(parent));
        Ok((hier, stack))
    }

    /// The upward rebuild. `stack` runs from the root down to the affected
    /// directory; `new_entry` is inserted there (`None` means the caller
    /// already rewrote the top of the stack, e.g. for a deletion). Every
    /// rewritten directory is stored everywhere and recorded in `hier`, the
    /// final root hash becomes a new snapshot, and with `rm_current_ss` the
    /// intermediate snapshot of a half-done move is replaced instead of
    /// extended.
    fn update_dir(
        &self,
        hier: &mut Hierarchy,
        mut stack: Vec<Dir>,
        new_entry: Option<DirEntry>,
        rm_current_ss: bool,
    ) -> Result<()> {
        let engine = self.engine;

        let root_id = if stack.is_empty() {
            // Root directory does not exist yet.
            let mut dir = Dir::empty(ROOT_DIR);
            if let Some(entry) = new_entry {
                dir.add_entry(entry);
            }
            let id = engine.store_object(&dir.encode()?)?;
            dir.seal(id);
            hier.insert(id, dir);
            id
        } else {
            let mut entry = if let Some(entry) = new_entry {
                entry
            } else if let Some(mut dir) = stack.pop() {
                // The caller already produced the modified directory.
                let id = engine.store_object(&dir.encode()?)?;
                dir.seal(id);
                let entry = dir.self_entry().clone();
                hier.insert(id, dir);
                entry
            } else {
                return Err(CumulusError::Invariant(
                    "empty path stack in rewrite".to_string(),
                ));
            };
            while let Some(mut dir) = stack.pop() {
                dir.add_entry(entry);
                let id = engine.store_object(&dir.encode()?)?;
                dir.seal(id);
                entry = dir.self_entry().clone();
                hier.insert(id, dir);
            }
            entry.obj_id
        };

        let parents = if rm_current_ss {
            let current = engine.current_root()?.ok_or_else(|| {
                CumulusError::Invariant("move rewrite without a current snapshot".to_string())
            })?;
            let parents = engine.cache.get_snapshot(&current)?.parents;
            engine.remove_snapshot_everywhere(&current)?;
            parents
        } else {
            engine.current_root()?.into_iter().collect()
        };

        let snapshot = Snapshot::new(root_id, parents);
        let ss_id = engine.append_snapshot_everywhere(&snapshot)?;
        engine.pointer.set_root_snapshot(&ss_id)?;
        debug!("snapshot {ss_id} appended, root {root_id}");
        Ok(())
    }

    fn clear_move_pair(&mut self) {
        self.move_cookie = 0;
        self.move_src = None;
        self.move_from.clear();
    }
}

/// Hard-links a freshly created file into the temp dir; a file already
/// buffered is left alone.
fn link_into_tmp(path: &Path, tmp: &Path) -> Result<()> {
    match std::fs::hard_link(path, tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::memory_engine;
    use crate::hasher::ObjectId;

    fn mutator(engine: &Engine) -> Mutator<'_> {
        Mutator::new(engine, GlobSet::empty())
    }

    fn touch_and_write(engine: &Engine, m: &mut Mutator<'_>, rel: &str, content: &[u8]) {
        let path = engine.config.src_dir.join(rel);
        std::fs::write(&path, content).unwrap();
        m.handle(WatchEvent::Create {
            path: path.clone(),
            is_dir: false,
        });
        m.handle(WatchEvent::CloseWrite { path });
    }

    fn root_dir_of_head(engine: &Engine) -> Dir {
        let head = engine.current_root().unwrap().unwrap();
        let snap = engine.cache.get_snapshot(&head).unwrap();
        let hier = engine.load_hierarchy(&snap.root_entry()).unwrap();
        hier[&snap.root].clone()
    }

    #[test]
    fn create_write_cycle_produces_one_snapshot() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        touch_and_write(&engine, &mut m, "a.txt", b"hello");

        // Exactly one snapshot, on the backend and in the cache.
        assert_eq!(engine.backends[0].list_snapshots().unwrap().len(), 1);
        assert_eq!(engine.cache.list_snapshots().unwrap().len(), 1);

        let root = root_dir_of_head(&engine);
        let entry = root.get("a.txt").unwrap();
        assert_eq!(entry.obj_id, ObjectId::of(b"hello"));
        assert_eq!(entry.fsize, 5);
        assert!(engine.cache.contains(&entry.obj_id));
        assert_eq!(
            engine.backends[0].retrieve(&entry.obj_id).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn rename_nets_a_single_snapshot_without_reupload() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        touch_and_write(&engine, &mut m, "a.txt", b"hello");
        let blob = ObjectId::of(b"hello");

        let src = engine.config.src_dir.clone();
        std::fs::rename(src.join("a.txt"), src.join("b.txt")).unwrap();
        m.handle(WatchEvent::MovedFrom {
            path: src.join("a.txt"),
            cookie: 7,
        });
        m.handle(WatchEvent::MovedTo {
            path: src.join("b.txt"),
            is_dir: false,
            cookie: 7,
        });

        // The intermediate snapshot was removed: initial + rename = 2.
        assert_eq!(engine.cache.list_snapshots().unwrap().len(), 2);
        assert_eq!(engine.backends[0].list_snapshots().unwrap().len(), 2);

        let root = root_dir_of_head(&engine);
        assert!(root.get("a.txt").is_none());
        assert_eq!(root.get("b.txt").unwrap().obj_id, blob);
        // Three objects total: the content blob (stored once) plus the two
        // root directory records; the rename never re-uploaded the content.
        assert_eq!(engine.backends[0].list_objects().unwrap().len(), 3);
    }

    #[test]
    fn empty_directory_has_empty_id_and_no_blob() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        let path = engine.config.src_dir.join("d");
        std::fs::create_dir(&path).unwrap();
        m.handle(WatchEvent::Create { path, is_dir: true });

        let root = root_dir_of_head(&engine);
        let entry = root.get("d").unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.obj_id, ObjectId::empty());
        assert_eq!(entry.fsize, 0);
        // Only the root directory record was stored.
        assert_eq!(engine.backends[0].list_objects().unwrap().len(), 1);
    }

    #[test]
    fn nested_write_rewrites_the_chain_upward() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        let src = engine.config.src_dir.clone();

        std::fs::create_dir(src.join("docs")).unwrap();
        m.handle(WatchEvent::Create {
            path: src.join("docs"),
            is_dir: true,
        });
        touch_and_write(&engine, &mut m, "docs/guide.md", b"guide body");

        let root = root_dir_of_head(&engine);
        let docs = root.get("docs").unwrap();
        assert!(docs.is_dir());
        assert_ne!(docs.obj_id, ObjectId::empty());

        let head = engine.current_root().unwrap().unwrap();
        let snap = engine.cache.get_snapshot(&head).unwrap();
        let hier = engine.load_hierarchy(&snap.root_entry()).unwrap();
        let entries = hierarchy::find_entry(&hier, &snap.root, "/docs/guide.md");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].obj_id, ObjectId::of(b"guide body"));
    }

    #[test]
    fn delete_removes_entry_and_appends_snapshot() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        touch_and_write(&engine, &mut m, "a.txt", b"hello");
        touch_and_write(&engine, &mut m, "b.txt", b"world");

        let path = engine.config.src_dir.join("a.txt");
        std::fs::remove_file(&path).unwrap();
        m.handle(WatchEvent::Delete {
            path,
            is_dir: false,
        });

        let root = root_dir_of_head(&engine);
        assert!(root.get("a.txt").is_none());
        assert!(root.get("b.txt").is_some());
    }

    #[test]
    fn events_are_gated_while_syncing() {
        let (_tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        engine.set_source(false);
        touch_and_write(&engine, &mut m, "a.txt", b"hello");
        assert!(engine.cache.list_snapshots().unwrap().is_empty());

        engine.set_source(true);
        m.handle(WatchEvent::CloseWrite {
            path: engine.config.src_dir.join("a.txt"),
        });
        assert_eq!(engine.cache.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn excluded_paths_never_commit() {
        let (_tmp, engine) = memory_engine(1);
        let mut builder = globset::GlobSetBuilder::new();
        builder.add(globset::Glob::new("*.swp").unwrap());
        let mut m = Mutator::new(&engine, builder.build().unwrap());

        touch_and_write(&engine, &mut m, "editor.swp", b"scratch");
        assert!(engine.cache.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn moved_in_from_outside_is_uploaded_fresh() {
        let (tmp, engine) = memory_engine(1);
        let mut m = mutator(&engine);
        touch_and_write(&engine, &mut m, "seed.txt", b"seed");

        // A file appears via rename from outside the watched tree: no
        // matching MOVED_FROM cookie was seen.
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, b"imported").unwrap();
        let dest = engine.config.src_dir.join("imported.txt");
        std::fs::rename(&outside, &dest).unwrap();
        m.handle(WatchEvent::MovedTo {
            path: dest,
            is_dir: false,
            cookie: 99,
        });

        let root = root_dir_of_head(&engine);
        let entry = root.get("imported.txt").unwrap();
        assert_eq!(entry.obj_id, ObjectId::of(b"imported"));
        assert_eq!(
            engine.backends[0].retrieve(&entry.obj_id).unwrap(),
            b"imported"
        );
    }
}
