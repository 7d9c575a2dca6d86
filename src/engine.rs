//! # Engine Context
//!
//! One context object owns everything the process used to keep in globals:
//! the configuration, the decorator, the local cache, the backend replicas,
//! the root-snapshot pointer, the installed-hierarchy map, and the `source`
//! flag that gates feedback between sync-driven file writes and the
//! filesystem watcher.
//!
//! The hierarchy mutex is the engine's single lock: it is held for the full
//! duration of an upward Merkle rebuild, a sync merge, and a GC pass.

use crate::backend::{self, Backend};
use crate::cache::CacheStore;
use crate::config::Config;
use crate::decorator::Decorator;
use crate::error::{CumulusError, Result};
use crate::hasher::ObjectId;
use crate::hierarchy::{self, Hierarchy};
use crate::pointer::PointerStore;
use crate::record::{Dir, DirEntry, Snapshot, ROOT_DIR};
use globset::GlobSet;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use walkdir::WalkDir;

pub struct Engine {
    pub config: Config,
    pub decorator: Arc<Decorator>,
    pub cache: CacheStore,
    pub backends: Vec<Box<dyn Backend>>,
    pub pointer: PointerStore,
    hier: Mutex<Hierarchy>,
    /// True while local filesystem events originate from the user; lowered
    /// during synchronization so sync-driven writes do not loop back in.
    source: AtomicBool,
}

impl Engine {
    /// Opens the engine: state directories, cache, pointer store, and one
    /// backend per configured cloud.
    pub fn open(config: Config) -> Result<Engine> {
        let decorator = Arc::new(Decorator::new(
            config.compress,
            config.zstd_level,
            if config.encrypt {
                config.password.as_deref()
            } else {
                None
            },
        ));

        config.ensure_dirs()?;
        let cache = CacheStore::open(&config, Arc::clone(&decorator))?;
        let pointer = PointerStore::open(&config.db_path())?;

        let mut backends = Vec::with_capacity(config.clouds.len());
        for cloud in &config.clouds {
            backends.push(backend::open_backend(cloud, &config, Arc::clone(&decorator))?);
        }

        Ok(Engine {
            config,
            decorator,
            cache,
            backends,
            pointer,
            hier: Mutex::new(Hierarchy::new()),
            source: AtomicBool::new(true),
        })
    }

    /// Assembles an engine over pre-built backends (tests, single-cloud
    /// tools).
    #[allow(dead_code)]
    pub fn with_backends(config: Config, backends: Vec<Box<dyn Backend>>) -> Result<Engine> {
        let decorator = Arc::new(Decorator::new(
            config.compress,
            config.zstd_level,
            if config.encrypt {
                config.password.as_deref()
            } else {
                None
            },
        ));
        config.ensure_dirs()?;
        let cache = CacheStore::open(&config, Arc::clone(&decorator))?;
        let pointer = PointerStore::open(&config.db_path())?;
        Ok(Engine {
            config,
            decorator,
            cache,
            backends,
            pointer,
            hier: Mutex::new(Hierarchy::new()),
            source: AtomicBool::new(true),
        })
    }

    // ── Shared state ────────────────────────────────────────────────────

    /// Acquires the hierarchy lock for the duration of a mutation pass.
    pub fn lock_hierarchy(&self) -> MutexGuard<'_, Hierarchy> {
        self.hier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> bool {
        self.source.load(Ordering::SeqCst)
    }

    pub fn set_source(&self, value: bool) {
        self.source.store(value, Ordering::SeqCst);
    }

    /// The currently installed root snapshot id.
    pub fn current_root(&self) -> Result<Option<ObjectId>> {
        self.pointer.root_snapshot()
    }

    // ── Replicated object operations ────────────────────────────────────

    /// Stores a payload on every backend and in the cache under one agreed
    /// id. The empty payload short-circuits.
    pub fn store_object(&self, data: &[u8]) -> Result<ObjectId> {
        if data.is_empty() {
            return Ok(ObjectId::empty());
        }
        let (id, _) = self.decorator.object_id(data)?;
        self.store_object_as(&id, data)?;
        Ok(id)
    }

    /// Stores a payload under an id assigned elsewhere.
    pub fn store_object_as(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        if id.is_empty_object() {
            return Ok(());
        }
        for backend in &self.backends {
            backend.store(data, Some(*id))?;
        }
        self.cache.store(id, data)
    }

    /// Stores a file's contents everywhere, returning `(id, size)`.
    pub fn store_file(&self, path: &Path) -> Result<(ObjectId, u64)> {
        let data = std::fs::read(path)?;
        let size = data.len() as u64;
        let id = self.store_object(&data)?;
        Ok((id, size))
    }

    /// Writes an object's payload to a local file, preferring the cache and
    /// falling back across backends.
    pub fn materialize(&self, id: &ObjectId, path: &Path) -> Result<()> {
        if let Ok(data) = self.cache.retrieve(id) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, data)?;
            return Ok(());
        }
        let mut last: Option<CumulusError> = None;
        for backend in &self.backends {
            match backend.retrieve_to_file(id, path) {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            CumulusError::Invariant("no backend configured".to_string())
        }))
    }

    /// Appends a snapshot to the cache and every backend under one id.
    pub fn append_snapshot_everywhere(&self, snap: &Snapshot) -> Result<ObjectId> {
        let id = self.cache.append_snapshot(snap, None)?;
        for backend in &self.backends {
            backend.append_snapshot(snap, Some(id))?;
        }
        Ok(id)
    }

    pub fn remove_snapshot_everywhere(&self, id: &ObjectId) -> Result<()> {
        self.cache.remove_snapshot(id)?;
        for backend in &self.backends {
            backend.remove_snapshot(id)?;
        }
        Ok(())
    }

    /// Loads the hierarchy below `root`, cache first, backends on miss.
    pub fn load_hierarchy(&self, root: &DirEntry) -> Result<Hierarchy> {
        hierarchy::load(root, &self.cache, &self.backends)
    }

    // ── Paths ───────────────────────────────────────────────────────────

    /// Converts an absolute path inside the watched tree to the engine's
    /// `/`-rooted form.
    pub fn native_path(&self, abs: &Path) -> String {
        match abs.strip_prefix(&self.config.src_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => ROOT_DIR.to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy().replace('\\', "/")),
            Err(_) => abs.to_string_lossy().into_owned(),
        }
    }

    // ── Initial upload ──────────────────────────────────────────────────

    /// Uploads the whole watched tree bottom-up, returning the root
    /// directory id. Empty directories collapse to the empty id without any
    /// store call; excluded names are skipped.
    pub fn upload_tree(&self, excludes: &GlobSet) -> Result<ObjectId> {
        let total = WalkDir::new(&self.config.src_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64;
        let pb = upload_progress(total);

        let (id, _) = self.upload_dir(&self.config.src_dir, excludes, Some(&pb))?;
        pb.finish_with_message("done");
        Ok(id)
    }

    /// Uploads a single file or subtree that appeared inside the watched
    /// tree (e.g. moved in from outside), returning `(id, size)`.
    pub fn upload_subtree(&self, abs: &Path, excludes: &GlobSet) -> Result<(ObjectId, u64)> {
        if abs.is_dir() {
            self.upload_dir(abs, excludes, None)
        } else {
            self.store_file(abs)
        }
    }

    fn upload_dir(
        &self,
        abs: &Path,
        excludes: &GlobSet,
        pb: Option<&ProgressBar>,
    ) -> Result<(ObjectId, u64)> {
        let name = abs
            .file_name()
            .map_or_else(|| ROOT_DIR.to_string(), |n| n.to_string_lossy().into_owned());
        let mut dir = Dir::empty(name);

        for child in std::fs::read_dir(abs)? {
            let child = child?;
            let path = child.path();
            let fname = child.file_name().to_string_lossy().into_owned();
            if self.is_excluded(&path, excludes) {
                debug!("upload: skipping excluded {}", path.display());
                continue;
            }
            if child.file_type()?.is_dir() {
                let (id, _) = self.upload_dir(&path, excludes, pb)?;
                dir.add_entry(DirEntry::dir(fname, id));
            } else {
                if let Some(pb) = pb {
                    pb.set_message(fname.clone());
                }
                let (id, size) = self.store_file(&path)?;
                dir.add_entry(DirEntry::file(fname, id, size as u32));
                if let Some(pb) = pb {
                    pb.inc(1);
                }
            }
        }

        // An empty directory is the empty object; nothing is stored.
        let id = self.store_object(&dir.encode()?)?;
        Ok((id, 0))
    }

    /// An event path is ignored when it matches an exclude glob (against the
    /// path relative to the watched tree or its bare name) or lives inside
    /// the engine's own state directory.
    pub fn is_excluded(&self, abs: &Path, excludes: &GlobSet) -> bool {
        if abs.starts_with(&self.config.sys_dir) {
            return true;
        }
        let rel = abs.strip_prefix(&self.config.src_dir).unwrap_or(abs);
        excludes.is_match(rel)
            || abs
                .file_name()
                .is_some_and(|name| excludes.is_match(Path::new(name)))
    }
}

fn upload_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} uploading [{bar:30.cyan/dim}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    /// An engine over in-memory replicas and a temp state dir, plus a
    /// seeded source tree.
    pub fn memory_engine(clouds: usize) -> (tempfile::TempDir, Engine) {
        let (tmp, engine, _) = memory_engine_with_handles(clouds);
        (tmp, engine)
    }

    /// Like [`memory_engine`], also returning shared handles onto the
    /// in-memory replicas (clones share the store).
    pub fn memory_engine_with_handles(
        clouds: usize,
    ) -> (tempfile::TempDir, Engine, Vec<MemoryBackend>) {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            tmp.path().join(".config"),
            format!(
                "SRC_DIR={}\nSYS_DIR={}\nINTERVAL=0\nCOMPRESS=no\n",
                src.display(),
                tmp.path().join("sys").display()
            ),
        )
        .unwrap();
        let config = Config::load(&tmp.path().join(".config")).unwrap();
        let decorator = Arc::new(Decorator::plain());
        let handles: Vec<MemoryBackend> = (0..clouds)
            .map(|i| MemoryBackend::new(&format!("mem{i}"), Arc::clone(&decorator)))
            .collect();
        let backends: Vec<Box<dyn Backend>> = handles
            .iter()
            .map(|h| Box::new(h.clone()) as Box<dyn Backend>)
            .collect();
        let engine = Engine::with_backends(config, backends).unwrap();
        (tmp, engine, handles)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::memory_engine;
    use super::*;

    #[test]
    fn store_object_reaches_cache_and_every_backend() {
        let (_tmp, engine) = memory_engine(2);
        let id = engine.store_object(b"replicated").unwrap();
        assert!(engine.cache.contains(&id));
        for backend in &engine.backends {
            assert_eq!(backend.retrieve(&id).unwrap(), b"replicated");
        }
    }

    #[test]
    fn empty_object_is_never_written() {
        let (_tmp, engine) = memory_engine(1);
        assert_eq!(engine.store_object(b"").unwrap(), ObjectId::empty());
        assert!(engine.backends[0].list_objects().unwrap().is_empty());
    }

    #[test]
    fn snapshots_replicate_under_one_id() {
        let (_tmp, engine) = memory_engine(2);
        let snap = Snapshot::new(ObjectId::of(b"root"), vec![]);
        let id = engine.append_snapshot_everywhere(&snap).unwrap();
        assert_eq!(engine.cache.get_snapshot(&id).unwrap(), snap);
        for backend in &engine.backends {
            assert_eq!(backend.get_snapshot(&id).unwrap(), snap);
        }
        engine.remove_snapshot_everywhere(&id).unwrap();
        for backend in &engine.backends {
            assert!(backend.list_snapshots().unwrap().is_empty());
        }
    }

    #[test]
    fn native_path_is_slash_rooted() {
        let (_tmp, engine) = memory_engine(1);
        let src = engine.config.src_dir.clone();
        assert_eq!(engine.native_path(&src), "/");
        assert_eq!(engine.native_path(&src.join("a/b.txt")), "/a/b.txt");
    }

    #[test]
    fn upload_tree_builds_nested_records() {
        let (_tmp, engine) = memory_engine(1);
        let src = engine.config.src_dir.clone();
        std::fs::write(src.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(src.join("docs")).unwrap();
        std::fs::write(src.join("docs/guide.md"), b"guide").unwrap();
        std::fs::create_dir(src.join("empty")).unwrap();

        let excludes = GlobSet::empty();
        let root_id = engine.upload_tree(&excludes).unwrap();

        let hier = engine
            .load_hierarchy(&DirEntry::dir(ROOT_DIR, root_id))
            .unwrap();
        let root = &hier[&root_id];
        assert_eq!(
            root.get("a.txt").unwrap().obj_id,
            ObjectId::of(b"hello")
        );
        assert_eq!(root.get("a.txt").unwrap().fsize, 5);
        // Empty subdirectory: empty id, no blob anywhere.
        assert_eq!(root.get("empty").unwrap().obj_id, ObjectId::empty());
        let docs = &hier[&root.get("docs").unwrap().obj_id];
        assert!(docs.get("guide.md").is_some());
    }

    #[test]
    fn excluded_names_are_skipped_on_upload() {
        let (_tmp, engine) = memory_engine(1);
        let src = engine.config.src_dir.clone();
        std::fs::write(src.join("keep.txt"), b"keep").unwrap();
        std::fs::write(src.join("skip.tmp"), b"skip").unwrap();

        let mut builder = globset::GlobSetBuilder::new();
        builder.add(globset::Glob::new("*.tmp").unwrap());
        let excludes = builder.build().unwrap();

        let root_id = engine.upload_tree(&excludes).unwrap();
        let hier = engine
            .load_hierarchy(&DirEntry::dir(ROOT_DIR, root_id))
            .unwrap();
        assert!(hier[&root_id].get("keep.txt").is_some());
        assert!(hier[&root_id].get("skip.tmp").is_none());
    }

    #[test]
    fn source_flag_round_trips() {
        let (_tmp, engine) = memory_engine(1);
        assert!(engine.source());
        engine.set_source(false);
        assert!(!engine.source());
        engine.set_source(true);
        assert!(engine.source());
    }
}
