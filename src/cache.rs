//! # Local Cache Store
//!
//! Disk mirror of remote blobs keyed by content hash, plus the local
//! snapshot directory and the per-session temp dir used for write buffering.
//! All hot reads are served from here; misses fall through to a backend and
//! populate the cache on the way back.
//!
//! Cached payloads are stored *undecorated* — the cache is a private mirror,
//! so skipping the decorate/undecorate round-trip keeps hot reads cheap. Ids
//! are still the ones assigned by the backends. The cache is append-only;
//! eviction happens only through garbage collection.

use crate::config::Config;
use crate::dag;
use crate::decorator::Decorator;
use crate::error::{BackendError, CumulusError, Result};
use crate::hasher::ObjectId;
use crate::record::Snapshot;
use log::debug;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

pub struct CacheStore {
    cache_dir: PathBuf,
    ss_dir: PathBuf,
    tmp_dir: PathBuf,
    decorator: Arc<Decorator>,
    /// Decoded-snapshot memo; snapshots are immutable so entries never go
    /// stale, they only disappear with `remove_snapshot`.
    snapshots: Mutex<HashMap<ObjectId, Snapshot>>,
}

impl CacheStore {
    pub fn open(config: &Config, decorator: Arc<Decorator>) -> Result<Self> {
        let store = CacheStore {
            cache_dir: config.cache_dir(),
            ss_dir: config.ss_dir(),
            tmp_dir: config.tmp_dir(),
            decorator,
            snapshots: Mutex::new(HashMap::new()),
        };
        std::fs::create_dir_all(&store.cache_dir)?;
        std::fs::create_dir_all(&store.ss_dir)?;
        std::fs::create_dir_all(&store.tmp_dir)?;
        Ok(store)
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Snapshot>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Snapshot namespace ──────────────────────────────────────────────

    pub fn list_snapshots(&self) -> Result<Vec<ObjectId>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.ss_dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn get_snapshot(&self, id: &ObjectId) -> Result<Snapshot> {
        if let Some(snap) = self.memo().get(id) {
            return Ok(snap.clone());
        }
        let data = std::fs::read(self.ss_dir.join(id.as_str())).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CumulusError::from(BackendError::NotFound {
                backend: "cache".to_string(),
                namespace: "snapshot",
                id: id.to_string(),
            }),
            _ => e.into(),
        })?;
        let snap = Snapshot::decode(&data)?;
        self.memo().insert(*id, snap.clone());
        Ok(snap)
    }

    /// Appends a snapshot locally. When no id is given, the id is the digest
    /// of the decorated serialization, so locally-minted ids agree with what
    /// backends would compute.
    pub fn append_snapshot(&self, snap: &Snapshot, id: Option<ObjectId>) -> Result<ObjectId> {
        let id = match id {
            Some(id) => id,
            None => self.decorator.object_id(&snap.encode())?.0,
        };
        std::fs::write(self.ss_dir.join(id.as_str()), snap.encode())?;
        self.memo().insert(id, snap.clone());
        debug!("cache: appended snapshot {id}");
        Ok(id)
    }

    pub fn remove_snapshot(&self, id: &ObjectId) -> Result<()> {
        self.memo().remove(id);
        match std::fs::remove_file(self.ss_dir.join(id.as_str())) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Builds the snapshot DAG over everything cached locally.
    pub fn snapshot_tree(&self) -> Result<(Vec<ObjectId>, HashMap<ObjectId, Snapshot>)> {
        let mut snapshots = HashMap::new();
        for id in self.list_snapshots()? {
            snapshots.insert(id, self.get_snapshot(&id)?);
        }
        let roots = dag::roots(&snapshots);
        Ok((roots, snapshots))
    }

    // ── Blob namespace ──────────────────────────────────────────────────

    #[allow(dead_code)]
    pub fn contains(&self, id: &ObjectId) -> bool {
        id.is_empty_object() || self.cache_dir.join(id.as_str()).exists()
    }

    /// Caches a payload under an id assigned elsewhere.
    pub fn store(&self, id: &ObjectId, data: &[u8]) -> Result<()> {
        if id.is_empty_object() {
            return Ok(());
        }
        std::fs::write(self.cache_dir.join(id.as_str()), data)?;
        Ok(())
    }

    pub fn retrieve(&self, id: &ObjectId) -> Result<Vec<u8>> {
        if id.is_empty_object() {
            return Ok(Vec::new());
        }
        std::fs::read(self.cache_dir.join(id.as_str())).map_err(|e| match e.kind() {
            ErrorKind::NotFound => BackendError::NotFound {
                backend: "cache".to_string(),
                namespace: "object",
                id: id.to_string(),
            }
            .into(),
            _ => e.into(),
        })
    }

    pub fn remove(&self, id: &ObjectId) -> Result<()> {
        match std::fs::remove_file(self.cache_dir.join(id.as_str())) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    // ── Write buffering ─────────────────────────────────────────────────

    /// Path of the session temp copy for a file being written.
    pub fn tmp_file(&self, name: &str) -> PathBuf {
        self.tmp_dir.join(name)
    }
}
