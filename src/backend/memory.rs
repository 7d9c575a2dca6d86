//! # In-Memory Backend
//!
//! Reference implementation of the [`Backend`] contract backed by hash maps.
//! Used by the engine tests as a stand-in replica; behaves exactly like a
//! remote store, including decoration of stored payloads.

use super::Backend;
use crate::decorator::Decorator;
use crate::error::{BackendError, CumulusError, Result};
use crate::hasher::ObjectId;
use crate::record::{Snapshot, Tag};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default, Debug)]
struct Store {
    snapshots: HashMap<ObjectId, (Vec<u8>, DateTime<Utc>)>,
    tags: HashMap<String, Vec<u8>>,
    blobs: HashMap<ObjectId, Vec<u8>>,
}

/// Clones share the underlying store, so one "cloud" can be handed to
/// several engines at once — exactly how multiple peers see one replica.
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    id: String,
    decorator: Arc<Decorator>,
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new(id: &str, decorator: Arc<Decorator>) -> Self {
        MemoryBackend {
            id: id.to_string(),
            decorator,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(&self, namespace: &'static str, id: &str) -> CumulusError {
        BackendError::NotFound {
            backend: self.id.clone(),
            namespace,
            id: id.to_string(),
        }
        .into()
    }

    /// Overrides a snapshot's timestamp. Timestamps are assigned on write,
    /// so tests aging a history need to adjust them afterwards.
    pub fn set_snapshot_time(&self, id: &ObjectId, at: DateTime<Utc>) {
        if let Some((_, ts)) = self.lock().snapshots.get_mut(id) {
            *ts = at;
        }
    }
}

impl Backend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_snapshots(&self) -> Result<BTreeMap<ObjectId, DateTime<Utc>>> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .map(|(id, (_, ts))| (*id, *ts))
            .collect())
    }

    fn get_snapshot(&self, id: &ObjectId) -> Result<Snapshot> {
        let store = self.lock();
        let (data, _) = store
            .snapshots
            .get(id)
            .ok_or_else(|| self.not_found("snapshot", id.as_str()))?;
        Ok(Snapshot::decode(&self.decorator.undecorate(data)?)?)
    }

    fn append_snapshot(&self, snap: &Snapshot, id: Option<ObjectId>) -> Result<ObjectId> {
        let decorated = self.decorator.decorate(&snap.encode())?;
        let id = id.unwrap_or_else(|| ObjectId::of(&decorated));
        self.lock()
            .snapshots
            .insert(id, (decorated, Utc::now()));
        Ok(id)
    }

    fn remove_snapshot(&self, id: &ObjectId) -> Result<()> {
        self.lock().snapshots.remove(id);
        Ok(())
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.lock().tags.keys().cloned().collect())
    }

    fn tag(&self, name: &str, tag: &Tag) -> Result<()> {
        let decorated = self.decorator.decorate(&tag.encode()?)?;
        self.lock().tags.insert(name.to_string(), decorated);
        Ok(())
    }

    fn get_tagged(&self, name: &str) -> Result<Tag> {
        let store = self.lock();
        let data = store
            .tags
            .get(name)
            .ok_or_else(|| self.not_found("tag", name))?;
        Ok(Tag::decode(&self.decorator.undecorate(data)?)?)
    }

    fn untag(&self, name: &str) -> Result<()> {
        self.lock().tags.remove(name);
        Ok(())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        Ok(self.lock().blobs.keys().copied().collect())
    }

    fn store(&self, data: &[u8], id: Option<ObjectId>) -> Result<ObjectId> {
        if data.is_empty() {
            return Ok(ObjectId::empty());
        }
        let (id, decorated) = match id {
            Some(id) => (id, self.decorator.decorate(data)?),
            None => self.decorator.object_id(data)?,
        };
        self.lock().blobs.entry(id).or_insert(decorated);
        Ok(id)
    }

    fn retrieve(&self, id: &ObjectId) -> Result<Vec<u8>> {
        if id.is_empty_object() {
            return Ok(Vec::new());
        }
        let store = self.lock();
        let data = store
            .blobs
            .get(id)
            .ok_or_else(|| self.not_found("object", id.as_str()))?;
        self.decorator.undecorate(data)
    }

    fn store_from_file(&self, path: &Path, id: Option<ObjectId>) -> Result<ObjectId> {
        let data = std::fs::read(path)?;
        self.store(&data, id)
    }

    fn retrieve_to_file(&self, id: &ObjectId, path: &Path) -> Result<()> {
        let data = self.retrieve(id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    fn remove(&self, id: &ObjectId) -> Result<()> {
        self.lock().blobs.remove(id);
        Ok(())
    }
}
