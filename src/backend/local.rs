//! # Directory-Backed Backend
//!
//! Stores the repository in a plain directory tree, serving both as the
//! "local cloud" replica and as the reference layout for remote adapters:
//!
//! ```text
//! <STORAGE>/
//! ├── ss/            snapshot records, one file per id
//! ├── t/             tag records, one file per tag name
//! ├── a1b2c3...      blobs at the root, named by content id
//! └── ...
//! ```
//!
//! All payloads are decorated on the way in and undecorated on the way out.

use super::{with_retries, Backend};
use crate::decorator::Decorator;
use crate::error::{BackendError, ConfigError, CumulusError, Result};
use crate::hasher::ObjectId;
use crate::record::{Snapshot, Tag};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SS_FOLDER: &str = "ss";
const TAG_FOLDER: &str = "t";

#[derive(Debug)]
pub struct LocalBackend {
    id: String,
    storage: PathBuf,
    decorator: Arc<Decorator>,
}

impl LocalBackend {
    /// Opens (and if necessary creates) the storage directory tree. Creation
    /// is retried before giving up, matching the init contract shared by all
    /// backends.
    pub fn open(
        id: &str,
        conf: &BTreeMap<String, String>,
        decorator: Arc<Decorator>,
    ) -> Result<Self> {
        let storage = conf.get("STORAGE").ok_or_else(|| ConfigError::Validation {
            message: format!("backend {id}: STORAGE not set"),
        })?;
        let storage = PathBuf::from(storage);

        let init = with_retries(id, "initialize storage", || {
            std::fs::create_dir_all(storage.join(SS_FOLDER))?;
            std::fs::create_dir_all(storage.join(TAG_FOLDER))?;
            Ok(())
        });
        if init.is_err() {
            return Err(BackendError::Init {
                backend: id.to_string(),
                attempts: super::TRIALS,
            }
            .into());
        }

        Ok(LocalBackend {
            id: id.to_string(),
            storage,
            decorator,
        })
    }

    /// Registry constructor.
    pub fn open_boxed(
        id: &str,
        conf: &BTreeMap<String, String>,
        decorator: Arc<Decorator>,
    ) -> Result<Box<dyn Backend>> {
        Ok(Box::new(LocalBackend::open(id, conf, decorator)?))
    }

    fn blob_path(&self, id: &ObjectId) -> PathBuf {
        self.storage.join(id.as_str())
    }

    fn ss_path(&self, id: &ObjectId) -> PathBuf {
        self.storage.join(SS_FOLDER).join(id.as_str())
    }

    fn tag_path(&self, name: &str) -> PathBuf {
        self.storage.join(TAG_FOLDER).join(name)
    }

    fn not_found(&self, namespace: &'static str, id: &str) -> CumulusError {
        BackendError::NotFound {
            backend: self.id.clone(),
            namespace,
            id: id.to_string(),
        }
        .into()
    }

    /// Lists one namespace directory, mapping entry names through `parse`.
    fn list_dir<T>(&self, folder: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.storage.join(folder))? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(value) = parse(name) {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }
}

impl Backend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_snapshots(&self) -> Result<BTreeMap<ObjectId, DateTime<Utc>>> {
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(self.storage.join(SS_FOLDER))? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) else {
                continue;
            };
            let modified = entry.metadata()?.modified()?;
            out.insert(id, DateTime::<Utc>::from(modified));
        }
        Ok(out)
    }

    fn get_snapshot(&self, id: &ObjectId) -> Result<Snapshot> {
        debug!("{}: get snapshot {id}", self.id);
        let data = std::fs::read(self.ss_path(id)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => self.not_found("snapshot", id.as_str()),
            _ => e.into(),
        })?;
        let data = self.decorator.undecorate(&data)?;
        Ok(Snapshot::decode(&data)?)
    }

    fn append_snapshot(&self, snap: &Snapshot, id: Option<ObjectId>) -> Result<ObjectId> {
        let decorated = self.decorator.decorate(&snap.encode())?;
        let id = match id {
            Some(id) => id,
            None => {
                debug!("{}: snapshot id not specified, recomputing", self.id);
                ObjectId::of(&decorated)
            }
        };
        std::fs::write(self.ss_path(&id), decorated)?;
        debug!("{}: appended snapshot {id}", self.id);
        Ok(id)
    }

    fn remove_snapshot(&self, id: &ObjectId) -> Result<()> {
        debug!("{}: remove snapshot {id}", self.id);
        match std::fs::remove_file(self.ss_path(id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_tags(&self) -> Result<Vec<String>> {
        self.list_dir(TAG_FOLDER, |name| Some(name.to_string()))
    }

    fn tag(&self, name: &str, tag: &Tag) -> Result<()> {
        let decorated = self.decorator.decorate(&tag.encode()?)?;
        std::fs::write(self.tag_path(name), decorated)?;
        Ok(())
    }

    fn get_tagged(&self, name: &str) -> Result<Tag> {
        let data = std::fs::read(self.tag_path(name)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => self.not_found("tag", name),
            _ => e.into(),
        })?;
        Ok(Tag::decode(&self.decorator.undecorate(&data)?)?)
    }

    fn untag(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.tag_path(name)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        self.list_dir("", |name| name.parse().ok())
    }

    fn store(&self, data: &[u8], id: Option<ObjectId>) -> Result<ObjectId> {
        if data.is_empty() {
            return Ok(ObjectId::empty());
        }
        let (computed, decorated) = match id {
            Some(id) => (id, None),
            None => {
                let (id, bytes) = self.decorator.object_id(data)?;
                (id, Some(bytes))
            }
        };
        let path = self.blob_path(&computed);
        // Content-addressed: an existing object with this id is this object.
        if !path.exists() {
            let bytes = match decorated {
                Some(bytes) => bytes,
                None => self.decorator.decorate(data)?,
            };
            std::fs::write(&path, bytes)?;
            debug!("{}: stored object {computed}", self.id);
        }
        Ok(computed)
    }

    fn retrieve(&self, id: &ObjectId) -> Result<Vec<u8>> {
        if id.is_empty_object() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(self.blob_path(id)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => self.not_found("object", id.as_str()),
            _ => e.into(),
        })?;
        self.decorator.undecorate(&data)
    }

    fn store_from_file(&self, path: &Path, id: Option<ObjectId>) -> Result<ObjectId> {
        let data = std::fs::read(path)?;
        self.store(&data, id)
    }

    fn retrieve_to_file(&self, id: &ObjectId, path: &Path) -> Result<()> {
        if id.is_empty_object() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, b"")?;
            return Ok(());
        }
        if !self.blob_path(id).exists() {
            return Err(self.not_found("object", id.as_str()));
        }
        self.decorator.undecorate_file(&self.blob_path(id), path)
    }

    fn remove(&self, id: &ObjectId) -> Result<()> {
        debug!("{}: remove object {id}", self.id);
        match std::fs::remove_file(self.blob_path(id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, LocalBackend) {
        let tmp = tempfile::tempdir().unwrap();
        let mut conf = BTreeMap::new();
        conf.insert(
            "STORAGE".to_string(),
            tmp.path().join("store").to_string_lossy().into_owned(),
        );
        let backend =
            LocalBackend::open("local", &conf, Arc::new(Decorator::new(true, 3, None))).unwrap();
        (tmp, backend)
    }

    #[test]
    fn init_creates_namespaces() {
        let (tmp, _backend) = open_temp();
        assert!(tmp.path().join("store/ss").is_dir());
        assert!(tmp.path().join("store/t").is_dir());
    }

    #[test]
    fn missing_storage_key_is_rejected() {
        let conf = BTreeMap::new();
        assert!(LocalBackend::open("local", &conf, Arc::new(Decorator::plain())).is_err());
    }

    #[test]
    fn blob_files_are_decorated_on_disk() {
        let (tmp, backend) = open_temp();
        let id = backend.store(b"plaintext payload", None).unwrap();
        let on_disk = std::fs::read(tmp.path().join("store").join(id.as_str())).unwrap();
        assert_ne!(on_disk, b"plaintext payload");
        assert_eq!(backend.retrieve(&id).unwrap(), b"plaintext payload");
    }

    #[test]
    fn snapshots_live_under_ss() {
        let (tmp, backend) = open_temp();
        let snap = Snapshot::new(ObjectId::of(b"root"), vec![]);
        let id = backend.append_snapshot(&snap, None).unwrap();
        assert!(tmp.path().join("store/ss").join(id.as_str()).is_file());
        assert_eq!(backend.get_snapshot(&id).unwrap(), snap);
        // Snapshot objects never appear in the blob namespace.
        assert!(backend.list_objects().unwrap().is_empty());
    }

    #[test]
    fn list_snapshots_reports_timestamps() {
        let (_tmp, backend) = open_temp();
        let id = backend
            .append_snapshot(&Snapshot::new(ObjectId::of(b"r"), vec![]), None)
            .unwrap();
        let listed = backend.list_snapshots().unwrap();
        let age = Utc::now() - listed[&id];
        assert!(age.num_seconds() < 60);
    }

    #[test]
    fn file_roundtrip_through_store() {
        let (tmp, backend) = open_temp();
        let src = tmp.path().join("input.txt");
        std::fs::write(&src, b"file body").unwrap();

        let id = backend.store_from_file(&src, None).unwrap();
        let dst = tmp.path().join("output.txt");
        backend.retrieve_to_file(&id, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"file body");
    }

    #[test]
    fn retrieve_to_file_materializes_empty_objects() {
        let (tmp, backend) = open_temp();
        let dst = tmp.path().join("deep/nested/empty.txt");
        backend.retrieve_to_file(&ObjectId::empty(), &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"");
    }

    #[test]
    fn tags_roundtrip() {
        let (_tmp, backend) = open_temp();
        let tag = Tag::new(ObjectId::of(b"ss"), "/notes");
        backend.tag("stable", &tag).unwrap();
        assert_eq!(backend.get_tagged("stable").unwrap(), tag);
        backend.untag("stable").unwrap();
        backend.untag("stable").unwrap();
        assert!(backend.get_tagged("stable").is_err());
    }
}
