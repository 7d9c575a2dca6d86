//! # Blob Store Backends
//!
//! The [`Backend`] trait is the contract every replica must satisfy: three
//! logical namespaces (`ss/` snapshots, `t/` tags, blob root) over
//! content-addressed objects, with idempotent removal and `EMPTY` id
//! short-circuits. Backends are interchangeable — the engine treats each
//! configured cloud as an equal replica of the repository.
//!
//! Backends are constructed through a registry keyed by cloud id, so new
//! adapters plug in without touching the engine.

pub mod local;
#[allow(dead_code)]
pub mod memory;

use crate::config::Config;
use crate::decorator::Decorator;
use crate::error::{BackendError, Result};
use crate::hasher::ObjectId;
use crate::record::{Snapshot, Tag};
use chrono::{DateTime, Utc};
use log::warn;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Attempts made before an initialization failure is fatal.
pub const TRIALS: u32 = 3;

/// Storage contract for one replica.
///
/// Implementations own a [`Decorator`] applied to payload bytes before
/// `store` and after `retrieve`; ids name the decorated bytes. All
/// operations take `&self` — implementations handle their own interior
/// synchronization.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Cloud id this backend was registered under.
    fn id(&self) -> &str;

    /// Enumerates the snapshot namespace with per-object timestamps
    /// (assigned by the backend on write; advisory ordering only).
    fn list_snapshots(&self) -> Result<BTreeMap<ObjectId, DateTime<Utc>>>;

    fn get_snapshot(&self, id: &ObjectId) -> Result<Snapshot>;

    /// Appends a snapshot. When `id` is `None` the id is recomputed from the
    /// decorated serialization; passing an id keeps replicas in agreement.
    fn append_snapshot(&self, snap: &Snapshot, id: Option<ObjectId>) -> Result<ObjectId>;

    /// Idempotent: removing a missing snapshot is not an error.
    fn remove_snapshot(&self, id: &ObjectId) -> Result<()>;

    fn list_tags(&self) -> Result<Vec<String>>;
    fn tag(&self, name: &str, tag: &Tag) -> Result<()>;
    fn get_tagged(&self, name: &str) -> Result<Tag>;
    /// Idempotent.
    fn untag(&self, name: &str) -> Result<()>;

    /// Enumerates the blob namespace.
    fn list_objects(&self) -> Result<Vec<ObjectId>>;

    /// Stores a payload; the empty payload is a no-op returning the empty id.
    fn store(&self, data: &[u8], id: Option<ObjectId>) -> Result<ObjectId>;

    /// Retrieves a payload; the empty id yields empty bytes without I/O.
    fn retrieve(&self, id: &ObjectId) -> Result<Vec<u8>>;

    /// File-based store variant.
    fn store_from_file(&self, path: &Path, id: Option<ObjectId>) -> Result<ObjectId>;

    /// File-based retrieve variant.
    fn retrieve_to_file(&self, id: &ObjectId, path: &Path) -> Result<()>;

    /// Idempotent.
    fn remove(&self, id: &ObjectId) -> Result<()>;
}

type Constructor =
    fn(&str, &BTreeMap<String, String>, Arc<Decorator>) -> Result<Box<dyn Backend>>;

/// Cloud id → constructor. Cloud SDK adapters register here; only the
/// directory-backed backend ships built in.
const REGISTRY: &[(&str, Constructor)] = &[("local", local::LocalBackend::open_boxed)];

/// Opens the backend registered under `cloud`, reading its `<cloud>.conf`.
pub fn open_backend(
    cloud: &str,
    config: &Config,
    decorator: Arc<Decorator>,
) -> Result<Box<dyn Backend>> {
    let constructor = REGISTRY
        .iter()
        .find(|(id, _)| *id == cloud)
        .map(|(_, ctor)| ctor)
        .ok_or_else(|| BackendError::Unknown(cloud.to_string()))?;
    let conf = config.cloud_conf(cloud)?;
    constructor(cloud, &conf, decorator)
}

/// Runs `op` up to [`TRIALS`] times with exponential backoff, returning the
/// last error if every attempt fails.
pub(crate) fn with_retries<T>(
    backend: &str,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < TRIALS => {
                warn!("{backend}: {what} failed (attempt {attempt}/{TRIALS}): {e}");
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
