//! # Root-Snapshot Pointer
//!
//! The one piece of mutable state that survives restarts: which snapshot is
//! currently installed in the working tree. Held in a tiny embedded sled
//! database under the state directory; single-writer through the engine's
//! hierarchy lock.

use crate::error::Result;
use crate::hasher::ObjectId;
use anyhow::Context;
use std::path::Path;

const ROOT_SNAPSHOT: &[u8] = b"root_snapshot";

pub struct PointerStore {
    db: sled::Db,
}

impl PointerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open pointer store at {}", path.display()))?;
        Ok(PointerStore { db })
    }

    /// The currently installed root snapshot, if any snapshot exists yet.
    pub fn root_snapshot(&self) -> Result<Option<ObjectId>> {
        let value = self
            .db
            .get(ROOT_SNAPSHOT)
            .context("pointer store read failed")?;
        match value {
            Some(bytes) => Ok(Some(ObjectId::from_field(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_root_snapshot(&self, id: &ObjectId) -> Result<()> {
        self.db
            .insert(ROOT_SNAPSHOT, id.as_bytes().as_slice())
            .context("pointer store write failed")?;
        self.db.flush().context("pointer store flush failed")?;
        Ok(())
    }
}
