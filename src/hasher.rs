//! # Content Hashing
//!
//! Uses BLAKE3 for fast, cryptographically secure content hashing. The digest
//! is truncated to 128 bits and hex-encoded, filling the fixed 32-byte id
//! fields of the on-wire records. Two payloads with identical decorated bytes
//! produce the same id and are stored only once.

use crate::error::CodecError;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// A content-addressed object id: 32 lowercase hex characters.
///
/// This is the key type everywhere — blobs, directories, snapshots, and
/// snapshot parents are all named by their `ObjectId`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Width of the id in bytes, as stored in fixed record fields.
    pub const LEN: usize = 32;

    /// Sentinel written in place of a parent id when a snapshot has none.
    pub const NONE: ObjectId = ObjectId([b'0'; 32]);

    /// Computes the id of an in-memory payload.
    pub fn of(data: &[u8]) -> ObjectId {
        let hex = blake3::hash(data).to_hex();
        let mut id = [0u8; 32];
        id.copy_from_slice(&hex.as_bytes()[..Self::LEN]);
        ObjectId(id)
    }

    /// The id of the empty payload. Every store/retrieve path short-circuits
    /// on this value without performing I/O.
    pub fn empty() -> ObjectId {
        static EMPTY: OnceLock<ObjectId> = OnceLock::new();
        *EMPTY.get_or_init(|| ObjectId::of(b""))
    }

    /// True if this id names the empty payload.
    pub fn is_empty_object(&self) -> bool {
        *self == ObjectId::empty()
    }

    /// Parses an id from a fixed 32-byte record field.
    pub fn from_field(bytes: &[u8]) -> Result<ObjectId, CodecError> {
        if bytes.len() != Self::LEN {
            return Err(CodecError::BadId(String::from_utf8_lossy(bytes).into()));
        }
        if !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(CodecError::BadId(String::from_utf8_lossy(bytes).into()));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(bytes);
        Ok(ObjectId(id))
    }

    /// The raw 32 hex bytes, ready for a record field.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Always ASCII hex by construction.
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// Returns the first `n` characters of the id for display purposes.
    pub fn short(&self, n: usize) -> &str {
        &self.as_str()[..n.min(Self::LEN)]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.as_str())
    }
}

impl FromStr for ObjectId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_field(s.as_bytes())
    }
}
