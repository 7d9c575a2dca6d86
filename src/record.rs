//! # Record Codec
//!
//! Fixed-field binary encoding for the four on-wire record types: directory
//! entries, directories, snapshots, and tags. All multi-byte integers are
//! little-endian; variable-length strings are right-NUL-padded to their field
//! width. The layout must round-trip bit-exact:
//!
//! ```text
//! DirEntry  [mode:2][fname:128][obj_id:32][fsize:4][source:32]  = 198 bytes
//! Dir       DirEntry × N (member entries only; the self-entry is derived)
//! Snapshot  [flag:2][root:32][parent:32] × N  ("0"×32 = no parent)
//! Tag       [ss_id:32][path:256]                               = 288 bytes
//! ```

use crate::error::CodecError;
use crate::hasher::ObjectId;
use byteorder::{ByteOrder, LittleEndian};
use log::warn;
use std::collections::BTreeMap;

/// Mode bit marking an entry as a directory.
pub const DE_ATTR_DIR: u16 = 0x1;

/// Snapshot flag bit marking a snapshot as a retention landmark.
pub const SS_MARKED: u16 = 0x1;

/// Reserved entry name under which a directory describes itself.
pub const SELF_REF: &str = ".";

/// Name of the root directory.
pub const ROOT_DIR: &str = "/";

/// Prefix given to the losing side of a modify/modify conflict.
pub const MODIFY_CONF: &str = "modify.conf.";

/// Prefix given to the tombstone sibling of a delete/modify conflict.
pub const DELETE_CONF: &str = "delete.conf.";

const DE_LEN_MODE: usize = 2;
const DE_LEN_FNAME: usize = 128;
const DE_LEN_FSIZE: usize = 4;

/// Size of an encoded directory entry.
pub const DIR_ENTRY_SIZE: usize =
    DE_LEN_MODE + DE_LEN_FNAME + ObjectId::LEN + DE_LEN_FSIZE + ObjectId::LEN;

const TG_LEN_PNAME: usize = 256;

/// Size of an encoded tag record.
pub const TAG_SIZE: usize = ObjectId::LEN + TG_LEN_PNAME;

/// One directory entry: associates a name with the content-addressed object
/// holding its data, for both files and subdirectories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Access-mode bits; bit 0 marks a directory.
    pub mode: u16,
    /// Entry name (not a path), at most 128 UTF-8 bytes.
    pub fname: String,
    /// Id of the object holding the entry's content.
    pub obj_id: ObjectId,
    /// File size in bytes; directories carry 0.
    pub fsize: u32,
    /// Reserved provenance field.
    pub source: [u8; 32],
}

impl DirEntry {
    pub fn file(fname: impl Into<String>, obj_id: ObjectId, fsize: u32) -> Self {
        DirEntry {
            mode: 0,
            fname: fname.into(),
            obj_id,
            fsize,
            source: [0u8; 32],
        }
    }

    pub fn dir(fname: impl Into<String>, obj_id: ObjectId) -> Self {
        DirEntry {
            mode: DE_ATTR_DIR,
            fname: fname.into(),
            obj_id,
            fsize: 0,
            source: [0u8; 32],
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DE_ATTR_DIR != 0
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let name = self.fname.as_bytes();
        if name.len() > DE_LEN_FNAME {
            return Err(CodecError::NameTooLong(self.fname.clone()));
        }
        let mut mode = [0u8; DE_LEN_MODE];
        LittleEndian::write_u16(&mut mode, self.mode);
        out.extend_from_slice(&mode);
        out.extend_from_slice(name);
        out.extend(std::iter::repeat(0u8).take(DE_LEN_FNAME - name.len()));
        out.extend_from_slice(self.obj_id.as_bytes());
        let mut fsize = [0u8; DE_LEN_FSIZE];
        LittleEndian::write_u32(&mut fsize, self.fsize);
        out.extend_from_slice(&fsize);
        out.extend_from_slice(&self.source);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < DIR_ENTRY_SIZE {
            return Err(CodecError::Truncated {
                need: DIR_ENTRY_SIZE,
                have: data.len(),
            });
        }
        let mode = LittleEndian::read_u16(&data[..DE_LEN_MODE]);
        let name_field = &data[DE_LEN_MODE..DE_LEN_MODE + DE_LEN_FNAME];
        let name_end = name_field
            .iter()
            .rposition(|b| *b != 0 && *b != b'\r' && *b != b'\n')
            .map_or(0, |i| i + 1);
        let fname = std::str::from_utf8(&name_field[..name_end])
            .map_err(|_| CodecError::BadString)?
            .to_string();
        let ofs = DE_LEN_MODE + DE_LEN_FNAME;
        let obj_id = ObjectId::from_field(&data[ofs..ofs + ObjectId::LEN])?;
        let ofs = ofs + ObjectId::LEN;
        let fsize = LittleEndian::read_u32(&data[ofs..ofs + DE_LEN_FSIZE]);
        let ofs = ofs + DE_LEN_FSIZE;
        let mut source = [0u8; 32];
        source.copy_from_slice(&data[ofs..ofs + ObjectId::LEN]);
        Ok(DirEntry {
            mode,
            fname,
            obj_id,
            fsize,
            source,
        })
    }
}

/// A directory: an unordered mapping of entry names to entries, plus a
/// derived self-entry carrying the directory's own name, hash, and mode.
///
/// The self-entry is never serialized; it is reconstructed from parent
/// context on load. The serialized form is the concatenation of the member
/// entries in name order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    self_entry: DirEntry,
    entries: BTreeMap<String, DirEntry>,
}

impl Dir {
    /// Creates an empty directory whose content is the empty payload.
    pub fn empty(name: impl Into<String>) -> Self {
        Dir {
            self_entry: DirEntry::dir(name, ObjectId::empty()),
            entries: BTreeMap::new(),
        }
    }

    pub fn new(self_entry: DirEntry) -> Self {
        Dir {
            self_entry,
            entries: BTreeMap::new(),
        }
    }

    /// Decodes member entries from serialized bytes. A trailing partial
    /// record is discarded with a warning: the format is append-safe but not
    /// self-describing, so the remainder may still be usable.
    pub fn from_bytes(self_entry: DirEntry, data: &[u8]) -> Result<Self, CodecError> {
        let mut usable = data.len();
        if usable % DIR_ENTRY_SIZE != 0 {
            warn!(
                "unrecognized trailing dir entry dropped ({} stray bytes), data may be corrupted",
                usable % DIR_ENTRY_SIZE
            );
            usable -= usable % DIR_ENTRY_SIZE;
        }
        let mut dir = Dir::new(self_entry);
        for chunk in data[..usable].chunks_exact(DIR_ENTRY_SIZE) {
            let entry = DirEntry::decode(chunk)?;
            dir.entries.insert(entry.fname.clone(), entry);
        }
        Ok(dir)
    }

    /// Serializes the member entries, excluding the self-entry.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.entries.len() * DIR_ENTRY_SIZE);
        for entry in self.entries.values() {
            entry.encode_into(&mut out)?;
        }
        Ok(out)
    }

    pub fn self_entry(&self) -> &DirEntry {
        &self.self_entry
    }

    /// Replaces the derived self-entry (used when a directory is reached
    /// through a different parent entry, or after sealing).
    pub fn set_self_entry(&mut self, entry: DirEntry) {
        self.self_entry = entry;
    }

    /// Updates the directory's own id after its serialization was hashed.
    pub fn seal(&mut self, obj_id: ObjectId) {
        self.self_entry.obj_id = obj_id;
    }

    /// Inserts or replaces an entry.
    pub fn add_entry(&mut self, entry: DirEntry) {
        self.entries.insert(entry.fname.clone(), entry);
    }

    pub fn remove_entry(&mut self, fname: &str) -> Option<DirEntry> {
        self.entries.remove(fname)
    }

    pub fn get(&self, fname: &str) -> Option<&DirEntry> {
        self.entries.get(fname)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Compares this directory against an older version of itself.
    ///
    /// Returns `(created, updated, removed)` entries. Subdirectories never
    /// appear in `updated`: a content change inside a subdirectory surfaces
    /// when the traversal descends into it.
    pub fn diff(&self, old: &Dir) -> (Vec<DirEntry>, Vec<DirEntry>, Vec<DirEntry>) {
        let created = self
            .entries
            .values()
            .filter(|e| !old.entries.contains_key(&e.fname))
            .cloned()
            .collect();
        let updated = self
            .entries
            .values()
            .filter(|e| {
                old.entries
                    .get(&e.fname)
                    .is_some_and(|o| o.obj_id != e.obj_id && !o.is_dir())
            })
            .cloned()
            .collect();
        let removed = old
            .entries
            .values()
            .filter(|e| !self.entries.contains_key(&e.fname))
            .cloned()
            .collect();
        (created, updated, removed)
    }
}

/// An immutable snapshot: the root directory id plus zero or more parent
/// snapshot ids. The set of snapshots forms a DAG through `parents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub flag: u16,
    pub root: ObjectId,
    pub parents: Vec<ObjectId>,
}

impl Snapshot {
    pub fn new(root: ObjectId, parents: Vec<ObjectId>) -> Self {
        Snapshot {
            flag: 0,
            root,
            parents,
        }
    }

    /// The synthetic snapshot of an empty repository: empty root, no history.
    pub fn empty() -> Self {
        Snapshot::new(ObjectId::empty(), Vec::new())
    }

    pub fn marked(&self) -> bool {
        self.flag & SS_MARKED != 0
    }

    pub fn mark(&mut self) {
        self.flag |= SS_MARKED;
    }

    /// The root directory expressed as a directory entry named "/".
    pub fn root_entry(&self) -> DirEntry {
        DirEntry::dir(ROOT_DIR, self.root)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + ObjectId::LEN * (1 + self.parents.len().max(1)));
        let mut flag = [0u8; 2];
        LittleEndian::write_u16(&mut flag, self.flag);
        out.extend_from_slice(&flag);
        out.extend_from_slice(self.root.as_bytes());
        if self.parents.is_empty() {
            out.extend_from_slice(ObjectId::NONE.as_bytes());
        } else {
            for parent in &self.parents {
                out.extend_from_slice(parent.as_bytes());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let header = 2 + ObjectId::LEN;
        if data.len() < header {
            return Err(CodecError::Truncated {
                need: header,
                have: data.len(),
            });
        }
        let flag = LittleEndian::read_u16(&data[..2]);
        let root = ObjectId::from_field(&data[2..header])?;
        let mut parents = Vec::new();
        for chunk in data[header..].chunks(ObjectId::LEN) {
            if chunk.len() < ObjectId::LEN {
                return Err(CodecError::Truncated {
                    need: ObjectId::LEN,
                    have: chunk.len(),
                });
            }
            let parent = ObjectId::from_field(chunk)?;
            if parent == ObjectId::NONE {
                break;
            }
            parents.push(parent);
        }
        Ok(Snapshot {
            flag,
            root,
            parents,
        })
    }
}

/// A named pointer at a snapshot and a path inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub ss_id: ObjectId,
    pub path: String,
}

impl Tag {
    pub fn new(ss_id: ObjectId, path: impl Into<String>) -> Self {
        Tag {
            ss_id,
            path: path.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let path = self.path.as_bytes();
        if path.len() > TG_LEN_PNAME {
            return Err(CodecError::NameTooLong(self.path.clone()));
        }
        let mut out = Vec::with_capacity(TAG_SIZE);
        out.extend_from_slice(self.ss_id.as_bytes());
        out.extend_from_slice(path);
        out.extend(std::iter::repeat(0u8).take(TG_LEN_PNAME - path.len()));
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < TAG_SIZE {
            return Err(CodecError::Truncated {
                need: TAG_SIZE,
                have: data.len(),
            });
        }
        let ss_id = ObjectId::from_field(&data[..ObjectId::LEN])?;
        let path_field = &data[ObjectId::LEN..TAG_SIZE];
        let end = path_field
            .iter()
            .rposition(|b| *b != 0 && *b != b'\r' && *b != b'\n')
            .map_or(0, |i| i + 1);
        let path = std::str::from_utf8(&path_field[..end])
            .map_err(|_| CodecError::BadString)?
            .to_string();
        Ok(Tag { ss_id, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(name: &str) -> DirEntry {
        DirEntry::file(name, ObjectId::of(name.as_bytes()), 42)
    }

    #[test]
    fn dir_entry_roundtrip() {
        let entry = sample_entry("report.txt");
        let mut buf = Vec::new();
        entry.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), DIR_ENTRY_SIZE);
        assert_eq!(DirEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn dir_entry_mode_bit() {
        let d = DirEntry::dir("sub", ObjectId::empty());
        assert!(d.is_dir());
        assert!(!sample_entry("f").is_dir());
    }

    #[test]
    fn entry_name_too_long_rejected() {
        let entry = sample_entry(&"x".repeat(129));
        let mut buf = Vec::new();
        assert!(entry.encode_into(&mut buf).is_err());
    }

    #[test]
    fn dir_roundtrip_excludes_self_entry() {
        let mut dir = Dir::empty("/");
        dir.add_entry(sample_entry("a.txt"));
        dir.add_entry(DirEntry::dir("sub", ObjectId::of(b"sub")));

        let bytes = dir.encode().unwrap();
        assert_eq!(bytes.len(), 2 * DIR_ENTRY_SIZE);

        let decoded = Dir::from_bytes(dir.self_entry().clone(), &bytes).unwrap();
        assert_eq!(decoded, dir);
    }

    #[test]
    fn dir_decode_drops_trailing_partial_record() {
        let mut dir = Dir::empty("/");
        dir.add_entry(sample_entry("kept.txt"));
        let mut bytes = dir.encode().unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);

        let decoded = Dir::from_bytes(dir.self_entry().clone(), &bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(decoded.get("kept.txt").is_some());
    }

    #[test]
    fn dir_diff_reports_changes() {
        let mut old = Dir::empty("/");
        old.add_entry(sample_entry("same"));
        old.add_entry(sample_entry("gone"));
        old.add_entry(DirEntry::file("changed", ObjectId::of(b"v0"), 2));
        old.add_entry(DirEntry::dir("subdir", ObjectId::of(b"old-sub")));

        let mut new = Dir::empty("/");
        new.add_entry(sample_entry("same"));
        new.add_entry(sample_entry("fresh"));
        new.add_entry(DirEntry::file("changed", ObjectId::of(b"v1"), 2));
        new.add_entry(DirEntry::dir("subdir", ObjectId::of(b"new-sub")));

        let (created, updated, removed) = new.diff(&old);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].fname, "fresh");
        // Subdirectory id changes are handled by descending, not here.
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].fname, "changed");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].fname, "gone");
    }

    #[test]
    fn snapshot_roundtrip_no_parents() {
        let snap = Snapshot::new(ObjectId::of(b"root"), vec![]);
        let bytes = snap.encode();
        assert_eq!(bytes.len(), 2 + 32 + 32);
        assert_eq!(Snapshot::decode(&bytes).unwrap(), snap);
    }

    #[test]
    fn snapshot_roundtrip_two_parents() {
        let snap = Snapshot::new(
            ObjectId::of(b"root"),
            vec![ObjectId::of(b"p1"), ObjectId::of(b"p2")],
        );
        assert_eq!(Snapshot::decode(&snap.encode()).unwrap(), snap);
    }

    #[test]
    fn snapshot_mark_roundtrips() {
        let mut snap = Snapshot::new(ObjectId::of(b"root"), vec![ObjectId::of(b"p")]);
        snap.mark();
        let decoded = Snapshot::decode(&snap.encode()).unwrap();
        assert!(decoded.marked());
    }

    #[test]
    fn snapshot_decode_rejects_truncation() {
        assert!(Snapshot::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn tag_roundtrip() {
        let tag = Tag::new(ObjectId::of(b"ss"), "/docs/notes");
        let bytes = tag.encode().unwrap();
        assert_eq!(bytes.len(), TAG_SIZE);
        assert_eq!(Tag::decode(&bytes).unwrap(), tag);
    }

    #[test]
    fn tag_path_too_long_rejected() {
        let tag = Tag::new(ObjectId::of(b"ss"), "p".repeat(257));
        assert!(tag.encode().is_err());
    }
}
