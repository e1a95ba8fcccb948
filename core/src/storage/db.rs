//! # SchemaDb — Embedded Storage Engine
//!
//! Each service owns one `SchemaDb`, a thin wrapper over a sled embedded
//! store. sled organizes data into named "trees" (analogous to tables);
//! each store module opens the trees it owns and nobody else touches them.
//!
//! ## Conventions
//!
//! - Values are `bincode`-encoded structs.
//! - Composite keys join components with a NUL byte. DIDs are validated
//!   NUL-free at construction, so the join is unambiguous.
//! - Timestamps in keys are big-endian u64 milliseconds, so sled's
//!   lexicographic ordering matches time ordering and range scans over
//!   recency windows work naturally.
//!
//! ## Atomicity
//!
//! Multi-tree invariants (one current keypair per author, one active edge
//! per pair) are enforced inside sled transactions; a transaction either
//! lands entirely or not at all. Disjoint-row writers never conflict.

use std::path::Path;

use sled::{Db, Tree};

/// A service's private schema: one sled database, many named trees.
///
/// sled is thread-safe throughout; `SchemaDb` clones share the underlying
/// handle and can be passed around freely behind `Arc` or by value.
#[derive(Debug, Clone)]
pub struct SchemaDb {
    db: Db,
}

impl SchemaDb {
    /// Open or create a schema at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> sled::Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A temporary schema living in memory, cleaned up on drop.
    /// The constructor every test reaches for.
    pub fn open_temporary() -> sled::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Open a named tree. Created on first use.
    pub fn open_tree(&self, name: &str) -> sled::Result<Tree> {
        self.db.open_tree(name)
    }

    /// A monotonically increasing id, unique within this schema. Used to
    /// tiebreak queue entries that fall due in the same millisecond.
    pub fn generate_id(&self) -> sled::Result<u64> {
        self.db.generate_id()
    }

    /// Block until all dirty buffers hit disk. Tests and shutdown paths.
    pub fn flush(&self) -> sled::Result<usize> {
        self.db.flush()
    }
}

/// Join key components with NUL separators.
pub fn composite_key(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum::<usize>() + parts.len().saturating_sub(1);
    let mut key = Vec::with_capacity(len);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Milliseconds since epoch as big-endian bytes, for time-ordered keys.
pub fn millis_be(millis: i64) -> [u8; 8] {
    // Timestamps in this system are post-1970; the cast is lossless.
    (millis as u64).to_be_bytes()
}

/// Inverse of [`millis_be`].
pub fn millis_from_be(bytes: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_are_prefix_scannable() {
        let k1 = composite_key(&[b"did:plc:alice", b"did:plc:bob"]);
        let k2 = composite_key(&[b"did:plc:alice", b"did:plc:carol"]);
        let prefix = composite_key(&[b"did:plc:alice"]);
        assert!(k1.starts_with(&prefix));
        assert!(k2.starts_with(&prefix));
        assert_ne!(k1, k2);
    }

    #[test]
    fn nul_separator_prevents_component_bleed() {
        // ("ab", "c") and ("a", "bc") must produce different keys.
        let k1 = composite_key(&[b"ab", b"c"]);
        let k2 = composite_key(&[b"a", b"bc"]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn millis_ordering_matches_byte_ordering() {
        let early = millis_be(1_000);
        let late = millis_be(2_000_000_000_000);
        assert!(early < late);
        assert_eq!(millis_from_be(&early), Some(1_000));
        assert_eq!(millis_from_be(&late), Some(2_000_000_000_000));
    }

    #[test]
    fn temporary_db_roundtrip() {
        let db = SchemaDb::open_temporary().unwrap();
        let tree = db.open_tree("things").unwrap();
        tree.insert(b"k", b"v").unwrap();
        assert_eq!(tree.get(b"k").unwrap().unwrap().as_ref(), b"v");
    }

    #[test]
    fn generated_ids_increase() {
        let db = SchemaDb::open_temporary().unwrap();
        let a = db.generate_id().unwrap();
        let b = db.generate_id().unwrap();
        assert!(b > a);
    }

    #[test]
    fn on_disk_schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SchemaDb::open(dir.path()).unwrap();
            let tree = db.open_tree("things").unwrap();
            tree.insert(b"k", b"v").unwrap();
            db.flush().unwrap();
        }
        let db = SchemaDb::open(dir.path()).unwrap();
        let tree = db.open_tree("things").unwrap();
        assert_eq!(tree.get(b"k").unwrap().unwrap().as_ref(), b"v");
    }
}
