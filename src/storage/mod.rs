//! The pluggable key/value storage layer.
//!
//! The command log and the properties store are written against the
//! [`KvEngine`] trait; the on-disk engine is a dependency of the embedding
//! application. Only the key/value layout and the batch contract are
//! specified here: a batch is applied atomically, and must be durable by the
//! time `apply` returns. The bundled [`Memory`] engine keeps the same
//! semantics over an ordered map and backs the in-memory command log used by
//! tests and by nodes awaiting a snapshot install.

pub mod key;
pub mod props;

use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::Result;

/// A single atomic set of writes. `None` values are deletions.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    /// Create a new, empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a put to the batch. Later operations on the same key win.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    /// Add a deletion to the batch.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    /// Whether the batch contains any operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch, yielding its operations in insertion order.
    pub fn into_ops(self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.ops
    }
}

/// A boxed, bounded, single-pass scan over key/value pairs in key order.
pub type ScanIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// An ordered key/value storage engine.
///
/// Uses a trait object at the call sites instead of generics, to allow
/// runtime selection of the engine and avoid propagating the type parameter
/// throughout Raft.
pub trait KvEngine: Send + 'static {
    /// Get the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Scan key/value pairs within the given bounds, in key order.
    fn scan(&self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> ScanIter<'_>;

    /// Apply a batch of writes atomically.
    ///
    /// Either all operations in the batch are committed or none are, and the
    /// batch must be durable by the time this returns.
    fn apply(&mut self, batch: WriteBatch) -> Result<()>;
}

/// An in-memory engine over an ordered map.
///
/// Provides no durability across restarts, but honors the same atomicity
/// contract as a durable engine.
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Create a new, empty engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for Memory {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>)) -> ScanIter<'_> {
        Box::new(self.data.range(range).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }

    fn apply(&mut self, batch: WriteBatch) -> Result<()> {
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let mut engine = Memory::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"a".to_vec(), b"2".to_vec());
        batch.put(b"b".to_vec(), b"3".to_vec());
        batch.delete(b"b".to_vec());
        engine.apply(batch).unwrap();

        assert_eq!(engine.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
    }

    #[test]
    fn scan_is_ordered_and_bounded() {
        let mut engine = Memory::new();
        for k in &[b"a", b"b", b"c", b"d"] {
            let mut batch = WriteBatch::new();
            batch.put(k.to_vec(), k.to_vec());
            engine.apply(batch).unwrap();
        }
        let keys: Vec<Vec<u8>> = engine
            .scan((Bound::Included(b"b".to_vec()), Bound::Excluded(b"d".to_vec())))
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
