//! Durable storage for small named properties.
//!
//! The Raft core keeps its hard state here: the current term and the vote
//! cast in it. Both are written in one atomic patch so that a crash can
//! never observe a term advance without the matching vote reset.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::error::RaftResult;
use crate::storage::key::Key;
use crate::storage::KvEngine;
use crate::storage::WriteBatch;

/// Property name for the last recorded term observed by this node.
pub const CURRENT_TERM: &str = "current_term";
/// Property name for the ID of the node voted for in the current term.
pub const VOTED_FOR: &str = "voted_for";

/// An atomic set of property updates. All entries in a patch are committed
/// together or not at all.
#[derive(Debug, Default)]
pub struct Patch {
    ops: Vec<(String, Vec<u8>)>,
}

impl Patch {
    /// Create a new, empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property update to the patch.
    pub fn set<V: Serialize>(mut self, name: &str, value: &V) -> RaftResult<Self> {
        let encoded = bincode::serialize(value).map_err(|err| Error::Internal(err.into()))?;
        self.ops.push((name.to_string(), encoded));
        Ok(self)
    }
}

/// A durable store of small named values over a key/value engine.
///
/// Ready-after-open: every operation fails with `NotReady` until `open` has
/// been called.
pub struct Properties {
    engine: Box<dyn KvEngine>,
    ready: bool,
}

impl Properties {
    /// Create a store over the given engine. The store is not usable until
    /// `open` is called.
    pub fn new(engine: Box<dyn KvEngine>) -> Self {
        Self { engine, ready: false }
    }

    /// Signal readiness. Probes the engine so that an unusable backing store
    /// is reported here rather than on first use.
    pub fn open(&mut self) -> RaftResult<()> {
        self.engine
            .get(&Key::InternalProperty(CURRENT_TERM.to_string()).encode())
            .map_err(Error::Internal)?;
        self.ready = true;
        Ok(())
    }

    /// Apply all updates in the patch as one atomic durable batch.
    pub fn write(&mut self, patch: Patch) -> RaftResult<()> {
        self.check_ready()?;
        let mut batch = WriteBatch::new();
        for (name, value) in patch.ops {
            batch.put(Key::InternalProperty(name).encode(), value);
        }
        self.engine.apply(batch).map_err(Error::Internal)
    }

    /// Read a property, if present.
    pub fn get<V: DeserializeOwned>(&self, name: &str) -> RaftResult<Option<V>> {
        self.check_ready()?;
        let raw = self
            .engine
            .get(&Key::InternalProperty(name.to_string()).encode())
            .map_err(Error::Internal)?;
        raw.map(|v| bincode::deserialize(&v))
            .transpose()
            .map_err(|err| Error::Internal(err.into()))
    }

    /// Remove a property.
    pub fn delete(&mut self, name: &str) -> RaftResult<()> {
        self.check_ready()?;
        let mut batch = WriteBatch::new();
        batch.delete(Key::InternalProperty(name.to_string()).encode());
        self.engine.apply(batch).map_err(Error::Internal)
    }

    fn check_ready(&self) -> RaftResult<()> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;
    use crate::NodeId;

    fn store() -> Properties {
        let mut props = Properties::new(Box::new(Memory::new()));
        props.open().unwrap();
        props
    }

    #[test]
    fn not_ready_until_open() {
        let mut props = Properties::new(Box::new(Memory::new()));
        assert!(matches!(props.get::<u64>(CURRENT_TERM), Err(Error::NotReady)));
        assert!(matches!(props.write(Patch::new()), Err(Error::NotReady)));
        assert!(matches!(props.delete(CURRENT_TERM), Err(Error::NotReady)));

        props.open().unwrap();
        assert_eq!(props.get::<u64>(CURRENT_TERM).unwrap(), None);
    }

    #[test]
    fn patch_writes_all_keys() {
        let mut props = store();
        let patch = Patch::new()
            .set(CURRENT_TERM, &7u64)
            .unwrap()
            .set(VOTED_FOR, &Some(2 as NodeId))
            .unwrap();
        props.write(patch).unwrap();

        assert_eq!(props.get::<u64>(CURRENT_TERM).unwrap(), Some(7));
        assert_eq!(props.get::<Option<NodeId>>(VOTED_FOR).unwrap(), Some(Some(2)));
    }

    #[test]
    fn delete_removes_value() {
        let mut props = store();
        props.write(Patch::new().set("scratch", &1u64).unwrap()).unwrap();
        props.delete("scratch").unwrap();
        assert_eq!(props.get::<u64>("scratch").unwrap(), None);
    }
}
