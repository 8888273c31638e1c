//! Key encoding for the storage layer.
//!
//! Two keyspaces share one ordered byte space: named internal properties and
//! log entries. Internal properties sort strictly below every log key, and
//! log keys sort by numeric index (fixed-width big-endian), so a range scan
//! over the log tag yields exactly the log in index order.

use std::ops::Bound;

use anyhow::bail;
use anyhow::Result;

const INTERNAL_TAG: u8 = 0x00;
const LOG_TAG: u8 = 0x01;

/// A storage key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    /// A named internal property.
    InternalProperty(String),
    /// A log entry, keyed by index.
    Log(u64),
}

impl Key {
    /// Encode the key into its byte form. Total and injective: distinct keys
    /// always encode to distinct byte strings.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::InternalProperty(name) => {
                let mut buf = Vec::with_capacity(1 + name.len());
                buf.push(INTERNAL_TAG);
                buf.extend_from_slice(name.as_bytes());
                buf
            }
            Key::Log(index) => {
                let mut buf = Vec::with_capacity(9);
                buf.push(LOG_TAG);
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }
        }
    }

    /// Decode a key from its byte form.
    pub fn decode(bytes: &[u8]) -> Result<Key> {
        match bytes.split_first() {
            Some((&INTERNAL_TAG, name)) => Ok(Key::InternalProperty(String::from_utf8(name.to_vec())?)),
            Some((&LOG_TAG, index)) => {
                if index.len() != 8 {
                    bail!("log key has {} index bytes, expected 8", index.len());
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(index);
                Ok(Key::Log(u64::from_be_bytes(buf)))
            }
            Some((tag, _)) => bail!("unknown key tag {:#04x}", tag),
            None => bail!("empty key"),
        }
    }
}

/// Bounds covering log entries with `start <= index < end`, or through the
/// end of the log keyspace when `end` is `None`.
pub fn log_range(start: u64, end: Option<u64>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let from = Bound::Included(Key::Log(start).encode());
    let to = match end {
        Some(end) => Bound::Excluded(Key::Log(end).encode()),
        None => Bound::Included(Key::Log(u64::MAX).encode()),
    };
    (from, to)
}
