//! Alignment of two index-sorted entry streams.

use std::iter::Peekable;

use crate::error::RaftResult;
use crate::raft::Entry;
use crate::AppData;

/// Aligns two lazy, finite, index-sorted entry streams into pairs.
///
/// On each step the heads of both streams are compared:
///
/// - equal indexes: both are emitted and both streams advance;
/// - the left head is behind (or the right stream is exhausted): only the
///   left is emitted;
/// - the right head is behind (or the left stream is exhausted): only the
///   right is emitted.
///
/// Upstream errors are surfaced eagerly, as soon as they reach a head.
/// Dropping the iterator releases both cursors.
pub struct Pairs<D, L, R>
where
    D: AppData,
    L: Iterator<Item = RaftResult<Entry<D>>>,
    R: Iterator<Item = RaftResult<Entry<D>>>,
{
    left: Peekable<L>,
    right: Peekable<R>,
}

/// Pair up two index-sorted entry streams.
pub fn pairs<D, L, R>(left: L, right: R) -> Pairs<D, L, R>
where
    D: AppData,
    L: Iterator<Item = RaftResult<Entry<D>>>,
    R: Iterator<Item = RaftResult<Entry<D>>>,
{
    Pairs {
        left: left.peekable(),
        right: right.peekable(),
    }
}

fn take<D, I>(iter: &mut Peekable<I>) -> Option<Entry<D>>
where
    D: AppData,
    I: Iterator<Item = RaftResult<Entry<D>>>,
{
    match iter.next() {
        Some(Ok(entry)) => Some(entry),
        _ => None,
    }
}

impl<D, L, R> Iterator for Pairs<D, L, R>
where
    D: AppData,
    L: Iterator<Item = RaftResult<Entry<D>>>,
    R: Iterator<Item = RaftResult<Entry<D>>>,
{
    type Item = RaftResult<(Option<Entry<D>>, Option<Entry<D>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.left.peek(), Some(Err(_))) {
            if let Some(Err(err)) = self.left.next() {
                return Some(Err(err));
            }
        }
        if matches!(self.right.peek(), Some(Err(_))) {
            if let Some(Err(err)) = self.right.next() {
                return Some(Err(err));
            }
        }

        let left_index = match self.left.peek() {
            Some(Ok(entry)) => Some(entry.log_id.index),
            _ => None,
        };
        let right_index = match self.right.peek() {
            Some(Ok(entry)) => Some(entry.log_id.index),
            _ => None,
        };

        match (left_index, right_index) {
            (None, None) => None,
            (Some(_), None) => Some(Ok((take(&mut self.left), None))),
            (None, Some(_)) => Some(Ok((None, take(&mut self.right)))),
            (Some(l), Some(r)) => {
                if l == r {
                    Some(Ok((take(&mut self.left), take(&mut self.right))))
                } else if l < r {
                    Some(Ok((take(&mut self.left), None)))
                } else {
                    Some(Ok((None, take(&mut self.right))))
                }
            }
        }
    }
}
