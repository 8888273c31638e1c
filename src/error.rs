//! Error types exposed by this crate.

use thiserror::Error;

use crate::NodeId;

/// A result type where the error variant is always a `Error`.
pub type RaftResult<T> = std::result::Result<T, Error>;

/// Errors surfaced by the command log and the Raft role machine.
#[derive(Debug, Error)]
pub enum Error {
    /// A request term is behind ours, or an entry's term exceeds the term of
    /// the request which carried it.
    #[error("invalid term: {0}")]
    InvalidTerm(String),

    /// A non-monotonic entry index, or a commit index ahead of the log tail.
    #[error("invalid index: {0}")]
    InvalidIndex(String),

    /// The log consistency check failed; the caller retries at a lower index.
    #[error("term mismatch: {0}")]
    TermMismatch(String),

    /// A client contacted a node which is not the leader.
    #[error("not the leader, best known leader is {leader_id:?}")]
    NotLeader {
        /// The best known current leader, if any.
        leader_id: Option<NodeId>,
    },

    /// A component was used before its initialization completed.
    #[error("component is not ready")]
    NotReady,

    /// The Raft node is shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,

    /// A backing-store failure, or an attempted truncation at or below the
    /// state machine's commit index. Fatal to the in-flight operation, not
    /// to the node.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// True for the rejections which an AppendEntries sender resolves by
    /// retrying at a lower index, rather than treating as a hard failure.
    pub fn rejects_append(&self) -> bool {
        matches!(self, Error::TermMismatch(_) | Error::InvalidIndex(_))
    }
}
