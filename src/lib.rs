//! A Raft consensus node core built around a replicated command log.
//!
//! The crate is split along the two subsystems that carry the interesting
//! invariants:
//!
//! - [`log::CommandLog`] — the ordered log of commands, stored in a pluggable
//!   key/value engine together with the chain of cluster-config entries that
//!   makes truncation under membership churn safe.
//! - [`raft::Raft`] — the role state machine (follower/candidate/leader)
//!   which drives elections, replication and commitment. A single task owns
//!   all of a node's state and drains one mailbox, so term and vote updates
//!   are linearized by construction.
//!
//! The state machine executing committed commands, the transport carrying
//! RPC envelopes, and the snapshot installer are external collaborators,
//! abstracted behind the [`StateMachine`], [`RaftTransport`] and
//! [`Snapshotter`] traits.

mod bus;
mod config;
mod core;
pub mod error;
pub mod log;
pub mod metrics;
mod quorum;
pub mod raft;
pub mod storage;
mod ticker;

use std::fmt;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::core::State;
pub use crate::error::Error;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::raft::Raft;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;

/// A Raft node's ID.
pub type NodeId = u64;

/// The identity of a log entry: the term it was created in and its position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait defining application specific data carried by `Command::User`.
///
/// The intention of this trait is that applications which are using this crate
/// will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// passes through Raft.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The user-supplied state machine which executes committed commands.
///
/// Entries are delivered in index order with no gaps, starting at
/// `commit_index + 1`. The implementation is expected to advance its
/// commit index as part of `execute`.
#[async_trait::async_trait]
pub trait StateMachine<D: AppData>: Send + Sync + 'static {
    /// The index of the last entry this state machine has executed.
    async fn commit_index(&self) -> u64;

    /// Execute the given committed entries, in order.
    async fn execute(&self, entries: &[Entry<D>]) -> anyhow::Result<()>;
}

/// The transport used to exchange RPC envelopes with peer nodes.
///
/// Delivery is unordered and may drop messages; the replication driver and
/// the ticker provide the retries.
#[async_trait::async_trait]
pub trait RaftTransport<D: AppData>: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> anyhow::Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
}

/// Consumes snapshot streams on behalf of the command log.
///
/// The snapshot wire format is opaque to the core. Once `install` reports
/// that the stream is complete, the core reopens the command log over the
/// repopulated backing store.
#[async_trait::async_trait]
pub trait Snapshotter: Send + Sync + 'static {
    /// Accept one chunk of an incoming snapshot. Returns `true` once the
    /// snapshot has been fully installed into the log's backing store.
    async fn install(&self, rpc: &InstallSnapshotRequest) -> anyhow::Result<bool>;
}

/// A trait for summarizing a message for logging purposes.
pub trait MessageSummary {
    /// Return a brief string summary of the message.
    fn summary(&self) -> String;
}
