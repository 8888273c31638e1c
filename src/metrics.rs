//! Raft metrics.
//!
//! The Raft core publishes its observable state on a `watch` channel every
//! time something a client could act on changes: role, term, leader, log
//! tail, commit index or membership. `Wait` turns the channel into awaitable
//! conditions, which is also how the integration tests observe a cluster.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::core::State;
use crate::raft::ClusterConfig;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index of the Raft node.
    pub last_log_index: u64,
    /// The index of the last entry executed on the state machine.
    pub commit_index: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub cluster: ClusterConfig,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            current_leader: None,
            cluster: ClusterConfig::default(),
        }
    }
}

/// Error variants related to metrics waiting.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// Wait for a metrics condition to be satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy the given predicate.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(?latest, "wait satisfied: {}", msg);
                return Ok(latest);
            }

            let delay = tokio::time::sleep_until(deadline);
            tokio::select! {
                _ = delay => {
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg, latest)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_log_index` and `commit_index` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.commit_index >= want_log,
            &format!("{} .last_log_index and .commit_index >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for the node to enter the given state.
    pub async fn state(&self, want_state: State, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.state == want_state,
            &format!("{} .state == {:?}", msg, want_state),
        )
        .await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} .current_leader == {}", msg, leader),
        )
        .await
    }
}
