//! Membership bookkeeping.
//!
//! Membership changes travel through the log as `Configure` commands, so
//! the log owns the authoritative config; the core keeps a mirror for
//! majority arithmetic and metrics, and the leader keeps its replication
//! targets aligned with it. A change takes effect as soon as its entry is
//! appended; a truncation can roll it back, which reaches the mirror
//! through the same refresh.

use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::AppData;
use crate::NodeId;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> RaftCore<D, N, M, P> {
    /// Re-read the membership mirror from the command log.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn refresh_membership(&mut self) -> RaftResult<()> {
        let cluster = self.clog.cluster_config()?;
        if cluster != self.cluster {
            tracing::info!(
                id = self.id,
                clog_index = cluster.clog_index,
                voting = ?cluster.voting_ids(),
                "membership changed"
            );
            self.cluster = cluster;
            self.report_metrics();
        }
        Ok(())
    }
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> LeaderState<'a, D, N, M, P> {
    /// Align the replication targets with the current membership.
    ///
    /// New members start at the tail and are walked backwards by the
    /// consistency check. Demoted members keep their stream; they still
    /// receive entries, their acks just stop counting. Members removed from
    /// the config lose their stream.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn sync_replication_targets(&mut self) {
        let next = self.core.last_log_id.index + 1;
        let members = self.core.cluster.member_ids();

        for id in members.iter() {
            if *id != self.core.id {
                self.peer_indexes.entry(*id).or_insert(next);
            }
        }

        let stale: Vec<NodeId> = self
            .peer_indexes
            .keys()
            .filter(|id| !members.contains(id))
            .cloned()
            .collect();
        for id in stale {
            tracing::debug!(peer = id, "removing replication target no longer in the cluster");
            self.peer_indexes.remove(&id);
            if let Some(msg) = self.peer_outstanding.remove(&id) {
                self.core.bus.cancel(msg);
            }
        }
    }
}
