//! InstallSnapshot handling.
//!
//! The snapshot wire format and transfer protocol belong to the
//! snapshotter; the core's part is the term bookkeeping and, once the
//! stream completes, reopening the command log over the repopulated
//! backing store.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::Error;
use crate::error::RaftResult;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::AppData;
use crate::MessageSummary;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> RaftCore<D, N, M, P> {
    /// An RPC invoked by the leader to send chunks of a snapshot to a
    /// follower (§7).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If the message's term is behind ours, we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.ticker.reset();

        // Update current term if needed.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state()?;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        self.report_metrics();

        let done = self.snapshotter.install(&req).await.map_err(Error::Internal)?;
        if done {
            // The backing store now holds the snapshot's log; recover from it.
            self.clog.reopen()?;
            self.last_log_id = self.clog.last()?.log_id;
            self.refresh_membership()?;
            self.commit_index = self.state_machine.commit_index().await;
            self.report_metrics();
            tracing::info!(
                id = self.id,
                last_log_index = self.last_log_id.index,
                "snapshot installed, command log reopened"
            );
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }
}
