//! AppendEntries handling on the receiving side.

use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::Error;
use crate::error::RaftResult;
use crate::log::AppendRequest;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::AppData;
use crate::MessageSummary;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> RaftCore<D, N, M, P> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also
    /// used as a heartbeat (§5.2).
    ///
    /// A rejected consistency check is not an error: the reply carries
    /// `success = false` and the leader retries at a lower index. Everything
    /// else — a log invariant violation, a storage failure — surfaces to
    /// the sender as an error.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If the message's term is behind ours, we do not honor the request.
        if req.term < self.current_term {
            tracing::debug!(
                { self.current_term, rpc_term = req.term },
                "AppendEntries RPC term is less than current term"
            );
            return Err(Error::InvalidTerm(format!(
                "request term {} is behind local term {}",
                req.term, self.current_term
            )));
        }

        // Update current term if needed.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state()?;
        }

        // A valid request always identifies the leader for this term.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }

        // If not follower, become follower: there is a live leader.
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        self.ticker.reset();
        self.report_metrics();

        let commit_index = req.commit_index;
        let sm_commit = self.state_machine.commit_index().await;
        let append = AppendRequest {
            term: req.term,
            prev_index: req.prev_log_index,
            prev_term: req.prev_log_term,
            entries: req.entries,
            commit_index,
        };
        match self.clog.append(append, sm_commit) {
            Ok(()) => (),
            Err(err) if err.rejects_append() => {
                tracing::debug!(error=%err, "rejecting AppendEntries");
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                });
            }
            Err(err) => return Err(err),
        }

        self.last_log_id = self.clog.last()?.log_id;
        self.refresh_membership()?;

        // Hand newly committed entries to the state machine, in order.
        if commit_index > sm_commit {
            self.apply_committed(commit_index).await?;
        }
        self.report_metrics();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
        })
    }
}
