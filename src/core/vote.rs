//! RequestVote handling and the candidate side of elections.

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> RaftCore<D, N, M, P> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// A vote is granted iff we have not voted in this term and the
    /// candidate's log is at least as up-to-date as ours (§5.4.1). Whenever
    /// the decision changes the hard state — a term advance, a cast vote —
    /// both properties are persisted in one atomic patch before the reply
    /// is produced, so a crash can never forget a vote it handed out.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        // A stale term gets a refusal carrying our term, so the candidate
        // can update itself.
        if req.term < self.current_term {
            tracing::debug!(
                { candidate = req.candidate_id, term = req.term },
                "RequestVote RPC term is less than current term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let mut term_changed = false;
        if req.term > self.current_term {
            term_changed = true;
            self.update_current_term(req.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
        }

        // A repeated request from the candidate we already voted for in
        // this term: re-grant.
        if self.voted_for == Some(req.candidate_id) {
            if term_changed {
                self.save_hard_state()?;
            }
            self.ticker.reset();
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            });
        }

        // Check if the candidate's log is at least as up-to-date as ours.
        let last = self.last_log_id;
        let candidate_is_up_to_date = req.last_log_term > last.term
            || (req.last_log_term == last.term && req.last_log_index >= last.index);

        let grant = self.voted_for.is_none() && candidate_is_up_to_date;
        if grant {
            self.voted_for = Some(req.candidate_id);
        }
        if grant || term_changed {
            self.save_hard_state()?;
            self.report_metrics();
        }
        if grant {
            self.ticker.reset();
        }

        tracing::debug!(
            { candidate = req.candidate_id, term = self.current_term, grant },
            "voted"
        );
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: grant,
        })
    }
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> CandidateState<'a, D, N, M, P> {
    /// Send RequestVote RPCs to all voting peers in parallel.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&mut self) {
        let last = self.core.last_log_id;
        let rpc = VoteRequest::new(self.core.current_term, self.core.id, last.index, last.term);
        for target in self.core.cluster.voting_ids() {
            if target == self.core.id {
                continue;
            }
            self.core.bus.send_vote(target, rpc.clone());
        }
    }

    /// Handle a vote response from a peer.
    #[tracing::instrument(level = "debug", skip(self, resp), fields(peer=target, granted=resp.vote_granted))]
    pub(super) fn handle_vote_response(&mut self, resp: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If the peer is ahead of us, update our term and revert to follower.
        if resp.term > self.core.current_term {
            tracing::debug!(
                { peer = target, term = resp.term },
                "RequestVote RPC response term is greater than current term"
            );
            return self.core.handle_newer_term(resp.term);
        }

        // Votes from an earlier term of ours are stale and do not count.
        if resp.vote_granted && resp.term == self.core.current_term {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(
                    id = self.core.id,
                    term = self.core.current_term,
                    "transitioning to leader state as minimum number of votes have been received"
                );
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }
}
