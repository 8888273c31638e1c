//! Client request handling and the leader's replication driver.

use anyhow::anyhow;

use crate::bus::BusEvent;
use crate::core::LeaderState;
use crate::error::Error;
use crate::error::RaftResult;
use crate::log::AppendRequest;
use crate::quorum;
use crate::raft::AppendEntriesRequest;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Command;
use crate::raft::Entry;
use crate::AppData;
use crate::LogId;
use crate::NodeId;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

/// A client request which has been appended to the local log, awaiting
/// majority commitment before its response can be produced.
pub(super) struct AwaitingCommitted {
    /// The id assigned to the request's entry.
    pub log_id: LogId,
    /// The response channel for the request.
    pub tx: ClientWriteResponseTx,
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> LeaderState<'a, D, N, M, P> {
    /// Handle client write requests.
    ///
    /// The response is produced from `respond_committed` once a majority of
    /// the voting members have stored the entry, never here: executing on
    /// the state machine before majority acknowledgment would let an
    /// uncommitted command become visible.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx) {
        let entry = match self.append_command_to_log(rpc.command) {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };

        self.awaiting_committed.push(AwaitingCommitted {
            log_id: entry.log_id,
            tx,
        });

        if let Err(err) = self.replicate_to_all().await {
            tracing::error!(error=%err, "error replicating client request");
        }
    }

    /// Transform the given command into an entry, assign it an index and the
    /// current term, and append it to the local log.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub(super) fn append_command_to_log(&mut self, command: Command<D>) -> RaftResult<Entry<D>> {
        let last = self.core.last_log_id;
        let entry = Entry {
            log_id: LogId {
                term: self.core.current_term,
                index: last.index + 1,
            },
            command,
        };
        let req = AppendRequest {
            term: self.core.current_term,
            prev_index: last.index,
            prev_term: last.term,
            entries: vec![entry.clone()],
            commit_index: self.core.commit_index,
        };
        self.core.clog.append(req, self.core.commit_index)?;
        self.core.last_log_id = self.core.clog.last()?.log_id;

        // A `Configure` command takes effect as soon as it is appended.
        self.core.refresh_membership()?;
        self.sync_replication_targets();

        self.core.report_metrics();
        Ok(entry)
    }

    /// Send an AppendEntries RPC to every peer, carrying whatever suffix of
    /// the log each one still needs. A caught-up peer receives an empty
    /// payload, which is the heartbeat.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn replicate_to_all(&mut self) -> RaftResult<()> {
        let targets: Vec<NodeId> = self.peer_indexes.keys().cloned().collect();
        for target in targets {
            self.send_append_to(target)?;
        }
        // A cluster whose majority is satisfied locally (single voting
        // member) commits without any responses.
        self.maybe_commit().await
    }

    /// Send one AppendEntries RPC to the target, replacing any in-flight
    /// request to it.
    fn send_append_to(&mut self, target: NodeId) -> RaftResult<()> {
        let next = match self.peer_indexes.get(&target) {
            Some(next) => *next,
            None => return Ok(()),
        };

        let prev_index = next - 1;
        let prev = self
            .core
            .clog
            .get(prev_index)?
            .ok_or_else(|| Error::Internal(anyhow!("no entry at {} for peer {}", prev_index, target)))?;

        let end = std::cmp::min(
            next + self.core.config.max_payload_entries,
            self.core.last_log_id.index + 1,
        );
        let entries = self.core.clog.slice(next, Some(end))?.collect::<RaftResult<Vec<_>>>()?;

        let rpc = AppendEntriesRequest {
            term: self.core.current_term,
            leader_id: self.core.id,
            prev_log_index: prev_index,
            prev_log_term: prev.log_id.term,
            entries,
            commit_index: self.core.commit_index,
        };

        // Stacking requests to a peer could deliver them out of order, so
        // the previous in-flight request is cancelled instead.
        let id = self.core.bus.send_append_entries(target, rpc);
        if let Some(old) = self.peer_outstanding.insert(target, id) {
            self.core.bus.cancel(old);
        }
        Ok(())
    }

    /// Handle a settled bus response while leading.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_bus_event(&mut self, event: BusEvent) -> RaftResult<()> {
        match event {
            BusEvent::AppendEntries {
                id,
                target,
                last_sent,
                result,
            } => {
                if self.peer_outstanding.get(&target) == Some(&id) {
                    self.peer_outstanding.remove(&target);
                }

                let resp = match result {
                    Ok(resp) => resp,
                    Err(err) => {
                        // The peer is unreachable; the next heartbeat retries.
                        tracing::warn!(error=%err, target, "error sending AppendEntries RPC to target");
                        return Ok(());
                    }
                };

                // If a newer term has been returned, revert to follower.
                if resp.term > self.core.current_term {
                    tracing::debug!({ resp.term }, "append entries failed, reverting to follower");
                    return self.core.handle_newer_term(resp.term);
                }

                if resp.success {
                    if let Some(log_id) = last_sent {
                        let next = log_id.index + 1;
                        self.peer_indexes.insert(target, next);
                        self.maybe_commit().await?;
                        // Keep pushing if the peer is still behind.
                        if next <= self.core.last_log_id.index {
                            self.send_append_to(target)?;
                        }
                    }
                    return Ok(());
                }

                // The consistency check failed: probe one index lower and
                // retry. The index-0 sentinel bounds the walk.
                let next = self.peer_indexes.get(&target).cloned().unwrap_or(1);
                let next = std::cmp::max(1, next.saturating_sub(1));
                tracing::debug!(target, next, "AppendEntries rejected, retrying at a lower index");
                self.peer_indexes.insert(target, next);
                self.send_append_to(target)?;
                Ok(())
            }
            // A vote response from an election already won.
            BusEvent::Vote { .. } => Ok(()),
        }
    }

    /// Advance the commit index once a majority of the voting members have
    /// stored entries through it, then execute the newly committed entries
    /// and answer the waiting clients.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn maybe_commit(&mut self) -> RaftResult<()> {
        let voting = self.core.cluster.voting_ids();
        let mut stored: Vec<u64> = Vec::with_capacity(voting.len());
        for id in voting.iter() {
            if *id == self.core.id {
                stored.push(self.core.last_log_id.index);
            } else {
                let next = self.peer_indexes.get(id).cloned().unwrap_or(1);
                stored.push(next.saturating_sub(1));
            }
        }
        if stored.is_empty() {
            return Ok(());
        }

        stored.sort_unstable_by(|a, b| b.cmp(a));
        let majority = quorum::majority_of(stored.len());
        let agreed = stored[majority - 1];

        if agreed > self.core.commit_index {
            tracing::debug!(agreed, "majority replication reached, committing");
            self.core.apply_committed(agreed).await?;
            self.respond_committed();
        }
        Ok(())
    }

    /// Produce responses for every waiting request at or below the commit
    /// index.
    fn respond_committed(&mut self) {
        let commit_index = self.core.commit_index;
        let mut still_waiting = Vec::new();
        for req in self.awaiting_committed.drain(..) {
            if req.log_id.index <= commit_index {
                let _ = req.tx.send(Ok(ClientWriteResponse {
                    leader_id: self.core.id,
                    entry_term: req.log_id.term,
                    entry_index: req.log_id.index,
                }));
            } else {
                still_waiting.push(req);
            }
        }
        self.awaiting_committed = still_waiting;
    }
}
