//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod snapshot;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Span;
use tracing_futures::Instrument;

use crate::bus::BusEvent;
use crate::bus::MessageBus;
use crate::bus::MessageId;
use crate::config::Config;
use crate::core::client::AwaitingCommitted;
use crate::error::Error;
use crate::error::RaftResult;
use crate::log::CommandLog;
use crate::metrics::RaftMetrics;
use crate::quorum;
use crate::raft::ClientWriteResponseTx;
use crate::raft::ClusterConfig;
use crate::raft::RaftMsg;
use crate::storage::props::Patch;
use crate::storage::props::Properties;
use crate::storage::props::CURRENT_TERM;
use crate::storage::props::VOTED_FOR;
use crate::ticker::Ticker;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

/// The core type implementing the Raft protocol.
///
/// A single task owns this value and processes one event at a time: an
/// inbound RPC, a client request, a tick, or a bus response. That is the
/// serialization which keeps term and vote updates linearized.
pub struct RaftCore<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration, mirrored from the
    /// command log (which owns the authoritative copy).
    cluster: ClusterConfig,
    /// The node's command log.
    clog: CommandLog<D>,
    /// The durable properties store holding `current_term` and `voted_for`.
    props: Properties,
    /// The application state machine.
    state_machine: Arc<M>,
    /// The snapshot installer.
    snapshotter: Arc<P>,

    /// The target state of the system.
    target_state: State,

    /// The index of the last entry executed on the state machine. Mirrors
    /// the state machine's own commit index for metrics and replication.
    commit_index: u64,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This
    /// is normally based on the leader's term which is communicated to other
    /// members via the AppendEntries protocol, but this may also be
    /// incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the
    /// current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction
    /// on votes.
    voted_for: Option<NodeId>,

    /// The id of the last entry to be appended to the log.
    last_log_id: LogId,

    /// The countdown driving elections and heartbeats.
    ticker: Ticker,
    /// The wall-clock interval which advances the ticker.
    tick_timer: Interval,

    /// The outbound message bus.
    bus: MessageBus<D, N>,
    /// Responses to outbound messages.
    rx_bus: mpsc::UnboundedReceiver<(BusEvent, Span)>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> RaftCore<D, N, M, P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        transport: Arc<N>,
        clog: CommandLog<D>,
        props: Properties,
        state_machine: Arc<M>,
        snapshotter: Arc<P>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_bus, rx_bus) = mpsc::unbounded_channel();
        let bus = MessageBus::new(&config, transport, tx_bus);
        let ticker = Ticker::new(&config);
        let tick_timer = interval(Duration::from_millis(config.tick_interval));
        let this = Self {
            id,
            config,
            cluster: ClusterConfig::default(),
            clog,
            props,
            state_machine,
            snapshotter,
            target_state: State::Follower,
            commit_index: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId { term: 0, index: 0 },
            ticker,
            tick_timer,
            bus,
            rx_bus,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        self.props.open()?;
        self.current_term = self.props.get(CURRENT_TERM)?.unwrap_or(0);
        self.voted_for = self.props.get::<Option<NodeId>>(VOTED_FOR)?.unwrap_or(None);

        match self.clog.last() {
            Ok(last) => {
                self.last_log_id = last.log_id;
                self.cluster = self.clog.cluster_config()?;
            }
            // A log awaiting a snapshot install; the node idles as a
            // follower until the leader streams one over.
            Err(Error::NotReady) => (),
            Err(err) => return Err(err),
        }
        self.commit_index = self.state_machine.commit_index().await;

        self.target_state = State::Follower;
        self.ticker.reset();

        tracing::debug!(
            term = self.current_term,
            last_log_index = self.last_log_id.index,
            "id={} target_state: {:?}",
            self.id,
            self.target_state
        );

        // This is the central loop of the system. The Raft core assumes a
        // few different roles based on cluster state. It delegates control
        // to the different state controllers and simply awaits the delegated
        // loop to return, which only takes place on an error or on a state
        // change.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
            cluster: self.cluster.clone(),
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the node's current hard state, atomically.
    #[tracing::instrument(level = "trace", skip(self))]
    fn save_hard_state(&mut self) -> RaftResult<()> {
        let patch = Patch::new()
            .set(CURRENT_TERM, &self.current_term)?
            .set(VOTED_FOR, &self.voted_for)?;
        self.props.write(patch)
    }

    /// Update core's target state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        tracing::debug!(id = self.id, ?target_state, "setting target state");
        self.target_state = target_state;
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as the
    /// `voted_for` state must be reset whenever the term advances.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Observe a newer term in any message: persist the advance and demote
    /// to follower.
    #[tracing::instrument(level = "debug", skip(self))]
    fn handle_newer_term(&mut self, term: u64) -> RaftResult<()> {
        self.update_current_term(term, None);
        self.update_current_leader(UpdateCurrentLeader::Unknown);
        self.save_hard_state()?;
        self.set_target_state(State::Follower);
        self.report_metrics();
        Ok(())
    }

    /// Execute committed entries up to `upto` on the state machine, in
    /// order, and advance the commit index mirror.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn apply_committed(&mut self, upto: u64) -> RaftResult<()> {
        let sm_commit = self.state_machine.commit_index().await;
        let upto = std::cmp::min(upto, self.last_log_id.index);
        if upto <= sm_commit {
            self.commit_index = sm_commit;
            return Ok(());
        }

        let entries = self
            .clog
            .slice(sm_commit + 1, Some(upto + 1))?
            .collect::<RaftResult<Vec<_>>>()?;
        self.state_machine.execute(&entries).await.map_err(Error::Internal)?;

        self.commit_index = upto;
        self.report_metrics();
        Ok(())
    }

    /// Reject a client write due to this node not being the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_write_request(&self, tx: ClientWriteResponseTx) {
        let _ = tx.send(Err(Error::NotLeader {
            leader_id: self.current_leader,
        }));
    }

    /// Settle a bus response against the outstanding set; returns the event
    /// only if it was still expected.
    fn settle_bus_event(&mut self, event: BusEvent) -> Option<BusEvent> {
        if self.bus.settle(event.id()) {
            Some(event)
        } else {
            tracing::trace!(id = event.id(), "discarding response to a cancelled message");
            None
        }
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    pub(super) core: &'a mut RaftCore<D, N, M, P>,
    /// The next log index to send to each peer. Non-voting peers are
    /// replicated to as well; only voting peers count toward commitment.
    pub(super) peer_indexes: BTreeMap<NodeId, u64>,
    /// The in-flight AppendEntries message per peer, so that a new send
    /// replaces (cancels) the previous one instead of stacking behind it.
    pub(super) peer_outstanding: BTreeMap<NodeId, MessageId>,
    /// Client requests which have been appended locally and are awaiting to
    /// be committed to the cluster.
    pub(super) awaiting_committed: Vec<AwaitingCommitted>,
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> LeaderState<'a, D, N, M, P> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, N, M, P>) -> Self {
        Self {
            core,
            peer_indexes: BTreeMap::new(),
            peer_outstanding: BTreeMap::new(),
            awaiting_committed: Vec::new(),
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.bus.cancel_all();

        let next = self.core.last_log_id.index + 1;
        for id in self.core.cluster.member_ids() {
            if id != self.core.id {
                self.peer_indexes.insert(id, next);
            }
        }

        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.ticker.reset_leader();
        self.core.report_metrics();

        // An initial round of heartbeats announces the new leader.
        if let Err(err) = self.replicate_to_all().await {
            tracing::error!(error=%err, "error sending initial heartbeats");
        }

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);
                self.core.bus.cancel_all();
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                _ = self.core.tick_timer.tick() => {
                    if self.core.ticker.tick() {
                        // A replication failure aborts the round, not the
                        // node; the next heartbeat retries.
                        if let Err(err) = self.replicate_to_all().await {
                            tracing::error!(error=%err, "error replicating to peers");
                        }
                        self.core.ticker.reset_leader();
                    }
                }
                Some((event, span)) = self.core.rx_bus.recv() => {
                    let _ent = span.enter();
                    if let Some(event) = self.core.settle_bus_event(event) {
                        if let Err(err) = self.handle_bus_event(event).await {
                            tracing::error!(error=%err, "error handling replication response");
                        }
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            tracing::info!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            tracing::info!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc));
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            tracing::info!("leader recv from rx_api: InstallSnapshot, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { rpc, tx } => {
                            tracing::info!("leader recv from rx_api: ClientWriteRequest, {}", rpc.summary());
                            self.handle_client_write_request(rpc, tx).await;
                        }
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    core: &'a mut RaftCore<D, N, M, P>,
    /// The number of votes which have been granted by voting peers.
    votes_granted: u64,
    /// The number of votes needed in order to become the Raft leader.
    votes_needed: u64,
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> CandidateState<'a, D, N, M, P> {
    pub(self) fn new(core: &'a mut RaftCore<D, N, M, P>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            self.core.bus.cancel_all();

            let voting = self.core.cluster.voting_ids();
            if !voting.contains(&self.core.id) {
                // A non-voting member can never win; wait for a leader.
                tracing::debug!(id = self.core.id, "non-voting member, abandoning candidacy");
                self.core.ticker.reset();
                self.core.set_target_state(State::Follower);
                return Ok(());
            }

            // Setup initial state per term.
            self.votes_granted = 1; // We must vote for ourselves per the Raft spec.
            self.votes_needed = quorum::majority_of(voting.len()) as u64;

            // Setup new term.
            self.core.ticker.reset();
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            if let Err(err) = self.core.save_hard_state() {
                // Campaigning without a persisted vote could double-vote
                // after a crash; stand down instead.
                tracing::error!(error=%err, "error persisting hard state, abandoning campaign");
                self.core.set_target_state(State::Follower);
                return Ok(());
            }
            self.core.report_metrics();
            tracing::info!(id = self.core.id, term = self.core.current_term, "campaigning");

            // Send RPCs to all voting members in parallel.
            self.spawn_parallel_vote_requests();
            // A single-voter cluster elects itself.
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    _ = self.core.tick_timer.tick() => {
                        if self.core.ticker.tick() {
                            // This election has timed-out. Break to outer
                            // loop, which starts a new term.
                            break;
                        }
                    }
                    Some((event, span)) = self.core.rx_bus.recv() => {
                        let _ent = span.enter();
                        if let Some(event) = self.core.settle_bus_event(event) {
                            if let Err(err) = self.handle_bus_event(event) {
                                tracing::error!(error=%err, "error handling vote response");
                            }
                        }
                    }
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc));
                            }
                            RaftMsg::InstallSnapshot { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest { tx, .. } => {
                                self.core.forward_client_write_request(tx);
                            }
                        }
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }

    /// Handle a bus response while campaigning.
    fn handle_bus_event(&mut self, event: BusEvent) -> RaftResult<()> {
        match event {
            BusEvent::Vote { target, result, .. } => {
                let resp = match result {
                    Ok(resp) => resp,
                    Err(err) => {
                        tracing::warn!(error=%err, target, "error sending RequestVote RPC to target");
                        return Ok(());
                    }
                };
                self.handle_vote_response(resp, target)
            }
            // Replication traffic from an earlier leadership of ours; the
            // response is stale by definition.
            BusEvent::AppendEntries { .. } => Ok(()),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    core: &'a mut RaftCore<D, N, M, P>,
}

impl<'a, D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> FollowerState<'a, D, N, M, P> {
    pub(self) fn new(core: &'a mut RaftCore<D, N, M, P>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.bus.cancel_all();
        self.core.report_metrics();

        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                _ = self.core.tick_timer.tick() => {
                    // If the election timeout is hit, transition to candidate.
                    if self.core.ticker.tick() {
                        self.core.set_target_state(State::Candidate);
                    }
                }
                Some((event, span)) = self.core.rx_bus.recv() => {
                    let _ent = span.enter();
                    // Followers have no outstanding messages; anything
                    // arriving here was cancelled on the role change.
                    let _ = self.core.settle_bus_event(event);
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc));
                        }
                        RaftMsg::InstallSnapshot { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest { tx, .. } => {
                            self.core.forward_client_write_request(tx);
                        }
                    }
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}
