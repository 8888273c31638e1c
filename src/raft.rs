//! Public Raft interface and data types.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::Error;
use crate::error::RaftResult;
use crate::log::CommandLog;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::props::Properties;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTransport;
use crate::Snapshotter;
use crate::StateMachine;

struct RaftInner<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_m: std::marker::PhantomData<M>,
    marker_p: std::marker::PhantomData<P>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building
/// on top of Raft will use this to spawn a Raft task and interact with the
/// spawned task.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `Error::ShuttingDown`, this indicates
/// that the Raft node is shutting down, and the `shutdown` method should be
/// called on this type to await the shutdown of the node. If the parent
/// application needs to shutdown the Raft node for any reason, calling
/// `shutdown` will do the trick.
pub struct Raft<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> {
    inner: Arc<RaftInner<D, N, M, P>>,
}

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> Raft<D, N, M, P> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within
    /// the cluster. Applications must guarantee that the ID provided to this
    /// function is stable across restarts.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more
    /// details.
    ///
    /// ### `transport`
    /// An implementation of the `RaftTransport` trait which will be used by
    /// Raft for sending RPCs to peer nodes within the cluster.
    ///
    /// ### `clog`
    /// The node's command log, already opened over its backing store. A
    /// fresh node is bootstrapped by opening the log with an initial cluster
    /// config; a node awaiting a snapshot install opens it without one.
    ///
    /// ### `props`
    /// The durable properties store holding the node's hard state. The
    /// spawned task opens it.
    ///
    /// ### `state_machine`
    /// The application state machine which executes committed commands.
    ///
    /// ### `snapshotter`
    /// The snapshot installer to which InstallSnapshot streams are delegated.
    #[tracing::instrument(level="trace", skip(config, transport, clog, props, state_machine, snapshotter), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        transport: Arc<N>,
        clog: CommandLog<D>,
        props: Properties,
        state_machine: Arc<M>,
        snapshotter: Arc<P>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(
            id,
            config,
            transport,
            clog,
            props,
            state_machine,
            snapshotter,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
            marker_p: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries
    /// (§5.3), and are also used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, Error> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| Error::ShuttingDown)?;

        rx.await.map_err(|_| Error::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state
    /// attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, Error> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| Error::ShuttingDown)?;

        rx.await.map_err(|_| Error::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node
    /// or a slow node up-to-speed with the leader (§7). The payload is opaque
    /// to the core and is delegated to the node's snapshotter.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, Error> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| Error::ShuttingDown)?;

        rx.await.map_err(|_| Error::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the metrics system which does a good job at
    /// staying up-to-date. It is perfect for making decisions on where to
    /// route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a mutating client request to Raft to update the state of the
    /// system (§5.1).
    ///
    /// The request's command will be appended to the log, committed to the
    /// cluster, and then applied to the application state machine. The
    /// response is produced only after a majority of the voting members have
    /// stored the entry and it has been executed locally.
    ///
    /// If this node is not the leader, the request fails with
    /// `Error::NotLeader` carrying the best known leader; clients should
    /// retry against it.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse, Error> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        let res = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, span));

        if let Err(err) = res {
            tracing::error!("error when Raft::client_write: send to tx_api: {}", err);
            return Err(Error::ShuttingDown);
        }

        match rx.await {
            Ok(v) => {
                if let Err(ref err) = v {
                    tracing::debug!("error Raft::client_write: {:?}", err);
                }
                v
            }
            Err(err) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", err);
                Err(Error::ShuttingDown)
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use raftlog::State;
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log-3").await?;
    ///
    /// // wait for ever for raft node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, N: RaftTransport<D>, M: StateMachine<D>, P: Snapshotter> Clone for Raft<D, N, M, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, Error>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, Error>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, Error>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, Error>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's command.
    #[serde(bound = "D: AppData")]
    pub command: Command<D>,
}

impl<D: AppData> Entry<D> {
    /// The sentinel entry installing the bootstrap cluster config at index 0.
    ///
    /// Giving every log the same known first entry means the AppendEntries
    /// consistency check never needs a first-entry special case.
    pub fn bootstrap(cluster: ClusterConfig) -> Self {
        Entry {
            log_id: LogId { term: 0, index: 0 },
            command: Command::Configure(ConfigChange {
                cluster,
                prev_config_index: None,
            }),
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.command.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            res.push(x.summary());
        }

        res.join(",")
    }
}

/// A state machine command carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command<D: AppData> {
    /// An application command, opaque to the core; forwarded to the state
    /// machine once committed.
    #[serde(bound = "D: AppData")]
    User(D),
    /// A cluster membership change.
    Configure(ConfigChange),
}

impl<D: AppData> MessageSummary for Command<D> {
    fn summary(&self) -> String {
        match self {
            Command::User(_) => "user".to_string(),
            Command::Configure(change) => {
                format!("configure: {:?}", change.cluster.peers)
            }
        }
    }
}

/// A cluster membership change carried by a `Command::Configure` entry.
///
/// `prev_config_index` points at the previous `Configure` entry, forming a
/// singly-linked chain which can be walked backwards when a truncation has
/// to roll the effective config back. It is filled in by the command log
/// when the entry is persisted; submitters leave it unset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    /// The membership being installed.
    pub cluster: ClusterConfig,
    /// Index of the previous `Configure` entry; absent only at index 0.
    pub prev_config_index: Option<u64>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A member of the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Whether this peer's vote and replication ack count toward majorities.
    /// Demoted peers still receive entries.
    pub voting: bool,
}

/// The membership configuration of the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All members of the Raft cluster.
    pub peers: BTreeMap<NodeId, Peer>,
    /// Index of the log entry which installed this config. Maintained by the
    /// command log.
    pub clog_index: u64,
}

impl ClusterConfig {
    /// Create a new config in which all of the given nodes are voting members.
    pub fn new(voting: BTreeSet<NodeId>) -> Self {
        let peers = voting.into_iter().map(|id| (id, Peer { voting: true })).collect();
        Self { peers, clog_index: 0 }
    }

    /// All member IDs, voting or not.
    pub fn member_ids(&self) -> BTreeSet<NodeId> {
        self.peers.keys().cloned().collect()
    }

    /// The IDs whose votes and acks count toward majorities.
    pub fn voting_ids(&self) -> BTreeSet<NodeId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.voting)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Check if the given node is a member of the cluster.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Check if the given node is a voting member.
    pub fn is_voting(&self, id: &NodeId) -> bool {
        self.peers.get(id).map(|peer| peer.voting).unwrap_or(false)
    }

    /// A copy of this config with the given peer added.
    pub fn with_peer(&self, id: NodeId, voting: bool) -> Self {
        let mut config = self.clone();
        config.peers.insert(id, Peer { voting });
        config
    }

    /// A copy of this config with the given peer's vote removed. The peer
    /// remains a member and keeps receiving entries.
    pub fn with_demoted(&self, id: NodeId) -> Self {
        let mut config = self.clone();
        if let Some(peer) = config.peers.get_mut(&id) {
            peer.voting = false;
        }
        config
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a
/// heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub commit_index: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev={}-{}, commit_index={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.commit_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if the follower contained an entry matching
    /// `prev_log_index` and `prev_log_term`.
    pub success: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update
    /// itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower
/// (§7). The chunk format is opaque to the core; it is handed to the node's
/// snapshotter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The byte offset where this chunk of data is positioned in the
    /// snapshot stream.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,

    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system
/// (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then
/// applied to the Raft state machine according to the Raft protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The command to append to the log.
    #[serde(bound = "D: AppData")]
    pub(crate) command: Command<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.command.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance carrying an application command.
    pub fn new(data: D) -> Self {
        Self {
            command: Command::User(data),
        }
    }

    /// Generate a new payload holding a cluster config change.
    ///
    /// This is how single-server membership changes (add a peer, demote a
    /// peer) enter the system; the log links the change into the config
    /// chain when persisting it.
    pub fn new_configure(cluster: ClusterConfig) -> Self {
        Self {
            command: Command::Configure(ConfigChange {
                cluster,
                prev_config_index: None,
            }),
        }
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The node which processed the request.
    pub leader_id: NodeId,
    /// The term of the successfully committed entry.
    pub entry_term: u64,
    /// The log index of the successfully committed entry.
    pub entry_index: u64,
}
