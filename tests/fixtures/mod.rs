//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

use raftlog::async_trait::async_trait;
use raftlog::error::Error;
use raftlog::log::CommandLog;
use raftlog::raft::AppendEntriesRequest;
use raftlog::raft::AppendEntriesResponse;
use raftlog::raft::ClientWriteRequest;
use raftlog::raft::ClientWriteResponse;
use raftlog::raft::ClusterConfig;
use raftlog::raft::Command;
use raftlog::raft::Entry;
use raftlog::raft::InstallSnapshotRequest;
use raftlog::raft::VoteRequest;
use raftlog::raft::VoteResponse;
use raftlog::storage::props::Properties;
use raftlog::storage::Memory;
use raftlog::AppData;
use raftlog::Config;
use raftlog::NodeId;
use raftlog::Raft;
use raftlog::RaftMetrics;
use raftlog::RaftTransport;
use raftlog::Snapshotter;
use raftlog::State;
use raftlog::StateMachine;

/// The application command used by the test cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: String,
    pub serial: u64,
    pub payload: String,
}

impl AppData for ClientRequest {}

/// An in-memory state machine which records the payloads it executes.
pub struct MemStateMachine {
    inner: RwLock<SmInner>,
}

#[derive(Default)]
struct SmInner {
    commit_index: u64,
    data: Vec<String>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SmInner::default()),
        }
    }

    /// All executed payloads, in execution order.
    pub async fn data(&self) -> Vec<String> {
        self.inner.read().await.data.clone()
    }

    pub async fn contains(&self, payload: &str) -> bool {
        self.inner.read().await.data.iter().any(|p| p == payload)
    }
}

#[async_trait]
impl StateMachine<ClientRequest> for MemStateMachine {
    async fn commit_index(&self) -> u64 {
        self.inner.read().await.commit_index
    }

    async fn execute(&self, entries: &[Entry<ClientRequest>]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            if let Command::User(req) = &entry.command {
                inner.data.push(req.payload.clone());
            }
            inner.commit_index = entry.log_id.index;
        }
        Ok(())
    }
}

/// A snapshotter for clusters which never fall far enough behind to need one.
pub struct NoopSnapshotter;

#[async_trait]
impl Snapshotter for NoopSnapshotter {
    async fn install(&self, _rpc: &InstallSnapshotRequest) -> Result<bool> {
        Ok(true)
    }
}

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<ClientRequest, RaftRouter, MemStateMachine, NoopSnapshotter>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config with timings suitable for in-process clusters.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .tick_interval(100)
            .tick_min(5)
            .tick_max(10)
            .rpc_timeout(100)
            .validate()
            .expect("failed to build Raft config"),
    )
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the
/// `RaftTransport` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStateMachine>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new Raft node bearing the given ID, with its
    /// log bootstrapped to the given membership.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, members: BTreeSet<NodeId>) {
        let cluster = ClusterConfig::new(members);
        let clog = CommandLog::open(Box::new(Memory::new()), Some(cluster)).expect("failed to open command log");
        let props = Properties::new(Box::new(Memory::new()));
        let sm = Arc::new(MemStateMachine::new());
        let node = Raft::new(
            id,
            self.config.clone(),
            self.clone(),
            clog,
            props,
            sm.clone(),
            Arc::new(NoopSnapshotter),
        );
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sm));
    }

    /// Create a cluster in which every node carries the same bootstrap
    /// membership.
    pub async fn new_cluster(self: &Arc<Self>, members: BTreeSet<NodeId>) {
        for id in members.iter() {
            self.new_raft_node(*id, members.clone()).await;
        }
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the state machine of the target node.
    pub async fn get_sm_handle(&self, node_id: &NodeId) -> Result<Arc<MemStateMachine>> {
        let rt = self.routing_table.read().await;
        let addr = rt
            .get(node_id)
            .with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.1.clone())
    }

    /// Get the ID of the node which currently believes itself leader and is
    /// not isolated, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.state == State::Leader && node.current_leader == Some(node.id) {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// Wait until some non-isolated node reports itself leader.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_any_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for metrics on the target node until they satisfy some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &NodeId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        let wait = node.0.wait(timeout);
        drop(rt);
        let rst = wait.metrics(func, msg).await?;
        Ok(rst)
    }

    /// Wait for the specified nodes until they have stored and applied logs
    /// up to `want_log` (inclusive).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<u64>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait_for_metrics(
                i,
                |m| m.last_log_index >= want_log && m.commit_index >= want_log,
                timeout,
                msg,
            )
            .await?;
        }
        Ok(())
    }

    /// Wait for the specified nodes until their state becomes `state`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<u64>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for i in node_ids.iter() {
            self.wait_for_metrics(i, |m| m.state == want_state, timeout, msg).await?;
        }
        Ok(())
    }

    /// Request the current leader from the target node.
    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let rt = self.routing_table.read().await;
        let node = rt
            .get(&target)
            .unwrap_or_else(|| panic!("node with ID {} does not exist", target));
        node.0.current_leader().await
    }

    /// Send a client request to the target node.
    pub async fn client_request(
        &self,
        target: NodeId,
        client_id: &str,
        serial: u64,
        payload: &str,
    ) -> std::result::Result<ClientWriteResponse, Error> {
        let req = ClientRequest {
            client: client_id.into(),
            serial,
            payload: payload.into(),
        };
        let rt = self.routing_table.read().await;
        let node = rt
            .get(&target)
            .unwrap_or_else(|| panic!("node '{}' does not exist in routing table", target));
        let node = node.0.clone();
        drop(rt);
        node.client_write(ClientWriteRequest::new(req)).await
    }

    /// Send a cluster config change to the target node.
    pub async fn change_config(
        &self,
        target: NodeId,
        cluster: ClusterConfig,
    ) -> std::result::Result<ClientWriteResponse, Error> {
        let rt = self.routing_table.read().await;
        let node = rt
            .get(&target)
            .unwrap_or_else(|| panic!("node '{}' does not exist in routing table", target));
        let node = node.0.clone();
        drop(rt);
        node.client_write(ClientWriteRequest::new_configure(cluster)).await
    }

    /// Assert that all non-isolated nodes agree on the given leader and term.
    pub async fn assert_stable_cluster(&self, leader: NodeId, term: u64) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        for node in nodes.iter().filter(|node| !isolated.contains(&node.id)) {
            assert_eq!(
                node.current_leader,
                Some(leader),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader
            );
            assert_eq!(
                node.current_term, term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, term
            );
            if node.id == leader {
                assert_eq!(node.state, State::Leader, "node {} is not the leader", node.id);
            } else {
                assert_eq!(
                    node.state,
                    State::Follower,
                    "node {} is in state {:?}, expected Follower",
                    node.id,
                    node.state
                );
            }
        }
    }
}

#[async_trait]
impl RaftTransport<ClientRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self,
        target: u64,
        rpc: AppendEntriesRequest<ClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = addr.0.clone();
        drop(isolated);
        drop(rt);

        let resp = node.append_entries(rpc).await;
        tracing::debug!("append_entries: recv resp from id={} {:?}", target, resp);
        Ok(resp?)
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let node = addr.0.clone();
        drop(isolated);
        drop(rt);

        Ok(node.vote(rpc).await?)
    }
}
