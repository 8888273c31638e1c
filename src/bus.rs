//! The outbound message bus.
//!
//! Every RPC a node sends goes through here: the bus assigns a message ID,
//! spawns the send as an abortable task with an RPC timeout, and delivers
//! the outcome back into the core's event channel. The core cancels all
//! outstanding messages whenever it changes role; responses that arrive for
//! a cancelled ID fail `settle` and are discarded.
//!
//! Delivery is unordered and lossy. Retries come from the replication
//! driver and the ticker, never from the bus itself.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::AbortHandle;
use futures::future::Abortable;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::LogId;
use crate::NodeId;
use crate::RaftTransport;

/// The identifier of an in-flight outbound message.
pub(crate) type MessageId = u64;

/// The outcome of an outbound RPC, delivered into the core's mailbox.
pub(crate) enum BusEvent {
    AppendEntries {
        id: MessageId,
        target: NodeId,
        /// Log id of the last entry carried by the request, if any.
        last_sent: Option<LogId>,
        result: anyhow::Result<AppendEntriesResponse>,
    },
    Vote {
        id: MessageId,
        target: NodeId,
        result: anyhow::Result<VoteResponse>,
    },
}

impl BusEvent {
    pub(crate) fn id(&self) -> MessageId {
        match self {
            BusEvent::AppendEntries { id, .. } => *id,
            BusEvent::Vote { id, .. } => *id,
        }
    }
}

/// The node's adapter onto the transport.
pub(crate) struct MessageBus<D: AppData, N: RaftTransport<D>> {
    transport: Arc<N>,
    tx_event: mpsc::UnboundedSender<(BusEvent, Span)>,
    rpc_timeout: Duration,
    next_id: MessageId,
    outstanding: HashMap<MessageId, AbortHandle>,
    marker_d: std::marker::PhantomData<D>,
}

impl<D: AppData, N: RaftTransport<D>> MessageBus<D, N> {
    pub(crate) fn new(
        config: &Config,
        transport: Arc<N>,
        tx_event: mpsc::UnboundedSender<(BusEvent, Span)>,
    ) -> Self {
        Self {
            transport,
            tx_event,
            rpc_timeout: Duration::from_millis(config.rpc_timeout),
            next_id: 0,
            outstanding: HashMap::new(),
            marker_d: std::marker::PhantomData,
        }
    }

    /// Send an AppendEntries RPC, tracking it until its response is settled
    /// or it is cancelled.
    pub(crate) fn send_append_entries(&mut self, target: NodeId, rpc: AppendEntriesRequest<D>) -> MessageId {
        let id = self.next_id();
        let last_sent = rpc.entries.last().map(|entry| entry.log_id);
        let transport = self.transport.clone();
        let tx_event = self.tx_event.clone();
        let ttl = self.rpc_timeout;

        let (handle, registration) = AbortHandle::new_pair();
        let task = async move {
            let result = match timeout(ttl, transport.send_append_entries(target, rpc)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("timeout while sending AppendEntries RPC to {}", target)),
            };
            let _ = tx_event.send((
                BusEvent::AppendEntries {
                    id,
                    target,
                    last_sent,
                    result,
                },
                tracing::debug_span!("CH"),
            ));
        };
        tokio::spawn(Abortable::new(task, registration).instrument(tracing::debug_span!("spawn")));

        self.outstanding.insert(id, handle);
        id
    }

    /// Send a RequestVote RPC, tracking it until its response is settled or
    /// it is cancelled.
    pub(crate) fn send_vote(&mut self, target: NodeId, rpc: VoteRequest) -> MessageId {
        let id = self.next_id();
        let transport = self.transport.clone();
        let tx_event = self.tx_event.clone();
        let ttl = self.rpc_timeout;

        let (handle, registration) = AbortHandle::new_pair();
        let task = async move {
            let result = match timeout(ttl, transport.send_vote(target, rpc)).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("timeout while sending RequestVote RPC to {}", target)),
            };
            let _ = tx_event.send((BusEvent::Vote { id, target, result }, tracing::debug_span!("CH")));
        };
        tokio::spawn(Abortable::new(task, registration).instrument(tracing::debug_span!("spawn")));

        self.outstanding.insert(id, handle);
        id
    }

    /// Mark a response as received. False when the message was already
    /// cancelled, in which case the response must be discarded.
    pub(crate) fn settle(&mut self, id: MessageId) -> bool {
        self.outstanding.remove(&id).is_some()
    }

    /// Cancel a single outstanding message.
    pub(crate) fn cancel(&mut self, id: MessageId) {
        if let Some(handle) = self.outstanding.remove(&id) {
            handle.abort();
        }
    }

    /// Cancel every outstanding message. Invoked on every role transition.
    pub(crate) fn cancel_all(&mut self) {
        if !self.outstanding.is_empty() {
            tracing::debug!(count = self.outstanding.len(), "cancelling outstanding messages");
        }
        for (_, handle) in self.outstanding.drain() {
            handle.abort();
        }
    }

    fn next_id(&mut self) -> MessageId {
        self.next_id += 1;
        self.next_id
    }
}
