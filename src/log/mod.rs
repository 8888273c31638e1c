//! The replicated command log.
//!
//! The log stores a dense sequence of commands, keyed by index in a
//! key/value engine, along with two internal properties: the index of the
//! last appended entry and the index of the latest `Configure` entry. The
//! `Configure` entries form a backward chain (via `prev_config_index`) which
//! is walked when a truncation removes the entry that installed the current
//! membership.
//!
//! In the steady state the log is append-only: the leader appends client
//! commands and followers copy them via AppendEntries. Uncommitted entries
//! on a diverged follower are replaced when a new leader presents a
//! conflicting entry at the same index; entries at or below the state
//! machine's commit index are never touched.
//!
//! The log has the following invariants:
//!
//! * Entry indexes are contiguous starting at 0 (the bootstrap sentinel).
//! * Entry terms never decrease from the previous entry.
//! * Entry terms are at or below the term of the request that carried them.
//! * Appended entries are durable before the append is acknowledged.
//! * `cluster_config_index` is the largest index whose entry is a
//!   `Configure`, and its chain of `prev_config_index` links reaches
//!   index 0.

pub mod pairs;

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::error::RaftResult;
use crate::raft::ClusterConfig;
use crate::raft::Command;
use crate::raft::Entry;
use crate::storage::key;
use crate::storage::key::Key;
use crate::storage::KvEngine;
use crate::storage::ScanIter;
use crate::storage::WriteBatch;
use crate::AppData;

/// Internal property holding the index of the last appended entry.
pub const LAST_LOG_INDEX: &str = "last_log_index";
/// Internal property holding the index of the latest `Configure` entry.
pub const CLUSTER_CONFIG_INDEX: &str = "cluster_config_index";

/// An append request against the log.
///
/// `prev_index`/`prev_term` identify the entry the sender believes
/// immediately precedes `entries`; the append fails with `TermMismatch` if
/// the local log disagrees, which is how divergence is detected.
#[derive(Clone, Debug)]
pub struct AppendRequest<D: AppData> {
    /// Term of the request which produced these entries.
    pub term: u64,
    /// Index of the entry immediately preceding `entries`.
    pub prev_index: u64,
    /// Term of the entry at `prev_index`.
    pub prev_term: u64,
    /// The entries to store, with contiguous indexes from `prev_index + 1`.
    pub entries: Vec<Entry<D>>,
    /// The sender's commit index. Must not exceed the resulting log tail.
    pub commit_index: u64,
}

struct LogState<D: AppData> {
    last_entry: Entry<D>,
    next_index: u64,
    cluster_config: ClusterConfig,
    cluster_config_index: u64,
}

/// Writes planned by the pair-walk, applied afterwards in index order.
struct Plan<D: AppData> {
    writes: Vec<Entry<D>>,
    deletes: Vec<u64>,
    config_rollback: Option<(u64, ClusterConfig)>,
}

/// The replicated command log over a key/value engine.
///
/// Opens in one of three modes:
///
/// 1. Fresh with a bootstrap config: the index-0 sentinel `Configure` entry
///    is written atomically with the log's internal properties.
/// 2. Fresh without a bootstrap config: the log stays empty and every
///    operation fails with `NotReady` until a snapshot install populates
///    the backing store and `reopen` is called.
/// 3. Existing state: the tail and the cluster config are recovered from
///    the internal properties.
///
/// Every mutation is a single atomic batch, durable before the call
/// returns, so a failure mid-append leaves the log at the last successfully
/// committed entry.
pub struct CommandLog<D: AppData> {
    engine: Option<Box<dyn KvEngine>>,
    state: Option<LogState<D>>,
}

impl<D: AppData> CommandLog<D> {
    /// Open a log over the given engine, bootstrapping it with the given
    /// cluster config if the engine holds no existing state.
    pub fn open(engine: Box<dyn KvEngine>, bootstrap: Option<ClusterConfig>) -> RaftResult<Self> {
        let mut log = CommandLog { engine: Some(engine), state: None };
        let existing: Option<u64> = log.read_property(LAST_LOG_INDEX)?;
        match (existing, bootstrap) {
            // Existing state always wins over a bootstrap config.
            (Some(_), _) => log.recover()?,
            (None, Some(cluster)) => log.bootstrap(cluster)?,
            (None, None) => (),
        }
        Ok(log)
    }

    /// Re-run recovery after the backing store was repopulated externally,
    /// which is how a snapshot install hands control back to the log.
    pub fn reopen(&mut self) -> RaftResult<()> {
        self.recover()
    }

    /// Release the backing store, returning it to the caller. Idempotent:
    /// later calls return `None` and all other operations fail `NotReady`.
    pub fn close(&mut self) -> Option<Box<dyn KvEngine>> {
        self.state = None;
        self.engine.take()
    }

    /// A snapshot of the last entry (the index-0 sentinel on a freshly
    /// bootstrapped log).
    pub fn last(&self) -> RaftResult<Entry<D>> {
        Ok(self.state()?.last_entry.clone())
    }

    /// The membership installed by the latest `Configure` entry.
    pub fn cluster_config(&self) -> RaftResult<ClusterConfig> {
        Ok(self.state()?.cluster_config.clone())
    }

    /// The index of the latest `Configure` entry.
    pub fn cluster_config_index(&self) -> RaftResult<u64> {
        Ok(self.state()?.cluster_config_index)
    }

    /// Fetch the entry at `index`, or `None` beyond the tail.
    pub fn get(&self, index: u64) -> RaftResult<Option<Entry<D>>> {
        let state = self.state()?;
        if index > state.last_entry.log_id.index {
            return Ok(None);
        }
        self.read_entry(index)
    }

    /// A lazy, bounded, single-pass sequence of the entries with
    /// `start <= index < end`, clamped to the log tail. `None` means "to the
    /// end of the log"; an empty range yields an empty sequence.
    pub fn slice(&self, start: u64, end: Option<u64>) -> RaftResult<Slice<'_, D>> {
        let state = self.state()?;
        let cap = state.last_entry.log_id.index + 1;
        let end = match end {
            Some(end) => std::cmp::min(end, cap),
            None => cap,
        };
        if end <= start {
            return Ok(Slice { inner: None, marker: std::marker::PhantomData });
        }
        let engine = self.engine()?;
        Ok(Slice {
            inner: Some(engine.scan(key::log_range(start, Some(end)))),
            marker: std::marker::PhantomData,
        })
    }

    /// Append entries, overwriting a diverged tail when necessary.
    ///
    /// `commit_floor` is the state machine's commit index; a truncation at
    /// or below it fails with `Internal` before anything is written.
    #[tracing::instrument(level="debug", skip(self, req), fields(term=req.term, prev_index=req.prev_index, entries=req.entries.len()))]
    pub fn append(&mut self, req: AppendRequest<D>, commit_floor: u64) -> RaftResult<()> {
        let next_index = self.state()?.next_index;

        // Consistency check: the entry at prev_index must carry prev_term.
        let prev = self
            .get(req.prev_index)?
            .ok_or_else(|| Error::TermMismatch(format!("no entry at {}", req.prev_index)))?;
        if prev.log_id.term != req.prev_term {
            return Err(Error::TermMismatch(format!(
                "entry at {} has term {}, expected {}",
                req.prev_index, prev.log_id.term, req.prev_term
            )));
        }

        let plan = self.plan_writes(&req, commit_floor, next_index)?;
        self.apply_plan(plan)?;

        // The sender must not advance its commit past our tail.
        let last = self.state()?.last_entry.log_id;
        if req.commit_index > last.index {
            return Err(Error::InvalidIndex(format!(
                "commit index {} is ahead of last entry {}",
                req.commit_index, last.index
            )));
        }
        Ok(())
    }

    /// Walk the incoming entries against the existing slice
    /// `[prev_index + 1, next_index)`, validating invariants and deciding
    /// which entries to write, before any mutation happens.
    fn plan_writes(&self, req: &AppendRequest<D>, commit_floor: u64, next_index: u64) -> RaftResult<Plan<D>> {
        let state = self.state()?;
        let mut plan = Plan {
            writes: Vec::new(),
            deletes: Vec::new(),
            config_rollback: None,
        };
        let mut truncated = false;
        let mut expected = req.prev_index + 1;
        let mut prev_term = req.prev_term;
        let mut chain_index = state.cluster_config_index;

        let incoming = req.entries.iter().cloned().map(Ok);
        let existing = self.slice(req.prev_index + 1, Some(next_index))?;

        for pair in pairs::pairs(incoming, existing) {
            let (incoming, existing) = pair?;
            match (incoming, existing) {
                (Some(entry), existing) => {
                    if entry.log_id.index != expected {
                        return Err(Error::InvalidIndex(format!(
                            "expected index {}, got {}",
                            expected, entry.log_id.index
                        )));
                    }
                    if entry.log_id.term < prev_term {
                        return Err(Error::InvalidTerm(format!(
                            "term regressed from {} to {} at index {}",
                            prev_term, entry.log_id.term, entry.log_id.index
                        )));
                    }
                    if entry.log_id.term > req.term {
                        return Err(Error::InvalidTerm(format!(
                            "entry term {} exceeds request term {}",
                            entry.log_id.term, req.term
                        )));
                    }
                    expected += 1;
                    prev_term = entry.log_id.term;

                    match existing {
                        Some(ref current) if !truncated && current.log_id.term == entry.log_id.term => {
                            // Already present; skip the write.
                        }
                        Some(_) if !truncated => {
                            // Conflicting term: the tail from here on is
                            // replaced. Never below the commit index.
                            if commit_floor >= entry.log_id.index {
                                return Err(Error::Internal(anyhow!(
                                    "refusing to truncate at {}, commit index is {}",
                                    entry.log_id.index,
                                    commit_floor
                                )));
                            }
                            // Roll the effective config back below the
                            // truncation point along the chain.
                            let mut rollback = None;
                            while entry.log_id.index <= chain_index {
                                let (prev_index, prev_config) = self.config_chain_prev(chain_index)?;
                                chain_index = prev_index;
                                rollback = Some((prev_index, prev_config));
                            }
                            plan.config_rollback = rollback;
                            truncated = true;
                            tracing::debug!(index = entry.log_id.index, "log truncated");
                            plan.writes.push(entry);
                        }
                        // Past the truncation point everything is rewritten.
                        Some(_) => plan.writes.push(entry),
                        None => plan.writes.push(entry),
                    }
                }
                (None, Some(stale)) => {
                    // The request ended below our tail. After a truncation
                    // the remainder is garbage; otherwise it is a still
                    // valid suffix and stays untouched.
                    if truncated {
                        plan.deletes.push(stale.log_id.index);
                    }
                }
                (None, None) => {}
            }
        }

        Ok(plan)
    }

    /// Apply the planned writes, one durable batch per entry, in index
    /// order. In-memory state advances only after each batch commits.
    fn apply_plan(&mut self, mut plan: Plan<D>) -> RaftResult<()> {
        let mut rollback = plan.config_rollback.take();

        for mut entry in plan.writes {
            let mut batch = WriteBatch::new();

            let chain_head = match &rollback {
                Some((index, _)) => *index,
                None => self.state()?.cluster_config_index,
            };

            let mut adopt = rollback.take();
            if let Command::Configure(change) = &mut entry.command {
                if entry.log_id.index > chain_head {
                    change.prev_config_index = Some(chain_head);
                    change.cluster.clog_index = entry.log_id.index;
                    adopt = Some((entry.log_id.index, change.cluster.clone()));
                }
            }
            if let Some((index, _)) = &adopt {
                batch.put(
                    Key::InternalProperty(CLUSTER_CONFIG_INDEX.to_string()).encode(),
                    encode_value(index)?,
                );
            }

            batch.put(Key::Log(entry.log_id.index).encode(), encode_value(&entry)?);
            batch.put(
                Key::InternalProperty(LAST_LOG_INDEX.to_string()).encode(),
                encode_value(&entry.log_id.index)?,
            );
            self.engine_mut()?.apply(batch).map_err(Error::Internal)?;

            let state = match self.state.as_mut() {
                Some(state) => state,
                None => return Err(Error::NotReady),
            };
            state.next_index = entry.log_id.index + 1;
            state.last_entry = entry;
            if let Some((index, config)) = adopt {
                state.cluster_config_index = index;
                state.cluster_config = config;
            }
        }

        if !plan.deletes.is_empty() {
            let mut batch = WriteBatch::new();
            for index in plan.deletes {
                batch.delete(Key::Log(index).encode());
            }
            self.engine_mut()?.apply(batch).map_err(Error::Internal)?;
        }

        Ok(())
    }

    /// Step one link back along the `Configure` chain from `index`.
    fn config_chain_prev(&self, index: u64) -> RaftResult<(u64, ClusterConfig)> {
        let entry = self
            .read_entry(index)?
            .ok_or_else(|| Error::Internal(anyhow!("no entry at config index {}", index)))?;
        let change = match entry.command {
            Command::Configure(change) => change,
            _ => return Err(Error::Internal(anyhow!("entry at {} is not a cluster config", index))),
        };
        let prev_index = change
            .prev_config_index
            .ok_or_else(|| Error::Internal(anyhow!("config chain ends at {}", index)))?;
        let prev = self
            .read_entry(prev_index)?
            .ok_or_else(|| Error::Internal(anyhow!("no entry at config index {}", prev_index)))?;
        match prev.command {
            Command::Configure(change) => Ok((prev_index, change.cluster)),
            _ => Err(Error::Internal(anyhow!("entry at {} is not a cluster config", prev_index))),
        }
    }

    fn bootstrap(&mut self, mut cluster: ClusterConfig) -> RaftResult<()> {
        cluster.clog_index = 0;
        let entry = Entry::bootstrap(cluster.clone());

        let mut batch = WriteBatch::new();
        batch.put(Key::Log(0).encode(), encode_value(&entry)?);
        batch.put(
            Key::InternalProperty(LAST_LOG_INDEX.to_string()).encode(),
            encode_value(&0u64)?,
        );
        batch.put(
            Key::InternalProperty(CLUSTER_CONFIG_INDEX.to_string()).encode(),
            encode_value(&0u64)?,
        );
        self.engine_mut()?.apply(batch).map_err(Error::Internal)?;

        tracing::debug!(peers = ?cluster.peers.keys(), "bootstrapped command log");
        self.state = Some(LogState {
            last_entry: entry,
            next_index: 1,
            cluster_config: cluster,
            cluster_config_index: 0,
        });
        Ok(())
    }

    fn recover(&mut self) -> RaftResult<()> {
        let last_index: u64 = self
            .read_property(LAST_LOG_INDEX)?
            .ok_or_else(|| Error::Internal(anyhow!("backing store has no {}", LAST_LOG_INDEX)))?;
        let last_entry = self
            .read_entry(last_index)?
            .ok_or_else(|| Error::Internal(anyhow!("no entry at last index {}", last_index)))?;

        let cached: Option<u64> = self.read_property(CLUSTER_CONFIG_INDEX)?;
        let (cluster_config_index, cluster_config) = self.recover_cluster_config(cached, &last_entry)?;

        tracing::debug!(
            last_index,
            cluster_config_index,
            "recovered command log from existing state"
        );
        self.state = Some(LogState {
            next_index: last_index + 1,
            last_entry,
            cluster_config,
            cluster_config_index,
        });
        Ok(())
    }

    /// The chain is authoritative; the top-level property is a cache for
    /// fast open. It is verified against the entry it points at, and on a
    /// mismatch the config is rebuilt by scanning backward from the tail.
    fn recover_cluster_config(
        &self,
        cached: Option<u64>,
        last_entry: &Entry<D>,
    ) -> RaftResult<(u64, ClusterConfig)> {
        if let Some(index) = cached {
            if index <= last_entry.log_id.index {
                if let Some(entry) = self.read_entry(index)? {
                    if let Command::Configure(change) = entry.command {
                        return Ok((index, change.cluster));
                    }
                }
            }
            tracing::warn!(index, "cluster config cache is stale, rebuilding from the tail");
        }

        let mut index = last_entry.log_id.index;
        loop {
            let entry = self
                .read_entry(index)?
                .ok_or_else(|| Error::Internal(anyhow!("log has a gap at {}", index)))?;
            if let Command::Configure(change) = entry.command {
                return Ok((index, change.cluster));
            }
            if index == 0 {
                return Err(Error::Internal(anyhow!("no cluster config found in log")));
            }
            index -= 1;
        }
    }

    fn read_entry(&self, index: u64) -> RaftResult<Option<Entry<D>>> {
        let engine = self.engine()?;
        engine
            .get(&Key::Log(index).encode())
            .map_err(Error::Internal)?
            .map(|raw| decode_value(&raw))
            .transpose()
    }

    fn read_property<V: DeserializeOwned>(&self, name: &str) -> RaftResult<Option<V>> {
        let engine = self.engine()?;
        engine
            .get(&Key::InternalProperty(name.to_string()).encode())
            .map_err(Error::Internal)?
            .map(|raw| decode_value(&raw))
            .transpose()
    }

    fn engine(&self) -> RaftResult<&dyn KvEngine> {
        match &self.engine {
            Some(engine) => Ok(engine.as_ref()),
            None => Err(Error::NotReady),
        }
    }

    fn engine_mut(&mut self) -> RaftResult<&mut Box<dyn KvEngine>> {
        match &mut self.engine {
            Some(engine) => Ok(engine),
            None => Err(Error::NotReady),
        }
    }

    fn state(&self) -> RaftResult<&LogState<D>> {
        self.state.as_ref().ok_or(Error::NotReady)
    }
}

/// A bounded, single-pass iterator over log entries.
pub struct Slice<'a, D: AppData> {
    inner: Option<ScanIter<'a>>,
    marker: std::marker::PhantomData<D>,
}

impl<'a, D: AppData> Iterator for Slice<'a, D> {
    type Item = RaftResult<Entry<D>>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        match inner.next() {
            Some(Ok((_, value))) => Some(decode_value(&value)),
            Some(Err(err)) => Some(Err(Error::Internal(err))),
            None => None,
        }
    }
}

fn encode_value<V: Serialize>(value: &V) -> RaftResult<Vec<u8>> {
    bincode::serialize(value).map_err(|err| Error::Internal(err.into()))
}

fn decode_value<V: DeserializeOwned>(raw: &[u8]) -> RaftResult<V> {
    bincode::deserialize(raw).map_err(|err| Error::Internal(err.into()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde::Deserialize;
    use serde::Serialize;

    use super::*;
    use crate::raft::ConfigChange;
    use crate::storage::Memory;
    use crate::LogId;
    use crate::NodeId;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct TestData(String);
    impl AppData for TestData {}

    type TestLog = CommandLog<TestData>;

    fn members(ids: &[NodeId]) -> ClusterConfig {
        ClusterConfig::new(ids.iter().cloned().collect::<BTreeSet<_>>())
    }

    fn open_log() -> TestLog {
        CommandLog::open(Box::new(Memory::new()), Some(members(&[1, 2, 3]))).unwrap()
    }

    fn user_entry(term: u64, index: u64) -> Entry<TestData> {
        Entry {
            log_id: LogId { term, index },
            command: Command::User(TestData(format!("cmd-{}", index))),
        }
    }

    fn config_entry(term: u64, index: u64, config: ClusterConfig) -> Entry<TestData> {
        Entry {
            log_id: LogId { term, index },
            command: Command::Configure(ConfigChange {
                cluster: config,
                prev_config_index: None,
            }),
        }
    }

    fn append(log: &mut TestLog, term: u64, prev: LogId, entries: Vec<Entry<TestData>>) -> RaftResult<()> {
        log.append(
            AppendRequest {
                term,
                prev_index: prev.index,
                prev_term: prev.term,
                entries,
                commit_index: 0,
            },
            0,
        )
    }

    fn collect(log: &TestLog, start: u64, end: Option<u64>) -> Vec<LogId> {
        log.slice(start, end)
            .unwrap()
            .map(|r| r.map(|e| e.log_id))
            .collect::<RaftResult<_>>()
            .unwrap()
    }

    #[test]
    fn bootstrap_writes_sentinel() {
        let log = open_log();
        let last = log.last().unwrap();
        assert_eq!(last.log_id, LogId { term: 0, index: 0 });
        assert!(matches!(last.command, Command::Configure(_)));
        assert_eq!(log.cluster_config_index().unwrap(), 0);
        assert_eq!(log.cluster_config().unwrap().voting_ids(), members(&[1, 2, 3]).voting_ids());
        assert_eq!(collect(&log, 0, None).len(), 1);
    }

    #[test]
    fn fresh_without_bootstrap_is_not_ready() {
        let mut log: TestLog = CommandLog::open(Box::new(Memory::new()), None).unwrap();
        assert!(matches!(log.last(), Err(Error::NotReady)));
        let res = append(&mut log, 1, LogId { term: 0, index: 0 }, vec![user_entry(1, 1)]);
        assert!(matches!(res, Err(Error::NotReady)));
    }

    #[test]
    fn append_extends_the_tail() {
        let mut log = open_log();
        let entries: Vec<_> = (1..=10).map(|i| user_entry(1, i)).collect();
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();

        assert_eq!(log.last().unwrap().log_id, LogId { term: 1, index: 10 });
        let got = collect(&log, 0, None);
        assert_eq!(got.len(), 11);
        // Contiguous from 0, nondecreasing terms.
        for (i, log_id) in got.iter().enumerate() {
            assert_eq!(log_id.index, i as u64);
        }
        assert!(got.windows(2).all(|w| w[0].term <= w[1].term));
    }

    #[test]
    fn reopen_recovers_identical_state() {
        let mut log = open_log();
        let entries: Vec<_> = (1..=10).map(|i| user_entry(1, i)).collect();
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();
        let config = log.cluster_config().unwrap();

        let engine = log.close().unwrap();
        assert!(log.close().is_none());

        let log: TestLog = CommandLog::open(engine, None).unwrap();
        assert_eq!(log.last().unwrap().log_id, LogId { term: 1, index: 10 });
        assert_eq!(log.cluster_config().unwrap(), config);
        assert_eq!(log.cluster_config_index().unwrap(), 0);
        assert_eq!(collect(&log, 0, None).len(), 11);
    }

    #[test]
    fn open_ignores_bootstrap_when_state_exists() {
        let mut log = open_log();
        append(&mut log, 1, LogId { term: 0, index: 0 }, vec![user_entry(1, 1)]).unwrap();
        let engine = log.close().unwrap();

        let log: TestLog = CommandLog::open(engine, Some(members(&[7, 8]))).unwrap();
        assert_eq!(log.cluster_config().unwrap().voting_ids(), members(&[1, 2, 3]).voting_ids());
        assert_eq!(log.last().unwrap().log_id, LogId { term: 1, index: 1 });
    }

    #[test]
    fn consistency_check_rejects_unknown_prev() {
        let mut log = open_log();
        let res = append(&mut log, 1, LogId { term: 0, index: 5 }, vec![user_entry(1, 6)]);
        assert!(matches!(res, Err(Error::TermMismatch(_))));

        let res = append(&mut log, 1, LogId { term: 9, index: 0 }, vec![user_entry(1, 1)]);
        assert!(matches!(res, Err(Error::TermMismatch(_))));
        assert_eq!(log.last().unwrap().log_id.index, 0);
    }

    #[test]
    fn validation_rejects_gaps_and_term_regressions() {
        let mut log = open_log();

        let res = append(&mut log, 1, LogId { term: 0, index: 0 }, vec![user_entry(1, 2)]);
        assert!(matches!(res, Err(Error::InvalidIndex(_))));

        let res = append(
            &mut log,
            2,
            LogId { term: 0, index: 0 },
            vec![user_entry(2, 1), user_entry(1, 2)],
        );
        assert!(matches!(res, Err(Error::InvalidTerm(_))));

        let res = append(&mut log, 1, LogId { term: 0, index: 0 }, vec![user_entry(2, 1)]);
        assert!(matches!(res, Err(Error::InvalidTerm(_))));

        // Nothing may have been written by the rejected requests.
        assert_eq!(log.last().unwrap().log_id.index, 0);
        assert_eq!(collect(&log, 0, None).len(), 1);
    }

    #[test]
    fn reappending_existing_entries_is_a_noop() {
        let mut log = open_log();
        let entries: Vec<_> = (1..=3).map(|i| user_entry(1, i)).collect();
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries.clone()).unwrap();
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();

        assert_eq!(log.last().unwrap().log_id, LogId { term: 1, index: 3 });
        assert_eq!(collect(&log, 0, None).len(), 4);
    }

    #[test]
    fn truncation_rewrites_conflicting_tail() {
        let mut log = open_log();
        append(
            &mut log,
            1,
            LogId { term: 0, index: 0 },
            vec![user_entry(1, 1), user_entry(1, 2)],
        )
        .unwrap();

        append(
            &mut log,
            2,
            LogId { term: 0, index: 0 },
            vec![user_entry(2, 1), user_entry(2, 2)],
        )
        .unwrap();

        let got = collect(&log, 0, None);
        assert_eq!(
            got,
            vec![
                LogId { term: 0, index: 0 },
                LogId { term: 2, index: 1 },
                LogId { term: 2, index: 2 },
            ]
        );
    }

    #[test]
    fn truncation_drops_the_stale_suffix() {
        let mut log = open_log();
        append(
            &mut log,
            1,
            LogId { term: 0, index: 0 },
            (1..=3).map(|i| user_entry(1, i)).collect(),
        )
        .unwrap();

        append(&mut log, 2, LogId { term: 0, index: 0 }, vec![user_entry(2, 1)]).unwrap();

        assert_eq!(log.last().unwrap().log_id, LogId { term: 2, index: 1 });
        assert_eq!(collect(&log, 0, None).len(), 2);
        assert_eq!(log.get(2).unwrap(), None);

        // Recovery sees the shortened log.
        let engine = log.close().unwrap();
        let log: TestLog = CommandLog::open(engine, None).unwrap();
        assert_eq!(log.last().unwrap().log_id, LogId { term: 2, index: 1 });
    }

    #[test]
    fn truncation_below_commit_fails_without_mutation() {
        let mut log = open_log();
        append(
            &mut log,
            1,
            LogId { term: 0, index: 0 },
            vec![user_entry(1, 1), user_entry(1, 2)],
        )
        .unwrap();

        let res = log.append(
            AppendRequest {
                term: 2,
                prev_index: 0,
                prev_term: 0,
                entries: vec![user_entry(2, 1), user_entry(2, 2)],
                commit_index: 0,
            },
            1,
        );
        assert!(matches!(res, Err(Error::Internal(_))));

        // The log must be untouched.
        let got = collect(&log, 0, None);
        assert_eq!(
            got,
            vec![
                LogId { term: 0, index: 0 },
                LogId { term: 1, index: 1 },
                LogId { term: 1, index: 2 },
            ]
        );
    }

    #[test]
    fn configure_entries_form_a_chain() {
        let mut log = open_log();
        let mut entries: Vec<_> = (1..=4).map(|i| user_entry(1, i)).collect();
        entries.push(config_entry(1, 5, members(&[1, 2, 3, 4])));
        entries.extend((6..=8).map(|i| user_entry(1, i)));
        entries.push(config_entry(1, 9, members(&[1, 2, 3, 4, 5])));
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();

        assert_eq!(log.cluster_config_index().unwrap(), 9);
        assert_eq!(log.cluster_config().unwrap().clog_index, 9);

        // Walking the chain from the head visits strictly decreasing
        // indexes and terminates at 0.
        let mut index = log.cluster_config_index().unwrap();
        let mut visited = vec![index];
        loop {
            let entry = log.get(index).unwrap().unwrap();
            let change = match entry.command {
                Command::Configure(change) => change,
                _ => panic!("not a config entry at {}", index),
            };
            match change.prev_config_index {
                Some(prev) => {
                    assert!(prev < index);
                    visited.push(prev);
                    index = prev;
                }
                None => break,
            }
        }
        assert_eq!(visited, vec![9, 5, 0]);
    }

    #[test]
    fn truncation_walks_the_config_chain_back() {
        let mut log = open_log();
        let mut entries: Vec<_> = (1..=4).map(|i| user_entry(1, i)).collect();
        let config_at_5 = members(&[1, 2, 3, 4]);
        entries.push(config_entry(1, 5, config_at_5.clone()));
        entries.extend((6..=8).map(|i| user_entry(1, i)));
        entries.push(config_entry(1, 9, members(&[1, 2, 3, 4, 5])));
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();

        // Overwrite at index 7: the config installed at 9 is gone, so the
        // effective config walks 9 -> 5.
        append(
            &mut log,
            2,
            LogId { term: 1, index: 6 },
            vec![user_entry(2, 7)],
        )
        .unwrap();

        assert_eq!(log.cluster_config_index().unwrap(), 5);
        assert_eq!(
            log.cluster_config().unwrap().voting_ids(),
            config_at_5.voting_ids()
        );
        assert_eq!(log.last().unwrap().log_id, LogId { term: 2, index: 7 });

        // The rollback is durable.
        let engine = log.close().unwrap();
        let log: TestLog = CommandLog::open(engine, None).unwrap();
        assert_eq!(log.cluster_config_index().unwrap(), 5);
        assert_eq!(
            log.cluster_config().unwrap().voting_ids(),
            config_at_5.voting_ids()
        );
    }

    #[test]
    fn stale_config_cache_is_rebuilt_on_recovery() {
        let mut log = open_log();
        let mut entries: Vec<_> = (1..=4).map(|i| user_entry(1, i)).collect();
        entries.push(config_entry(1, 5, members(&[1, 2, 3, 4])));
        entries.push(user_entry(1, 6));
        append(&mut log, 1, LogId { term: 0, index: 0 }, entries).unwrap();

        // Corrupt the cache so that it points at a non-config entry.
        let mut engine = log.close().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(
            Key::InternalProperty(CLUSTER_CONFIG_INDEX.to_string()).encode(),
            encode_value(&6u64).unwrap(),
        );
        engine.apply(batch).unwrap();

        let log: TestLog = CommandLog::open(engine, None).unwrap();
        assert_eq!(log.cluster_config_index().unwrap(), 5);
        assert_eq!(
            log.cluster_config().unwrap().voting_ids(),
            members(&[1, 2, 3, 4]).voting_ids()
        );
    }

    #[test]
    fn commit_ahead_of_tail_is_rejected() {
        let mut log = open_log();
        let res = log.append(
            AppendRequest {
                term: 1,
                prev_index: 0,
                prev_term: 0,
                entries: vec![user_entry(1, 1)],
                commit_index: 5,
            },
            0,
        );
        assert!(matches!(res, Err(Error::InvalidIndex(_))));
        // The entries themselves were stored before the check.
        assert_eq!(log.last().unwrap().log_id.index, 1);
    }

    #[test]
    fn slice_clamps_and_bounds() {
        let mut log = open_log();
        append(
            &mut log,
            1,
            LogId { term: 0, index: 0 },
            (1..=5).map(|i| user_entry(1, i)).collect(),
        )
        .unwrap();

        let mid: Vec<u64> = collect(&log, 2, Some(4)).into_iter().map(|id| id.index).collect();
        assert_eq!(mid, vec![2, 3]);

        let clamped: Vec<u64> = collect(&log, 3, Some(100)).into_iter().map(|id| id.index).collect();
        assert_eq!(clamped, vec![3, 4, 5]);

        assert!(collect(&log, 4, Some(4)).is_empty());
        assert!(collect(&log, 4, Some(2)).is_empty());
        assert!(collect(&log, 6, None).is_empty());
    }
}
