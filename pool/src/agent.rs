// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::action::{DelAction, GetAction, HasAction, PutAction};
use crate::error::PoolError;
use crate::filter::FingerprintStream;
use crate::heapmap::MinHeapMap;
use crate::readahead::{readahead_dequeue, Readahead, ReadaheadState};
use crate::{
    pool_del, pool_get, pool_has, pool_put, replenish_queue, AgentId, Chunk, PoolCore, PoolState,
    ReadaheadId,
};
use hashing::Fingerprint;

///
/// A deferred direct operation: runs under the pool lock when the scheduler picks this
/// agent, performs its accounting, and dispatches the pool-level call.
///
pub(crate) type Mailbag = Box<dyn FnOnce(&Arc<PoolCore>, &mut PoolState) + Send>;

pub(crate) struct AgentState {
    /// Scheduling serial: reassigned on every scheduler pop to round-robin equal avarice.
    pub(crate) serial: u64,
    /// Submitted get/has actions that have not yet completed.
    pub(crate) pending_reads: usize,
    /// Serials of submitted put/del actions that have not yet completed; min is the
    /// oldest outstanding write, which `sync` waits on.
    pub(crate) pending_writes: MinHeapMap<u64, u64>,
    /// Direct operations waiting to be picked up by the scheduler, in submission order.
    pub(crate) mailhook: VecDeque<(u64, Mailbag)>,
    pub(crate) next_mailbag_token: u64,
    pub(crate) next_action_serial: u64,
    pub(crate) readaheads: std::collections::HashMap<ReadaheadId, ReadaheadState>,
    /// Readaheads keyed by (spent, queue length); the minimum is the most deserving.
    pub(crate) readahead_heap: MinHeapMap<ReadaheadId, (bool, usize)>,
    /// Sum of all readahead queue lengths, completed entries included.
    pub(crate) total_readaheads: usize,
    /// Readahead gets currently in flight against the backend.
    pub(crate) pending_readaheads: usize,
    pub(crate) max_readaheads: usize,
    /// Sticky: set by any failed direct operation, cleared and surfaced by `sync`.
    pub(crate) exception: Option<PoolError>,
    /// Bumped on every state change a waiter might care about.
    pub(crate) epoch: watch::Sender<()>,
}

impl AgentState {
    pub(crate) fn new(serial: u64, max_readaheads: usize) -> AgentState {
        let (epoch, _) = watch::channel(());
        AgentState {
            serial,
            pending_reads: 0,
            pending_writes: MinHeapMap::new(),
            mailhook: VecDeque::new(),
            next_mailbag_token: 0,
            next_action_serial: 0,
            readaheads: std::collections::HashMap::new(),
            readahead_heap: MinHeapMap::new(),
            total_readaheads: 0,
            pending_readaheads: 0,
            max_readaheads,
            exception: None,
            epoch,
        }
    }

    pub(crate) fn notify(&self) {
        self.epoch.send_replace(());
    }
}

///
/// The agent's weight in the scheduler; smaller is served sooner. Agents with urgent
/// direct work sort by their outstanding-operation count, while pure prefetchers are
/// deprioritized as their window grows, which is what fair-shares the queue between many
/// concurrent readaheads.
///
pub(crate) fn avarice(agent: &AgentState) -> u64 {
    if !agent.mailhook.is_empty() || !agent.pending_writes.is_empty() || agent.pending_reads > 0 {
        return (agent.pending_writes.len() + agent.pending_reads + agent.pending_readaheads)
            as u64;
    }
    match agent.readahead_heap.peek() {
        None => agent.pending_readaheads as u64,
        Some((_, &(spent, len))) => {
            if spent || len > 0 {
                agent.total_readaheads.max(agent.pending_readaheads) as u64
            } else {
                agent.pending_readaheads as u64
            }
        }
    }
}

///
/// The readahead the scheduler would advance next: the top of the heap, unless it is
/// spent or the agent's window is full (a zero-length queue may always grow, so a fresh
/// readahead is never starved by the cap).
///
pub(crate) fn eligible_readahead(agent: &AgentState) -> Option<ReadaheadId> {
    let (&readahead_id, &(spent, len)) = agent.readahead_heap.peek()?;
    if spent || (len > 0 && agent.total_readaheads >= agent.max_readaheads) {
        return None;
    }
    Some(readahead_id)
}

pub(crate) fn register_agent(state: &mut PoolState, agent_id: AgentId) {
    let priority = {
        let agent = state.agent_mut(agent_id);
        (avarice(agent), agent.serial)
    };
    state.ready.insert(agent_id, priority);
}

///
/// Re-derives whether this agent belongs on the ready heap. Callers are responsible for
/// running `replenish_queue` once their batch of mutations is complete.
///
pub(crate) fn update_registration(state: &mut PoolState, agent_id: AgentId) {
    let register = {
        let Some(agent) = state.agents.get(&agent_id) else {
            state.ready.remove(&agent_id);
            return;
        };
        if !agent.mailhook.is_empty() {
            true
        } else if agent.pending_reads > 0 || !agent.pending_writes.is_empty() {
            false
        } else {
            eligible_readahead(agent).is_some()
        }
    };
    if register {
        register_agent(state, agent_id);
    } else {
        state.ready.remove(&agent_id);
    }
}

///
/// Records a readahead's current (spent, length) key, maintaining the agent's window
/// total from the diff. A no-op when the key is unchanged.
///
pub(crate) fn register_readahead(
    state: &mut PoolState,
    agent_id: AgentId,
    readahead_id: ReadaheadId,
) {
    {
        let Some(agent) = state.agents.get_mut(&agent_id) else {
            return;
        };
        let Some(readahead) = agent.readaheads.get(&readahead_id) else {
            return;
        };
        let new = (readahead.spent(), readahead.queue.len());
        let old = agent.readahead_heap.get(&readahead_id).copied();
        if old == Some(new) {
            return;
        }
        if let Some((_, old_len)) = old {
            agent.total_readaheads -= old_len;
        }
        agent.readahead_heap.insert(readahead_id, new);
        agent.total_readaheads += new.1;
    }
    update_registration(state, agent_id);
}

pub(crate) fn unregister_readahead(
    state: &mut PoolState,
    agent_id: AgentId,
    readahead_id: ReadaheadId,
) {
    {
        let Some(agent) = state.agents.get_mut(&agent_id) else {
            return;
        };
        if let Some((_, len)) = agent.readahead_heap.remove(&readahead_id) {
            agent.total_readaheads -= len;
        }
        agent.readaheads.remove(&readahead_id);
    }
    update_registration(state, agent_id);
}

///
/// One scheduling step for this agent: run the oldest queued direct operation if any;
/// otherwise, if direct work is in flight, stand down until it completes; otherwise
/// advance the most deserving readahead, or leave the ready heap entirely.
///
pub(crate) fn agent_dequeue(core: &Arc<PoolCore>, state: &mut PoolState, agent_id: AgentId) {
    let mailbag = {
        let agent = state.agent_mut(agent_id);
        match agent.mailhook.pop_front() {
            Some((_, op)) => {
                agent.notify();
                Some(op)
            }
            None => None,
        }
    };
    if let Some(op) = mailbag {
        op(core, state);
        return;
    }

    let has_direct = {
        let agent = state.agent_mut(agent_id);
        agent.pending_reads > 0 || !agent.pending_writes.is_empty()
    };
    if has_direct {
        state.ready.remove(&agent_id);
        return;
    }

    match eligible_readahead(state.agent_mut(agent_id)) {
        None => {
            state.ready.remove(&agent_id);
        }
        Some(readahead_id) => readahead_dequeue(core, state, agent_id, readahead_id),
    }
}

pub(crate) struct AgentHandle {
    pub(crate) core: Arc<PoolCore>,
    pub(crate) id: AgentId,
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        state.ready.remove(&self.id);
        state.agents.remove(&self.id);
    }
}

///
/// A per-client handle into the pool. Direct operations are serialized through the
/// agent's mailhook in submission order; any number of readaheads may run alongside.
///
/// Every operation suspends twice: once until the scheduler accepts the submission, and
/// (for the plain variants) again until the backend completes it. The `_nowait` variants
/// return after the first suspension with an action handle to await or poll.
///
/// After a failed put or del, further writes are refused until [`PoolAgent::sync`] has
/// surfaced the error.
///
pub struct PoolAgent {
    inner: Arc<AgentHandle>,
}

impl PoolAgent {
    pub(crate) fn new(core: Arc<PoolCore>) -> PoolAgent {
        let id = {
            let mut state = core.state.lock();
            let id = state.next_agent_id;
            state.next_agent_id += 1;
            let serial = state.next_agent_serial;
            state.next_agent_serial += 1;
            let max_readaheads = core.max_readaheads;
            state.agents.insert(id, AgentState::new(serial, max_readaheads));
            id
        };
        PoolAgent {
            inner: Arc::new(AgentHandle { core, id }),
        }
    }

    ///
    /// Queues the mailbag, wakes the scheduler, and suspends until the scheduler has
    /// consumed it. With `check_sticky`, refuses immediately when a previous write
    /// failed and `sync` has not yet been called.
    ///
    async fn enqueue_mailbag(
        &self,
        mailbag: Mailbag,
        check_sticky: bool,
    ) -> Result<(), PoolError> {
        let core = &self.inner.core;
        let agent_id = self.inner.id;
        let (token, mut rx) = {
            let mut state = core.state.lock();
            let agent = state.agent_mut(agent_id);
            if check_sticky {
                if let Some(err) = &agent.exception {
                    return Err(PoolError::Usage(format!(
                        "an operation has failed; call sync() first: {err}"
                    )));
                }
            }
            let token = agent.next_mailbag_token;
            agent.next_mailbag_token += 1;
            let rx = agent.epoch.subscribe();
            agent.mailhook.push_back((token, mailbag));
            register_agent(&mut state, agent_id);
            replenish_queue(core, &mut state);
            (token, rx)
        };
        loop {
            {
                let mut state = core.state.lock();
                let agent = state.agent_mut(agent_id);
                if !agent.mailhook.iter().any(|(t, _)| *t == token) {
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub async fn get_chunk_nowait(&self, fingerprint: Fingerprint) -> GetAction {
        let action = GetAction::new(fingerprint);
        let agent_id = self.inner.id;
        let completion = action.clone();
        let mailbag: Mailbag = Box::new(move |core, state| {
            state.agent_mut(agent_id).pending_reads += 1;
            update_registration(state, agent_id);
            pool_get(core, state, fingerprint, move |state, result| {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    if let Err(e) = &result {
                        agent.exception = Some(e.clone());
                    }
                    agent.pending_reads -= 1;
                    agent.notify();
                }
                completion.complete(result);
            });
        });
        // Reads have no sticky gate: the error will surface on sync() regardless.
        let _ = self.enqueue_mailbag(mailbag, false).await;
        action
    }

    pub async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Chunk, PoolError> {
        self.get_chunk_nowait(fingerprint).await.wait().await
    }

    pub async fn has_chunk_nowait(&self, fingerprint: Fingerprint) -> HasAction {
        let action = HasAction::new(fingerprint);
        let agent_id = self.inner.id;
        let completion = action.clone();
        let mailbag: Mailbag = Box::new(move |core, state| {
            state.agent_mut(agent_id).pending_reads += 1;
            update_registration(state, agent_id);
            pool_has(core, state, fingerprint, move |state, result| {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    if let Err(e) = &result {
                        agent.exception = Some(e.clone());
                    }
                    agent.pending_reads -= 1;
                    agent.notify();
                }
                completion.complete(result);
            });
        });
        let _ = self.enqueue_mailbag(mailbag, false).await;
        action
    }

    pub async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        self.has_chunk_nowait(fingerprint).await.wait().await
    }

    pub async fn put_chunk_nowait(
        &self,
        fingerprint: Fingerprint,
        value: Bytes,
    ) -> Result<PutAction, PoolError> {
        let action = PutAction::new(fingerprint);
        let agent_id = self.inner.id;
        let completion = action.clone();
        let mailbag: Mailbag = Box::new(move |core, state| {
            let serial = {
                let agent = state.agent_mut(agent_id);
                let serial = agent.next_action_serial;
                agent.next_action_serial += 1;
                agent.pending_writes.insert(serial, serial);
                serial
            };
            update_registration(state, agent_id);
            pool_put(core, state, fingerprint, value, move |state, result| {
                if state.agents.contains_key(&agent_id) {
                    state.agent_mut(agent_id).pending_writes.remove(&serial);
                    update_registration(state, agent_id);
                    let agent = state.agent_mut(agent_id);
                    if let Err(e) = &result {
                        agent.exception = Some(e.clone());
                    }
                    agent.notify();
                }
                completion.complete(result);
            });
        });
        self.enqueue_mailbag(mailbag, true).await?;
        Ok(action)
    }

    pub async fn put_chunk(
        &self,
        fingerprint: Fingerprint,
        value: Bytes,
    ) -> Result<(), PoolError> {
        self.put_chunk_nowait(fingerprint, value).await?.wait().await
    }

    pub async fn del_chunk_nowait(
        &self,
        fingerprint: Fingerprint,
    ) -> Result<DelAction, PoolError> {
        let action = DelAction::new(fingerprint);
        let agent_id = self.inner.id;
        let completion = action.clone();
        let mailbag: Mailbag = Box::new(move |core, state| {
            let serial = {
                let agent = state.agent_mut(agent_id);
                let serial = agent.next_action_serial;
                agent.next_action_serial += 1;
                agent.pending_writes.insert(serial, serial);
                serial
            };
            update_registration(state, agent_id);
            pool_del(core, state, fingerprint, move |state, result| {
                if state.agents.contains_key(&agent_id) {
                    state.agent_mut(agent_id).pending_writes.remove(&serial);
                    update_registration(state, agent_id);
                    let agent = state.agent_mut(agent_id);
                    if let Err(e) = &result {
                        agent.exception = Some(e.clone());
                    }
                    agent.notify();
                }
                completion.complete(result);
            });
        });
        self.enqueue_mailbag(mailbag, true).await?;
        Ok(action)
    }

    pub async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.del_chunk_nowait(fingerprint).await?.wait().await
    }

    ///
    /// Starts a prefetch pipeline over the given fingerprints. The iterator is advanced
    /// under the pool lock, one step per scheduling decision, so it must be a cheap
    /// in-memory source.
    ///
    pub fn readahead<I>(&self, fingerprints: I) -> Readahead
    where
        I: IntoIterator<Item = Fingerprint>,
        I::IntoIter: Send + 'static,
    {
        let core = &self.inner.core;
        let agent_id = self.inner.id;
        let readahead_id = {
            let mut state = core.state.lock();
            let readahead_id = state.next_readahead_id;
            state.next_readahead_id += 1;
            state.agent_mut(agent_id).readaheads.insert(
                readahead_id,
                ReadaheadState::new(Box::new(fingerprints.into_iter())),
            );
            register_readahead(&mut state, agent_id, readahead_id);
            replenish_queue(core, &mut state);
            readahead_id
        };
        Readahead::new(self.inner.clone(), readahead_id)
    }

    /// Enumerates every fingerprint in the pool, in backend-chosen order.
    pub async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        self.inner.core.root.lister().await
    }

    ///
    /// The write barrier: suspends until every put/del submitted before this call has
    /// completed, then clears and raises the sticky error if any of them failed.
    ///
    pub async fn sync(&self) -> Result<(), PoolError> {
        let core = &self.inner.core;
        let agent_id = self.inner.id;
        let (snapshot, mut rx) = {
            let mut state = core.state.lock();
            let agent = state.agent_mut(agent_id);
            (agent.next_action_serial, agent.epoch.subscribe())
        };
        loop {
            {
                let mut state = core.state.lock();
                let agent = state.agent_mut(agent_id);
                let drained = match agent.pending_writes.peek() {
                    None => true,
                    Some((_, &oldest)) => oldest >= snapshot,
                };
                if drained {
                    return match agent.exception.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}
