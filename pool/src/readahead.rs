// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::action::GetAction;
use crate::agent::{register_readahead, unregister_readahead, AgentHandle};
use crate::{pool_get, replenish_queue, AgentId, PoolCore, PoolState, ReadaheadId};
use hashing::Fingerprint;

pub(crate) struct ReadaheadState {
    /// None once the input is exhausted; the readahead is then "spent".
    pub(crate) iterator: Option<Box<dyn Iterator<Item = Fingerprint> + Send>>,
    /// In-flight and completed actions, in submission order.
    pub(crate) queue: VecDeque<GetAction>,
}

impl ReadaheadState {
    pub(crate) fn new(iterator: Box<dyn Iterator<Item = Fingerprint> + Send>) -> ReadaheadState {
        ReadaheadState {
            iterator: Some(iterator),
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn spent(&self) -> bool {
        self.iterator.is_none()
    }
}

///
/// Advances the readahead one step on behalf of the scheduler: pulls the next
/// fingerprint, appends its action to the queue, and either satisfies it from the chunk
/// registry or launches the backend get. Exhaustion marks the readahead spent.
///
pub(crate) fn readahead_dequeue(
    core: &Arc<PoolCore>,
    state: &mut PoolState,
    agent_id: AgentId,
    readahead_id: ReadaheadId,
) {
    enum Step {
        Stand,
        Launch(Fingerprint, GetAction),
    }
    let step = {
        let agent = state.agent_mut(agent_id);
        let Some(readahead) = agent.readaheads.get_mut(&readahead_id) else {
            return;
        };
        match readahead.iterator.as_mut().map(|iterator| iterator.next()) {
            None => Step::Stand,
            Some(None) => {
                readahead.iterator = None;
                Step::Stand
            }
            Some(Some(fingerprint)) => {
                let action = GetAction::new(fingerprint);
                readahead.queue.push_back(action.clone());
                Step::Launch(fingerprint, action)
            }
        }
    };

    if let Step::Launch(fingerprint, action) = step {
        match state.registry_get(fingerprint) {
            Some(chunk) => {
                action.complete(Ok(chunk));
                state.agent_mut(agent_id).notify();
            }
            None => {
                state.agent_mut(agent_id).pending_readaheads += 1;
                pool_get(core, state, fingerprint, move |state, result| {
                    action.complete(result);
                    if let Some(agent) = state.agents.get_mut(&agent_id) {
                        agent.pending_readaheads -= 1;
                        agent.notify();
                    }
                    register_readahead(state, agent_id, readahead_id);
                });
            }
        }
    }
    register_readahead(state, agent_id, readahead_id);
}

///
/// A prefetch pipeline: feeds a fingerprint iterator into a bounded window of concurrent
/// gets whose completions are consumed strictly in submission order, however they finish.
///
/// Dropping the readahead unregisters it; chunks already in flight complete against the
/// pool and are discarded.
///
pub struct Readahead {
    handle: Arc<AgentHandle>,
    id: ReadaheadId,
}

impl Readahead {
    pub(crate) fn new(handle: Arc<AgentHandle>, id: ReadaheadId) -> Readahead {
        Readahead { handle, id }
    }

    ///
    /// The next action, in submission order, once it has completed; None when the input
    /// iterator is exhausted and the queue is drained. The returned action is done:
    /// inspect `result` for the chunk or its error. Per-action failures do not poison
    /// the pipeline, so consumption may continue past them.
    ///
    pub async fn next(&mut self) -> Option<GetAction> {
        let core = &self.handle.core;
        let agent_id = self.handle.id;
        let mut rx = {
            let mut state = core.state.lock();
            state.agent_mut(agent_id).epoch.subscribe()
        };
        loop {
            {
                let mut state = core.state.lock();
                let popped = {
                    let agent = state.agent_mut(agent_id);
                    let readahead = agent
                        .readaheads
                        .get_mut(&self.id)
                        .expect("readahead state disappeared while its handle was live");
                    let head_done = readahead.queue.front().map(|action| action.is_done());
                    match head_done {
                        Some(true) => Some(Some(
                            readahead.queue.pop_front().expect("non-empty queue"),
                        )),
                        Some(false) => None,
                        None if readahead.spent() => Some(None),
                        None => None,
                    }
                };
                if let Some(result) = popped {
                    register_readahead(&mut state, agent_id, self.id);
                    replenish_queue(core, &mut state);
                    return result;
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut state = self.handle.core.state.lock();
        state
            .agent_mut(self.handle.id)
            .readaheads
            .get(&self.id)
            .map(|readahead| readahead.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Readahead {
    fn drop(&mut self) {
        let core = &self.handle.core;
        let mut state = core.state.lock();
        unregister_readahead(&mut state, self.handle.id, self.id);
        replenish_queue(core, &mut state);
    }
}
