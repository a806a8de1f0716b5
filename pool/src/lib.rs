// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A deduplicating, content-addressed chunk pool.
//!
//! Chunks are immutable byte strings identified by the fingerprint of their contents.
//! The [`Pool`] fair-shares a bounded backend queue between any number of [`PoolAgent`]s,
//! each of which serializes its own direct operations and may run [`Readahead`] pipelines
//! that prefetch chunks ahead of an in-order consumer. Between the pool and its terminal
//! [`backend`] sits a chain of [`filter`]s (compression, encryption).

#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::used_underscore_binding
)]
#![allow(clippy::new_without_default, clippy::too_many_arguments)]

pub mod action;
pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod heapmap;
pub mod readahead;


#[cfg(test)]
mod heapmap_tests;

#[cfg(test)]
mod tests;

pub use crate::action::{DelAction, GetAction, HasAction, PoolAction, PutAction};
pub use crate::agent::PoolAgent;
pub use crate::config::{PoolConfig, StorageKind};
pub use crate::error::PoolError;
pub use crate::filter::{FingerprintStream, Handler};
pub use crate::readahead::Readahead;
pub use hashing::{Fingerprint, HashAlgorithm};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::agent::AgentState;
use crate::backend::filesystem::FilesystemBackend;
use crate::backend::lmdb::LmdbBackend;
use crate::backend::memory::MemoryBackend;
use crate::backend::rocks::RocksBackend;
use crate::filter::compression::Compressor;
use crate::filter::encryption::Encryptor;
use crate::heapmap::MinHeapMap;
use task_executor::Executor;

///
/// A chunk as handed to consumers: shared so that the weak chunk registry can cache it
/// for exactly as long as any consumer retains it.
///
pub type Chunk = Arc<Bytes>;

pub(crate) type AgentId = u64;
pub(crate) type ReadaheadId = u64;

///
/// The admission-control and fair-sharing layer over a filter chain and backend.
///
/// The pool itself is not a thread: scheduling happens on whichever thread mutates pool
/// state, inside [`replenish_queue`]. One mutex guards all of it, including every agent's
/// and readahead's bookkeeping; backend I/O runs outside the lock on the executor and
/// re-acquires it only to record completions.
///
#[derive(Clone)]
pub struct Pool {
    core: Arc<PoolCore>,
}

pub(crate) struct PoolCore {
    pub(crate) root: Arc<dyn Handler>,
    pub(crate) executor: Executor,
    pub(crate) chunk_size: usize,
    pub(crate) hash: HashAlgorithm,
    pub(crate) max_queue_depth: usize,
    pub(crate) max_readaheads: usize,
    pub(crate) state: Mutex<PoolState>,
}

pub(crate) struct PoolState {
    /// Backend operations currently in flight, pool-wide. Never exceeds max_queue_depth.
    pub(crate) queue_depth: usize,
    pub(crate) next_agent_serial: u64,
    pub(crate) next_agent_id: AgentId,
    pub(crate) next_readahead_id: ReadaheadId,
    /// Agents with work the scheduler may start, keyed by (avarice, serial).
    pub(crate) ready: MinHeapMap<AgentId, (u64, u64)>,
    pub(crate) agents: HashMap<AgentId, AgentState>,
    /// Cached chunks, alive only while some consumer still holds them.
    pub(crate) chunk_registry: HashMap<Fingerprint, Weak<Bytes>>,
}

impl PoolState {
    pub(crate) fn agent_mut(&mut self, agent_id: AgentId) -> &mut AgentState {
        self.agents
            .get_mut(&agent_id)
            .expect("agent state disappeared while its handle was live")
    }

    pub(crate) fn registry_get(&mut self, fingerprint: Fingerprint) -> Option<Chunk> {
        match self.chunk_registry.get(&fingerprint) {
            Some(weak) => match weak.upgrade() {
                Some(chunk) => Some(chunk),
                None => {
                    self.chunk_registry.remove(&fingerprint);
                    None
                }
            },
            None => None,
        }
    }

    ///
    /// Interns a freshly loaded chunk, or returns the cached copy if another load won.
    ///
    pub(crate) fn registry_exchange(&mut self, fingerprint: Fingerprint, chunk: Chunk) -> Chunk {
        if let Some(existing) = self.registry_get(fingerprint) {
            return existing;
        }
        self.chunk_registry
            .insert(fingerprint, Arc::downgrade(&chunk));
        chunk
    }
}

impl Pool {
    pub fn new(
        executor: Executor,
        root: Arc<dyn Handler>,
        config: &PoolConfig,
    ) -> Result<Pool, PoolError> {
        config.validate()?;
        Ok(Pool {
            core: Arc::new(PoolCore {
                root,
                executor,
                chunk_size: config.chunk_size,
                hash: config.hash,
                max_queue_depth: config.max_queue_depth,
                max_readaheads: config.max_readaheads,
                state: Mutex::new(PoolState {
                    queue_depth: 0,
                    next_agent_serial: 0,
                    next_agent_id: 0,
                    next_readahead_id: 0,
                    ready: MinHeapMap::new(),
                    agents: HashMap::new(),
                    chunk_registry: HashMap::new(),
                }),
            }),
        })
    }

    ///
    /// Assembles the configured backend and filter chain under `rootdir` and builds a
    /// pool on top: `Pool -> [Compressor ->] [Encryptor ->] backend`.
    ///
    pub fn from_config(
        executor: Executor,
        rootdir: &Path,
        config: &PoolConfig,
    ) -> Result<Pool, PoolError> {
        config.validate()?;
        let pooldir = rootdir.join(&config.pooldir);
        let mut handler: Arc<dyn Handler> = match config.storage {
            StorageKind::Filesystem => Arc::new(FilesystemBackend::new(
                &pooldir,
                config.hash.size(),
                config.max_workers,
                executor.clone(),
            )?),
            StorageKind::Lmdb => Arc::new(LmdbBackend::open(
                &pooldir,
                config.max_workers,
                executor.clone(),
            )?),
            StorageKind::Rocks => Arc::new(RocksBackend::open(
                &pooldir,
                config.max_workers,
                executor.clone(),
            )?),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        };
        if let Some(key) = &config.encryption_key {
            handler = Arc::new(Encryptor::new(
                handler,
                key,
                config.hash.size(),
                executor.clone(),
            )?);
        }
        if let Some(algorithm) = config.compression {
            handler = Arc::new(Compressor::new(
                handler,
                algorithm,
                config.compression_preset,
                executor.clone(),
            ));
        }
        Pool::new(executor, handler, config)
    }

    ///
    /// Creates a new agent. Agents are cheap; every independent task (one backup stream,
    /// one restore) should own its own so that the scheduler can fair-share between them.
    ///
    pub fn agent(&self) -> PoolAgent {
        PoolAgent::new(self.core.clone())
    }

    pub fn chunk_size(&self) -> usize {
        self.core.chunk_size
    }

    pub fn hash(&self) -> HashAlgorithm {
        self.core.hash
    }
}

///
/// The scheduling loop: while there is queue room and some agent is ready, pick the
/// neediest agent (smallest avarice, then oldest serial), hand it a fresh serial so that
/// equally-needy agents round-robin, and let it start one unit of work.
///
/// Every mutation of pool state funnels through here afterwards; the loop re-reads the
/// heap each iteration because an agent's dequeue reshuffles it.
///
pub(crate) fn replenish_queue(core: &Arc<PoolCore>, state: &mut PoolState) {
    loop {
        if state.queue_depth >= core.max_queue_depth {
            return;
        }
        let Some((&agent_id, _)) = state.ready.peek() else {
            return;
        };
        let serial = state.next_agent_serial;
        state.next_agent_serial += 1;
        state.agent_mut(agent_id).serial = serial;
        agent::agent_dequeue(core, state, agent_id);
    }
}

///
/// Pool-level read: consults the chunk registry first and completes without touching the
/// backend on a hit; otherwise occupies a queue slot and dispatches through the filter
/// chain. `when_done` runs under the pool lock in both cases.
///
pub(crate) fn pool_get<F>(
    core: &Arc<PoolCore>,
    state: &mut PoolState,
    fingerprint: Fingerprint,
    when_done: F,
) where
    F: FnOnce(&mut PoolState, Result<Chunk, PoolError>) + Send + 'static,
{
    if let Some(chunk) = state.registry_get(fingerprint) {
        when_done(state, Ok(chunk));
        return;
    }
    state.queue_depth += 1;
    let core = core.clone();
    let task = async move {
        let result = core.root.get_chunk(fingerprint).await;
        let mut state = core.state.lock();
        let result =
            result.map(|bytes| state.registry_exchange(fingerprint, Arc::new(bytes)));
        when_done(&mut state, result);
        state.queue_depth -= 1;
        replenish_queue(&core, &mut state);
    };
    core.executor.native_spawn(task);
}

pub(crate) fn pool_has<F>(
    core: &Arc<PoolCore>,
    state: &mut PoolState,
    fingerprint: Fingerprint,
    when_done: F,
) where
    F: FnOnce(&mut PoolState, Result<bool, PoolError>) + Send + 'static,
{
    state.queue_depth += 1;
    let core = core.clone();
    core.executor.native_spawn(async move {
        let result = core.root.has_chunk(fingerprint).await;
        let mut state = core.state.lock();
        when_done(&mut state, result);
        state.queue_depth -= 1;
        replenish_queue(&core, &mut state);
    });
}

pub(crate) fn pool_put<F>(
    core: &Arc<PoolCore>,
    state: &mut PoolState,
    fingerprint: Fingerprint,
    value: Bytes,
    when_done: F,
) where
    F: FnOnce(&mut PoolState, Result<(), PoolError>) + Send + 'static,
{
    state.queue_depth += 1;
    let core = core.clone();
    core.executor.native_spawn(async move {
        let result = core.root.put_chunk(fingerprint, value).await;
        let mut state = core.state.lock();
        when_done(&mut state, result);
        state.queue_depth -= 1;
        replenish_queue(&core, &mut state);
    });
}

pub(crate) fn pool_del<F>(
    core: &Arc<PoolCore>,
    state: &mut PoolState,
    fingerprint: Fingerprint,
    when_done: F,
) where
    F: FnOnce(&mut PoolState, Result<(), PoolError>) + Send + 'static,
{
    state.queue_depth += 1;
    let core = core.clone();
    core.executor.native_spawn(async move {
        let result = core.root.del_chunk(fingerprint).await;
        let mut state = core.state.lock();
        when_done(&mut state, result);
        state.queue_depth -= 1;
        replenish_queue(&core, &mut state);
    });
}
