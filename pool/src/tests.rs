// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::backend::memory::MemoryBackend;
use crate::filter::{FingerprintStream, Handler};
use crate::{Fingerprint, HashAlgorithm, Pool, PoolConfig, PoolError};
use task_executor::Executor;

fn new_pool(root: Arc<dyn Handler>) -> Pool {
    Pool::new(Executor::new(), root, &PoolConfig::default()).unwrap()
}

fn new_memory_pool() -> (Pool, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (new_pool(backend.clone()), backend)
}

fn fingerprint_of(data: &[u8]) -> Fingerprint {
    HashAlgorithm::Sha256.digest(data)
}

///
/// Delays every get by a random amount, to shake out ordering assumptions that only
/// hold when the backend answers in submission order.
///
struct JitterHandler {
    subordinate: Arc<dyn Handler>,
    max_delay_ms: u64,
}

#[async_trait]
impl Handler for JitterHandler {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        self.subordinate.has_chunk(fingerprint).await
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        let delay = rand::rng().random_range(0..self.max_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.subordinate.get_chunk(fingerprint).await
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        self.subordinate.put_chunk(fingerprint, value).await
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.subordinate.del_chunk(fingerprint).await
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        self.subordinate.lister().await
    }
}

///
/// Records the highest number of simultaneously executing backend operations.
///
struct ConcurrencyProbe {
    subordinate: Arc<dyn Handler>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn new(subordinate: Arc<dyn Handler>) -> Arc<ConcurrencyProbe> {
        Arc::new(ConcurrencyProbe {
            subordinate,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ConcurrencyProbe {
    async fn has_chunk(&self, fingerprint: Fingerprint) -> Result<bool, PoolError> {
        self.enter();
        let result = self.subordinate.has_chunk(fingerprint).await;
        self.exit();
        result
    }

    async fn get_chunk(&self, fingerprint: Fingerprint) -> Result<Bytes, PoolError> {
        self.enter();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = self.subordinate.get_chunk(fingerprint).await;
        self.exit();
        result
    }

    async fn put_chunk(&self, fingerprint: Fingerprint, value: Bytes) -> Result<(), PoolError> {
        self.enter();
        let result = self.subordinate.put_chunk(fingerprint, value).await;
        self.exit();
        result
    }

    async fn del_chunk(&self, fingerprint: Fingerprint) -> Result<(), PoolError> {
        self.enter();
        let result = self.subordinate.del_chunk(fingerprint).await;
        self.exit();
        result
    }

    async fn lister(&self) -> Result<FingerprintStream, PoolError> {
        self.subordinate.lister().await
    }
}

#[tokio::test]
async fn put_then_get_roundtrips() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"hello");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"hello"))
        .await
        .unwrap();
    let chunk = agent.get_chunk(fingerprint).await.unwrap();
    assert_eq!(&chunk[..], b"hello");
    assert!(agent.has_chunk(fingerprint).await.unwrap());
}

#[tokio::test]
async fn missing_chunk_is_an_error_and_sync_recovers() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"never-written");
    let err = agent.get_chunk(fingerprint).await.unwrap_err();
    assert_eq!(err, PoolError::NotFound(fingerprint));

    // The failure is sticky: writes are refused until sync() surfaces it.
    let gate = agent
        .put_chunk(fingerprint_of(b"x"), Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(gate, PoolError::Usage(_)));
    assert_eq!(agent.sync().await.unwrap_err(), PoolError::NotFound(fingerprint));

    // After the barrier the agent is usable again.
    agent
        .put_chunk(fingerprint_of(b"x"), Bytes::from_static(b"x"))
        .await
        .unwrap();
    agent.sync().await.unwrap();
}

#[tokio::test]
async fn puts_are_idempotent_and_dedup() {
    let (pool, backend) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"x");
    for _ in 0..5 {
        agent
            .put_chunk(fingerprint, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
    assert_eq!(backend.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_of_the_same_chunk_both_succeed() {
    let (pool, backend) = new_memory_pool();
    let a = pool.agent();
    let b = pool.agent();
    let fingerprint = fingerprint_of(b"x");
    let (ra, rb) = tokio::join!(
        a.put_chunk(fingerprint, Bytes::from_static(b"x")),
        b.put_chunk(fingerprint, Bytes::from_static(b"x")),
    );
    ra.unwrap();
    rb.unwrap();
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn del_chunk_removes_and_tolerates_missing() {
    let (pool, backend) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"doomed");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"doomed"))
        .await
        .unwrap();
    agent.del_chunk(fingerprint).await.unwrap();
    assert_eq!(backend.len(), 0);
    // Deleting again is not an error.
    agent.del_chunk(fingerprint).await.unwrap();
}

#[tokio::test]
async fn nowait_actions_complete_in_the_background() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"async");
    let put = agent
        .put_chunk_nowait(fingerprint, Bytes::from_static(b"async"))
        .await
        .unwrap();
    put.wait().await.unwrap();
    assert!(put.is_done());

    let get = agent.get_chunk_nowait(fingerprint).await;
    let chunk = get.wait().await.unwrap();
    assert_eq!(&chunk[..], b"async");
    assert_eq!(get.fingerprint(), fingerprint);
}

#[tokio::test]
async fn sync_is_a_write_barrier() {
    let (pool, _) = new_memory_pool();
    let writer = pool.agent();
    let mut fingerprints = Vec::new();
    for i in 0..10_u32 {
        let data = i.to_le_bytes().to_vec();
        let fingerprint = fingerprint_of(&data);
        fingerprints.push(fingerprint);
        writer
            .put_chunk_nowait(fingerprint, Bytes::from(data))
            .await
            .unwrap();
    }
    writer.sync().await.unwrap();

    // A fresh agent observes every write that happened before the barrier.
    let reader = pool.agent();
    for fingerprint in fingerprints {
        assert!(reader.has_chunk(fingerprint).await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readahead_yields_in_submission_order_despite_latency() {
    let backend = Arc::new(MemoryBackend::new());
    let mut fingerprints = Vec::new();
    for i in 0..200_u32 {
        let data = format!("chunk-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        backend
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        fingerprints.push(fingerprint);
    }
    let pool = new_pool(Arc::new(JitterHandler {
        subordinate: backend,
        max_delay_ms: 20,
    }));
    let agent = pool.agent();
    let mut readahead = agent.readahead(fingerprints.clone());
    let mut yielded = Vec::new();
    while let Some(action) = readahead.next().await {
        let chunk = action.result().unwrap().unwrap();
        assert_eq!(fingerprint_of(&chunk), action.fingerprint());
        yielded.push(action.fingerprint());
    }
    assert_eq!(yielded, fingerprints);
}

#[tokio::test]
async fn readahead_carries_per_action_errors() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let present = fingerprint_of(b"present");
    let absent = fingerprint_of(b"absent");
    agent
        .put_chunk(present, Bytes::from_static(b"present"))
        .await
        .unwrap();

    let mut readahead = agent.readahead(vec![present, absent, present]);
    let first = readahead.next().await.unwrap();
    assert!(first.result().unwrap().is_ok());
    let second = readahead.next().await.unwrap();
    assert_eq!(second.result().unwrap().unwrap_err(), PoolError::NotFound(absent));
    // Consumption continues past the failure.
    let third = readahead.next().await.unwrap();
    assert!(third.result().unwrap().is_ok());
    assert!(readahead.next().await.is_none());
}

#[tokio::test]
async fn empty_readahead_finishes_immediately() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let mut readahead = agent.readahead(Vec::<Fingerprint>::new());
    assert!(readahead.next().await.is_none());
}

#[tokio::test]
async fn dropped_readahead_releases_the_agent() {
    let (pool, backend) = new_memory_pool();
    let agent = pool.agent();
    let mut fingerprints = Vec::new();
    for i in 0..50_u32 {
        let data = format!("drop-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        backend
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        fingerprints.push(fingerprint);
    }
    let mut readahead = agent.readahead(fingerprints);
    let _ = readahead.next().await.unwrap();
    drop(readahead);
    // The agent keeps working after its readahead was abandoned mid-flight.
    let fingerprint = fingerprint_of(b"after");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"after"))
        .await
        .unwrap();
    assert!(agent.has_chunk(fingerprint).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_depth_never_exceeds_the_configured_cap() {
    let backend = Arc::new(MemoryBackend::new());
    let mut fingerprints = Vec::new();
    for i in 0..100_u32 {
        let data = format!("depth-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        backend
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        fingerprints.push(fingerprint);
    }
    let probe = ConcurrencyProbe::new(backend);
    let config = PoolConfig {
        max_queue_depth: 4,
        ..PoolConfig::default()
    };
    let pool = Pool::new(Executor::new(), probe.clone(), &config).unwrap();
    let agent = pool.agent();
    let mut readahead = agent.readahead(fingerprints);
    while let Some(action) = readahead.next().await {
        action.result().unwrap().unwrap();
    }
    assert!(probe.peak() <= 4, "peak concurrency was {}", probe.peak());
    assert!(probe.peak() > 1, "expected pipelining, got none");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn direct_work_is_not_starved_by_a_prefetcher() {
    let backend = Arc::new(MemoryBackend::new());
    let mut fingerprints = Vec::new();
    for i in 0..500_u32 {
        let data = format!("bulk-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        backend
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        fingerprints.push(fingerprint);
    }
    let pool = new_pool(Arc::new(JitterHandler {
        subordinate: backend,
        max_delay_ms: 3,
    }));

    let prefetcher = pool.agent();
    let mut readahead = prefetcher.readahead(fingerprints);
    let drain = tokio::spawn(async move {
        let mut count = 0;
        while let Some(action) = readahead.next().await {
            action.result().unwrap().unwrap();
            count += 1;
        }
        count
    });

    // Direct writes from another agent complete while the prefetch is saturating
    // the queue.
    let writer = pool.agent();
    for i in 0..10_u32 {
        let data = format!("urgent-{i}").into_bytes();
        writer
            .put_chunk(fingerprint_of(&data), Bytes::from(data))
            .await
            .unwrap();
    }
    writer.sync().await.unwrap();

    assert_eq!(drain.await.unwrap(), 500);
}

#[tokio::test]
async fn chunk_registry_serves_repeat_reads_and_forgets_released_chunks() {
    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"cached");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"cached"))
        .await
        .unwrap();

    let first = agent.get_chunk(fingerprint).await.unwrap();
    let second = agent.get_chunk(fingerprint).await.unwrap();
    // The second read was served from the registry: same allocation.
    assert!(Arc::ptr_eq(&first, &second));

    drop(first);
    drop(second);
    // With no consumer left, the weak entry is dead.
    assert!(pool.core.state.lock().registry_get(fingerprint).is_none());

    // And a fresh read still works, straight from the backend.
    let reloaded = agent.get_chunk(fingerprint).await.unwrap();
    assert_eq!(&reloaded[..], b"cached");
}

#[tokio::test]
async fn readaheads_ride_the_chunk_registry() {
    let (pool, backend) = new_memory_pool();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"shared");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"shared"))
        .await
        .unwrap();
    let pinned = agent.get_chunk(fingerprint).await.unwrap();

    // Wipe the backend: the readahead can only succeed via the registry.
    backend.del_chunk(fingerprint).await.unwrap();
    let mut readahead = agent.readahead(vec![fingerprint]);
    let action = readahead.next().await.unwrap();
    let chunk = action.result().unwrap().unwrap();
    assert!(Arc::ptr_eq(&pinned, &chunk));
}

#[tokio::test]
async fn lister_enumerates_every_fingerprint() {
    use futures::StreamExt;

    let (pool, _) = new_memory_pool();
    let agent = pool.agent();
    let mut expected = Vec::new();
    for i in 0..20_u32 {
        let data = format!("list-{i}").into_bytes();
        let fingerprint = fingerprint_of(&data);
        agent
            .put_chunk(fingerprint, Bytes::from(data))
            .await
            .unwrap();
        expected.push(fingerprint);
    }
    agent.sync().await.unwrap();
    expected.sort();

    let mut listed = Vec::new();
    let mut stream = agent.lister().await.unwrap();
    while let Some(fingerprint) = stream.next().await {
        listed.push(fingerprint.unwrap());
    }
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn agents_are_independent() {
    let (pool, _) = new_memory_pool();
    let failing = pool.agent();
    let healthy = pool.agent();
    let absent = fingerprint_of(b"absent");
    failing.get_chunk(absent).await.unwrap_err();

    // Another agent's sticky error does not leak over here.
    healthy
        .put_chunk(fingerprint_of(b"fine"), Bytes::from_static(b"fine"))
        .await
        .unwrap();
    healthy.sync().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn from_config_assembles_a_working_filesystem_pool() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = PoolConfig::default();
    let pool = Pool::from_config(Executor::new(), dir.path(), &config).unwrap();
    let agent = pool.agent();
    let fingerprint = fingerprint_of(b"on disk");
    agent
        .put_chunk(fingerprint, Bytes::from_static(b"on disk"))
        .await
        .unwrap();
    agent.sync().await.unwrap();
    assert_eq!(&agent.get_chunk(fingerprint).await.unwrap()[..], b"on disk");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn from_config_assembles_a_filtered_chain() {
    use crate::StorageKind;

    let dir = tempfile::TempDir::new().unwrap();
    let config = PoolConfig {
        storage: StorageKind::Memory,
        compression: Some(crate::filter::compression::CompressionAlgorithm::Zstd),
        encryption_key: Some(vec![7; 32]),
        ..PoolConfig::default()
    };
    let pool = Pool::from_config(Executor::new(), dir.path(), &config).unwrap();
    let agent = pool.agent();
    let data = b"compressed and sealed".repeat(100);
    let fingerprint = fingerprint_of(&data);
    agent
        .put_chunk(fingerprint, Bytes::from(data.clone()))
        .await
        .unwrap();
    assert_eq!(&agent.get_chunk(fingerprint).await.unwrap()[..], &data[..]);
}
