//! Two-tier store: a cache tier in front of a durable tier, kept
//! consistent by an asynchronous invalidate-then-fill protocol.
//!
//! Writes invalidate the touched cache fields, go through to the durable
//! tier, and enqueue a refresh; a single background consumer drains the
//! refresh queue in micro-batches, re-reads the durable tier, and replaces
//! the cached records. The cache therefore lags the durable tier by at most
//! roughly the fill timeout, and the fill consumer is the only writer of
//! cached records (the write path only issues idempotent deletes).

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use hangar_core::{Codec, FieldSelector, Key, KeyGroup, PlaneId, ScratchPool, ValGroup};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::LayeredConfig;
use crate::hangar::Hangar;

/// Collapses queued refreshes so each key is re-read once per batch,
/// preserving first-seen order. Refreshes are always whole-record, so
/// plain key dedup is all that is needed.
fn dedupe(batch: Vec<Key>) -> Vec<Key> {
    let mut seen: HashSet<Key> = HashSet::with_capacity(batch.len());
    let mut out = Vec::with_capacity(batch.len());
    for key in batch {
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

/// Re-reads one deduplicated batch from the durable tier and replaces the
/// corresponding cache records.
///
/// Records are deleted before being rewritten so fields that disappeared
/// from the durable tier do not linger in the cache.
async fn fill_batch(
    cache: &Arc<dyn Hangar>,
    durable: &Arc<dyn Hangar>,
    batch: Vec<Key>,
) -> anyhow::Result<()> {
    let keys = dedupe(batch);

    let groups = durable
        .get_many(keys.iter().cloned().map(KeyGroup::all).collect())
        .await
        .context("fill: durable read")?;

    cache
        .del_many(keys.iter().cloned().map(KeyGroup::all).collect())
        .await
        .context("fill: cache invalidate")?;

    let mut set_keys = Vec::new();
    let mut set_groups = Vec::new();
    for (key, group) in keys.into_iter().zip(groups) {
        if !group.is_empty() {
            set_keys.push(key);
            set_groups.push(group);
        }
    }
    if !set_keys.is_empty() {
        cache
            .set_many(set_keys, set_groups)
            .await
            .context("fill: cache write")?;
    }
    Ok(())
}

/// The background fill consumer: accumulates refreshes into micro-batches
/// bounded by `batch_size` and `timeout`, then fills each batch.
async fn run_fill_consumer(
    mut rx: mpsc::Receiver<Key>,
    cache: Arc<dyn Hangar>,
    durable: Arc<dyn Hangar>,
    batch_size: usize,
    timeout: Duration,
) {
    loop {
        let Some(first) = rx.recv().await else {
            break;
        };
        let mut batch = vec![first];

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                () = &mut deadline => break,
                item = rx.recv() => match item {
                    Some(key) => batch.push(key),
                    None => break,
                },
            }
        }

        let len = batch.len();
        match fill_batch(&cache, &durable, batch).await {
            Ok(()) => {
                metrics::counter!("hangar_fill_batches").increment(1);
                tracing::trace!(len, "fill batch applied");
            }
            Err(err) => {
                metrics::counter!("hangar_fill_failures").increment(1);
                tracing::warn!(len, error = %err, "fill batch failed; cache stays invalidated");
            }
        }
    }
}

/// Cache-over-durable [`Hangar`] backend.
///
/// Reads are served from the cache tier where possible, with misses
/// resolved against the durable tier inline and a cache refresh queued in
/// the background. Writes and deletes always reach the durable tier before
/// the call returns.
pub struct LayeredStore {
    cache: Arc<dyn Hangar>,
    durable: Arc<dyn Hangar>,
    scratch: ScratchPool,
    fill_tx: Mutex<Option<mpsc::Sender<Key>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl LayeredStore {
    /// Wires a cache tier in front of a durable tier and starts the fill
    /// consumer.
    ///
    /// # Errors
    ///
    /// Fails when the two tiers were opened for different planes.
    pub fn new(
        cache: Arc<dyn Hangar>,
        durable: Arc<dyn Hangar>,
        config: LayeredConfig,
    ) -> anyhow::Result<Self> {
        if cache.plane_id() != durable.plane_id() {
            bail!(
                "layered: tier plane mismatch ({} vs {})",
                cache.plane_id(),
                durable.plane_id()
            );
        }

        let batch_size = config.fill_batch_size.max(1);
        let capacity = (batch_size * config.fill_queue_factor.max(1)).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let consumer = tokio::spawn(run_fill_consumer(
            rx,
            Arc::clone(&cache),
            Arc::clone(&durable),
            batch_size,
            Duration::from_millis(config.fill_timeout_ms.max(1)),
        ));

        Ok(Self {
            cache,
            durable,
            scratch: ScratchPool::default(),
            fill_tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Queues a whole-record cache refresh for each key.
    ///
    /// Blocks when the fill queue is full; after `close` the refresh is
    /// dropped silently, since a closed store has no cache to keep warm.
    async fn enqueue_fills(&self, keys: impl IntoIterator<Item = Key>) {
        let Some(tx) = self.fill_tx.lock().clone() else {
            return;
        };
        for key in keys {
            if tx.send(key).await.is_err() {
                tracing::debug!("fill queue closed; dropping refresh");
                return;
            }
        }
    }
}

#[async_trait]
impl Hangar for LayeredStore {
    fn plane_id(&self) -> PlaneId {
        self.durable.plane_id()
    }

    fn codec(&self) -> Arc<dyn Codec> {
        self.durable.codec()
    }

    async fn get_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<Vec<ValGroup>> {
        if key_groups.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = self
            .cache
            .get_many(key_groups.clone())
            .await
            .context("layered get: cache tier")?;

        // A miss is an empty result for an `All` selector, or requested
        // fields the cached group does not carry.
        let mut missing: Vec<(usize, KeyGroup)> = Vec::new();
        for (idx, (kg, group)) in key_groups.iter().zip(&results).enumerate() {
            match &kg.fields {
                FieldSelector::All => {
                    if group.is_empty() {
                        missing.push((idx, kg.clone()));
                    }
                }
                FieldSelector::Only(wanted) => {
                    let absent: Vec<_> = wanted
                        .iter()
                        .filter(|f| !group.fields.contains(f))
                        .cloned()
                        .collect();
                    if !absent.is_empty() {
                        missing.push((idx, KeyGroup::only(kg.key.clone(), absent)));
                    }
                }
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        let fetched = self
            .durable
            .get_many(missing.iter().map(|(_, kg)| kg.clone()).collect())
            .await
            .context("layered get: durable tier")?;

        let mut scratch = self.scratch.take();
        let mut refresh = Vec::new();
        for ((idx, kg), group) in missing.into_iter().zip(fetched) {
            if group.is_empty() {
                continue;
            }
            if results[idx].is_empty() {
                results[idx] = group;
            } else {
                results[idx]
                    .update(&group, &mut scratch)
                    .context("layered get: merge tiers")?;
            }
            refresh.push(kg.key);
        }
        self.scratch.put_back(scratch);

        self.enqueue_fills(refresh).await;
        Ok(results)
    }

    async fn set_many(&self, keys: Vec<Key>, deltas: Vec<ValGroup>) -> anyhow::Result<()> {
        if keys.len() != deltas.len() {
            bail!(
                "layered set: {} keys but {} deltas",
                keys.len(),
                deltas.len()
            );
        }

        // Invalidate the written fields first so a concurrent reader never
        // sees the old cached value after this call returns.
        let invalidations = keys
            .iter()
            .zip(&deltas)
            .map(|(key, delta)| KeyGroup::only(key.clone(), delta.fields.clone()))
            .collect();
        self.cache
            .del_many(invalidations)
            .await
            .context("layered set: invalidate cache")?;

        self.durable
            .set_many(keys.clone(), deltas)
            .await
            .context("layered set: durable tier")?;

        self.enqueue_fills(keys).await;
        Ok(())
    }

    async fn del_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<()> {
        self.cache
            .del_many(key_groups.clone())
            .await
            .context("layered del: cache tier")?;
        self.durable
            .del_many(key_groups)
            .await
            .context("layered del: durable tier")?;
        Ok(())
    }

    async fn backup(
        &self,
        sink: &mut (dyn Write + Send),
        since_cursor: u64,
    ) -> anyhow::Result<u64> {
        self.durable.backup(sink, since_cursor).await
    }

    async fn restore(&self, source: &mut (dyn Read + Send)) -> anyhow::Result<()> {
        self.durable.restore(source).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the sender lets the consumer drain what is queued and
        // exit; join it before closing the tiers it writes to.
        drop(self.fill_tx.lock().take());
        let consumer = self.consumer.lock().take();
        if let Some(handle) = consumer {
            let _ = handle.await;
        }

        self.cache.close().await.context("layered close: cache tier")?;
        self.durable
            .close()
            .await
            .context("layered close: durable tier")?;
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.cache
            .teardown()
            .await
            .context("layered teardown: cache tier")?;
        self.durable
            .teardown()
            .await
            .context("layered teardown: durable tier")?;
        Ok(())
    }
}
