//! Sharded in-process store for tests and single-node deployments.
//!
//! The key space is partitioned across independently locked shards, so
//! concurrent batches touching different keys rarely contend. Operations
//! run inline on the caller's task; the only background work is a stats
//! reporter that periodically publishes item/byte gauges.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use hangar_core::{
    Codec, Expiry, FieldSelector, HangarError, Key, KeyGroup, PlaneId, ScratchPool, ValGroup,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::MemConfig;
use crate::hangar::Hangar;

/// Current wall-clock time in whole seconds since the Unix epoch.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One lock domain of the key space. The stored expiry is kept alongside
/// the encoded group so reads can reject dead entries without decoding.
struct Shard {
    entries: RwLock<HashMap<Bytes, (Bytes, Expiry)>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

fn shard_index(encoded_key: &Bytes, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    encoded_key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn measure(shards: &[Shard]) -> (usize, usize) {
    let mut items = 0;
    let mut bytes = 0;
    for shard in shards {
        let entries = shard.entries.read();
        items += entries.len();
        for (key, (raw, _)) in entries.iter() {
            bytes += key.len() + raw.len();
        }
    }
    (items, bytes)
}

fn spawn_reporter(
    shards: Arc<Vec<Shard>>,
    interval_ms: u64,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        // The first tick of an interval fires immediately; skip it so a
        // freshly opened store does not report before it holds anything.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    let (items, bytes) = measure(&shards);
                    metrics::gauge!("hangar_mem_items").set(items as f64);
                    metrics::gauge!("hangar_mem_bytes").set(bytes as f64);
                    tracing::debug!(items, bytes, "mem store stats");
                }
            }
        }
    });
    (stop_tx, handle)
}

/// In-memory [`Hangar`] backend.
///
/// Full semantics (merge, selection, expiry, teardown guard) with no
/// durability and no eviction; everything stays resident until deleted or
/// expired.
pub struct MemStore {
    plane: PlaneId,
    codec: Arc<dyn Codec>,
    shards: Arc<Vec<Shard>>,
    scratch: ScratchPool,
    reporter: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    config: MemConfig,
}

impl MemStore {
    /// Creates the store and starts its stats reporter.
    #[must_use]
    pub fn new(plane: PlaneId, codec: Arc<dyn Codec>, config: MemConfig) -> Self {
        let shard_count = config.shards.max(1);
        let shards = Arc::new((0..shard_count).map(|_| Shard::new()).collect::<Vec<_>>());
        let reporter = spawn_reporter(Arc::clone(&shards), config.report_interval_ms);
        Self {
            plane,
            codec,
            shards,
            scratch: ScratchPool::default(),
            reporter: Mutex::new(Some(reporter)),
            config,
        }
    }

    fn shard_for(&self, encoded_key: &Bytes) -> &Shard {
        &self.shards[shard_index(encoded_key, self.shards.len())]
    }
}

#[async_trait]
impl Hangar for MemStore {
    fn plane_id(&self) -> PlaneId {
        self.plane
    }

    fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    async fn get_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<Vec<ValGroup>> {
        let now = now_secs();
        let mut scratch = self.scratch.take();
        let mut out = Vec::with_capacity(key_groups.len());

        for kg in key_groups {
            let encoded_key = self.codec.encode_key(&kg.key).context("mem get")?;
            let shard = self.shard_for(&encoded_key);

            let found = shard.entries.read().get(&encoded_key).cloned();
            let Some((raw, expiry)) = found else {
                out.push(ValGroup::new());
                continue;
            };

            if expiry.is_expired(now) {
                shard.entries.write().remove(&encoded_key);
                out.push(ValGroup::new());
                continue;
            }

            let mut group = self
                .codec
                .decode_val(&raw, true)
                .context("mem get: decode existing")?;
            if let FieldSelector::Only(wanted) = &kg.fields {
                group.select(wanted, &mut scratch);
            }
            out.push(group);
        }

        self.scratch.put_back(scratch);
        Ok(out)
    }

    async fn set_many(&self, keys: Vec<Key>, deltas: Vec<ValGroup>) -> anyhow::Result<()> {
        if keys.len() != deltas.len() {
            bail!("mem set: {} keys but {} deltas", keys.len(), deltas.len());
        }

        let now = now_secs();
        let mut scratch = self.scratch.take();

        // Stage every merge before touching the shards, so a mid-batch
        // failure applies nothing. `None` stages a removal (expired).
        let mut staged: Vec<(Bytes, Option<(Bytes, Expiry)>)> = Vec::with_capacity(keys.len());
        for (key, delta) in keys.into_iter().zip(deltas) {
            delta.validate().context("mem set")?;
            let encoded_key = self.codec.encode_key(&key).context("mem set")?;
            let existing = self
                .shard_for(&encoded_key)
                .entries
                .read()
                .get(&encoded_key)
                .cloned();

            let merged = match existing {
                Some((raw, expiry)) if !expiry.is_expired(now) => {
                    let mut current = self
                        .codec
                        .decode_val(&raw, true)
                        .context("mem set: decode existing")?;
                    current.update(&delta, &mut scratch).context("mem set")?;
                    current
                }
                _ => {
                    let mut fresh = delta;
                    fresh.expiry = fresh.expiry.normalized();
                    fresh
                }
            };

            if merged.is_expired(now) {
                staged.push((encoded_key, None));
            } else {
                let raw = self.codec.encode_val(&merged).context("mem set")?;
                staged.push((encoded_key, Some((raw, merged.expiry))));
            }
        }
        self.scratch.put_back(scratch);

        for (encoded_key, record) in staged {
            let mut entries = self.shard_for(&encoded_key).entries.write();
            match record {
                Some(entry) => {
                    entries.insert(encoded_key, entry);
                }
                None => {
                    entries.remove(&encoded_key);
                }
            }
        }
        Ok(())
    }

    async fn del_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<()> {
        let now = now_secs();
        let mut scratch = self.scratch.take();

        // Same staging discipline as `set_many`: no shard mutation until
        // every field-level delete has decoded and re-encoded cleanly.
        let mut staged: Vec<(Bytes, Option<(Bytes, Expiry)>)> =
            Vec::with_capacity(key_groups.len());
        for kg in key_groups {
            let encoded_key = self.codec.encode_key(&kg.key).context("mem del")?;
            match kg.fields {
                FieldSelector::All => staged.push((encoded_key, None)),
                FieldSelector::Only(fields) => {
                    let existing = self
                        .shard_for(&encoded_key)
                        .entries
                        .read()
                        .get(&encoded_key)
                        .cloned();
                    let Some((raw, expiry)) = existing else {
                        continue;
                    };
                    if expiry.is_expired(now) {
                        staged.push((encoded_key, None));
                        continue;
                    }
                    let mut group = self
                        .codec
                        .decode_val(&raw, true)
                        .context("mem del: decode existing")?;
                    group.del(&fields, &mut scratch);
                    if group.is_empty() {
                        staged.push((encoded_key, None));
                    } else {
                        let raw = self.codec.encode_val(&group).context("mem del")?;
                        staged.push((encoded_key, Some((raw, group.expiry))));
                    }
                }
            }
        }
        self.scratch.put_back(scratch);

        for (encoded_key, record) in staged {
            let mut entries = self.shard_for(&encoded_key).entries.write();
            match record {
                Some(entry) => {
                    entries.insert(encoded_key, entry);
                }
                None => {
                    entries.remove(&encoded_key);
                }
            }
        }
        Ok(())
    }

    async fn backup(
        &self,
        _sink: &mut (dyn std::io::Write + Send),
        _since_cursor: u64,
    ) -> anyhow::Result<u64> {
        Err(HangarError::Unsupported {
            op: "backup",
            store: "mem",
        }
        .into())
    }

    async fn restore(&self, _source: &mut (dyn std::io::Read + Send)) -> anyhow::Result<()> {
        Err(HangarError::Unsupported {
            op: "restore",
            store: "mem",
        }
        .into())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let reporter = self.reporter.lock().take();
        if let Some((stop_tx, handle)) = reporter {
            drop(stop_tx);
            let _ = handle.await;
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if !self.config.test_mode {
            return Err(HangarError::TeardownGuard.into());
        }
        for shard in self.shards.iter() {
            shard.entries.write().clear();
        }
        Ok(())
    }
}
