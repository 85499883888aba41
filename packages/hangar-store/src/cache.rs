//! Bounded-memory, TTL-aware cache tier.
//!
//! Wraps a cost-tracked admission cache ([`quick_cache`]); the eviction
//! policy is the cache's own business, the cost of an entry is its encoded
//! key + value byte length. The store guarantees only that expired entries
//! read as absent — expiry rides inside the encoded group and is enforced
//! lazily on read, which is all the contract requires of a best-effort
//! tier.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use hangar_core::{
    Codec, FieldSelector, HangarError, Key, KeyGroup, PlaneId, ScratchPool, ValGroup,
    ValGroupResult,
};
use quick_cache::sync::Cache;
use quick_cache::Weighter;
use tokio::sync::oneshot;

use crate::config::CacheConfig;
use crate::hangar::Hangar;
use crate::pool::{chunk_size, into_chunks, WorkerPool, MIN_SUB_BATCH};

/// Current wall-clock time in whole seconds since the Unix epoch.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Weighs entries by encoded key + value length, matching the configured
/// byte budget.
#[derive(Debug, Clone, Copy)]
pub struct CostWeighter;

impl Weighter<Bytes, Bytes> for CostWeighter {
    fn weight(&self, key: &Bytes, val: &Bytes) -> u64 {
        (key.len() + val.len()) as u64
    }
}

type AdmissionCache = Cache<Bytes, Bytes, CostWeighter>;

fn build_cache(config: &CacheConfig) -> AdmissionCache {
    Cache::with_weighter(config.estimated_items, config.max_bytes, CostWeighter)
}

/// Cache-tier [`Hangar`] backend.
///
/// Reads fan out over a fixed worker pool; writes run read-merge-write per
/// key on the caller's task. Admission and eviction are delegated entirely
/// to the underlying cache.
pub struct CacheStore {
    plane: PlaneId,
    codec: Arc<dyn Codec>,
    cache: ArcSwap<AdmissionCache>,
    pool: WorkerPool,
    scratch: Arc<ScratchPool>,
    config: CacheConfig,
}

impl CacheStore {
    /// Creates the cache tier and starts its read workers.
    #[must_use]
    pub fn new(plane: PlaneId, codec: Arc<dyn Codec>, config: CacheConfig) -> Self {
        let pool = WorkerPool::start(config.workers, config.queue_depth);
        Self {
            plane,
            codec,
            cache: ArcSwap::from_pointee(build_cache(&config)),
            pool,
            scratch: Arc::new(ScratchPool::default()),
            config,
        }
    }
}

/// Serves one sub-batch of selectors against the cache.
///
/// Runs on a pool worker. Per-key decode failures are reported through
/// [`ValGroupResult::err`] so the batch caller can abort the whole call.
fn read_chunk(
    cache: &AdmissionCache,
    codec: &dyn Codec,
    scratch_pool: &ScratchPool,
    chunk: &[KeyGroup],
) -> Vec<ValGroupResult> {
    let now = now_secs();
    let mut scratch = scratch_pool.take();
    let mut out = Vec::with_capacity(chunk.len());

    for kg in chunk {
        let encoded_key = match codec.encode_key(&kg.key) {
            Ok(ek) => ek,
            Err(err) => {
                out.push(ValGroupResult::err(err));
                continue;
            }
        };

        let Some(raw) = cache.get(&encoded_key) else {
            out.push(ValGroupResult::absent());
            continue;
        };

        match codec.decode_val(&raw, true) {
            Err(err) => out.push(ValGroupResult::err(err)),
            Ok(mut group) => {
                if group.is_expired(now) {
                    cache.remove(&encoded_key);
                    out.push(ValGroupResult::absent());
                } else {
                    if let FieldSelector::Only(wanted) = &kg.fields {
                        group.select(wanted, &mut scratch);
                    }
                    out.push(ValGroupResult::ok(group));
                }
            }
        }
    }

    scratch_pool.put_back(scratch);
    out
}

#[async_trait]
impl Hangar for CacheStore {
    fn plane_id(&self) -> PlaneId {
        self.plane
    }

    fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    async fn get_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<Vec<ValGroup>> {
        if key_groups.is_empty() {
            return Ok(Vec::new());
        }

        let total = key_groups.len();
        let size = chunk_size(total, self.pool.workers(), MIN_SUB_BATCH);

        let mut receivers = Vec::new();
        for chunk in into_chunks(key_groups, size) {
            let cache = self.cache.load_full();
            let codec = Arc::clone(&self.codec);
            let scratch_pool = Arc::clone(&self.scratch);
            let (tx, rx) = oneshot::channel();
            self.pool
                .submit(Box::new(move || {
                    let _ = tx.send(read_chunk(&cache, codec.as_ref(), &scratch_pool, &chunk));
                }))
                .await
                .context("cache get: submit sub-batch")?;
            receivers.push(rx);
        }

        let mut out = Vec::with_capacity(total);
        for rx in receivers {
            let results = rx.await.context("cache get: worker dropped response")?;
            for result in results {
                if let Some(err) = result.error {
                    bail!("cache get: {err}");
                }
                out.push(result.group);
            }
        }
        Ok(out)
    }

    async fn set_many(&self, keys: Vec<Key>, deltas: Vec<ValGroup>) -> anyhow::Result<()> {
        if keys.len() != deltas.len() {
            bail!(
                "cache set: {} keys but {} deltas",
                keys.len(),
                deltas.len()
            );
        }

        let cache = self.cache.load();
        let now = now_secs();
        let mut scratch = self.scratch.take();

        // Stage every merge before touching the cache, so a mid-batch
        // failure applies nothing. `None` stages a removal (expired).
        let mut staged: Vec<(Bytes, Option<Bytes>)> = Vec::with_capacity(keys.len());
        for (key, delta) in keys.into_iter().zip(deltas) {
            delta.validate().context("cache set")?;
            let encoded_key = self.codec.encode_key(&key).context("cache set")?;

            let merged = match cache.get(&encoded_key) {
                Some(raw) => {
                    let mut current = self
                        .codec
                        .decode_val(&raw, true)
                        .context("cache set: decode existing")?;
                    if current.is_expired(now) {
                        let mut fresh = delta;
                        fresh.expiry = fresh.expiry.normalized();
                        fresh
                    } else {
                        current.update(&delta, &mut scratch).context("cache set")?;
                        current
                    }
                }
                None => {
                    let mut fresh = delta;
                    fresh.expiry = fresh.expiry.normalized();
                    fresh
                }
            };

            if merged.is_expired(now) {
                staged.push((encoded_key, None));
            } else {
                let raw = self.codec.encode_val(&merged).context("cache set")?;
                staged.push((encoded_key, Some(raw)));
            }
        }
        self.scratch.put_back(scratch);

        for (encoded_key, record) in staged {
            match record {
                Some(raw) => cache.insert(encoded_key, raw),
                None => {
                    cache.remove(&encoded_key);
                }
            }
        }
        Ok(())
    }

    async fn del_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<()> {
        let cache = self.cache.load();
        let now = now_secs();
        let mut scratch = self.scratch.take();

        // Same staging discipline as `set_many`: no mutation until every
        // field-level delete has decoded and re-encoded cleanly.
        let mut staged: Vec<(Bytes, Option<Bytes>)> = Vec::with_capacity(key_groups.len());
        for kg in key_groups {
            let encoded_key = self.codec.encode_key(&kg.key).context("cache del")?;
            match kg.fields {
                FieldSelector::All => staged.push((encoded_key, None)),
                FieldSelector::Only(fields) => {
                    let Some(raw) = cache.get(&encoded_key) else {
                        continue;
                    };
                    let mut group = self
                        .codec
                        .decode_val(&raw, true)
                        .context("cache del: decode existing")?;
                    if group.is_expired(now) {
                        staged.push((encoded_key, None));
                        continue;
                    }
                    group.del(&fields, &mut scratch);
                    if group.is_empty() {
                        staged.push((encoded_key, None));
                    } else {
                        let raw = self.codec.encode_val(&group).context("cache del")?;
                        staged.push((encoded_key, Some(raw)));
                    }
                }
            }
        }
        self.scratch.put_back(scratch);

        for (encoded_key, record) in staged {
            match record {
                Some(raw) => cache.insert(encoded_key, raw),
                None => {
                    cache.remove(&encoded_key);
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
            store: "cache",
        }
        .into())
    }

    async fn restore(&self, _source: &mut (dyn std::io::Read + Send)) -> anyhow::Result<()> {
        Err(HangarError::Unsupported {
            op: "restore",
            store: "cache",
        }
        .into())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if !self.config.test_mode {
            return Err(HangarError::TeardownGuard.into());
        }
        // Swap in a fresh empty cache; outstanding readers finish against
        // the old one and drop it.
        self.cache.store(Arc::new(build_cache(&self.config)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hangar_core::{BinaryCodec, Expiry};

    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn group(pairs: &[(&'static str, &'static str)], expiry: Expiry) -> ValGroup {
        let mut vg = ValGroup::new();
        vg.expiry = expiry;
        for (f, v) in pairs {
            vg.push(b(f), b(v));
        }
        vg
    }

    fn make_store(workers: usize) -> CacheStore {
        let config = CacheConfig {
            workers,
            test_mode: true,
            ..CacheConfig::default()
        };
        CacheStore::new(PlaneId(1), Arc::new(BinaryCodec::new()), config)
    }

    // --- set then get ---

    #[tokio::test]
    async fn set_then_get_returns_exact_fields() {
        let store = make_store(2);
        let key = Key::from_static(b"k1");
        let vg = group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never);

        store.set_many(vec![key.clone()], vec![vg.clone()]).await.unwrap();

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], vg);
    }

    #[tokio::test]
    async fn missing_key_reads_as_empty_not_error() {
        let store = make_store(2);
        let got = store
            .get_many(vec![KeyGroup::all(Key::from_static(b"nope"))])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].is_empty());
    }

    #[tokio::test]
    async fn second_set_merges_not_replaces() {
        let store = make_store(2);
        let key = Key::from_static(b"k");

        store
            .set_many(
                vec![key.clone()],
                vec![group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never)],
            )
            .await
            .unwrap();
        store
            .set_many(vec![key.clone()], vec![group(&[("f1", "v3")], Expiry::Never)])
            .await
            .unwrap();

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert_eq!(got[0].fields, vec![b("f1"), b("f2")]);
        assert_eq!(got[0].values, vec![b("v3"), b("v2")]);
    }

    // --- field selection ---

    #[tokio::test]
    async fn specific_field_selection_shrinks_result() {
        let store = make_store(2);
        let key = Key::from_static(b"k");
        store
            .set_many(
                vec![key.clone()],
                vec![group(&[("a", "1"), ("b", "2")], Expiry::Never)],
            )
            .await
            .unwrap();

        let got = store
            .get_many(vec![KeyGroup::only(key, vec![b("b"), b("missing")])])
            .await
            .unwrap();
        assert_eq!(got[0].fields, vec![b("b")]);
        assert_eq!(got[0].values, vec![b("2")]);
    }

    // --- expiry ---

    #[tokio::test]
    async fn delta_with_past_expiry_tombstones_the_record() {
        let store = make_store(2);
        let key = Key::from_static(b"k");

        store
            .set_many(vec![key.clone()], vec![group(&[("f", "v")], Expiry::Never)])
            .await
            .unwrap();
        store
            .set_many(vec![key.clone()], vec![group(&[("f", "v2")], Expiry::At(1))])
            .await
            .unwrap();

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert!(got[0].is_empty());
    }

    #[tokio::test]
    async fn stale_entry_reads_as_absent_and_is_dropped() {
        let store = make_store(2);
        let codec = store.codec();
        let key = Key::from_static(b"k");

        // Plant an already-expired entry directly in the underlying cache.
        let ek = codec.encode_key(&key).unwrap();
        let raw = codec
            .encode_val(&group(&[("f", "v")], Expiry::At(1)))
            .unwrap();
        store.cache.load().insert(ek.clone(), raw);

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert!(got[0].is_empty());
        assert!(store.cache.load().get(&ek).is_none(), "lazy drop on read");
    }

    // --- delete ---

    #[tokio::test]
    async fn partial_delete_removes_only_named_fields() {
        let store = make_store(2);
        let key = Key::from_static(b"k");
        store
            .set_many(
                vec![key.clone()],
                vec![group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never)],
            )
            .await
            .unwrap();

        store
            .del_many(vec![KeyGroup::only(key.clone(), vec![b("f1")])])
            .await
            .unwrap();

        let got = store
            .get_many(vec![KeyGroup::only(key.clone(), vec![b("f1"), b("f2")])])
            .await
            .unwrap();
        assert_eq!(got[0].fields, vec![b("f2")]);

        let got = store
            .get_many(vec![KeyGroup::only(key, vec![b("f1")])])
            .await
            .unwrap();
        assert!(got[0].is_empty());
    }

    #[tokio::test]
    async fn deleting_last_field_evicts_the_key() {
        let store = make_store(2);
        let key = Key::from_static(b"k");
        store
            .set_many(vec![key.clone()], vec![group(&[("f", "v")], Expiry::Never)])
            .await
            .unwrap();

        store
            .del_many(vec![KeyGroup::only(key.clone(), vec![b("f")])])
            .await
            .unwrap();

        let ek = store.codec.encode_key(&key).unwrap();
        assert!(store.cache.load().get(&ek).is_none());
    }

    #[tokio::test]
    async fn delete_all_fields_evicts_outright() {
        let store = make_store(2);
        let key = Key::from_static(b"k");
        store
            .set_many(
                vec![key.clone()],
                vec![group(&[("a", "1"), ("b", "2")], Expiry::Never)],
            )
            .await
            .unwrap();

        store.del_many(vec![KeyGroup::all(key.clone())]).await.unwrap();

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert!(got[0].is_empty());
    }

    // --- batching ---

    #[tokio::test]
    async fn large_batch_spans_worker_boundaries() {
        let store = make_store(4);

        let mut keys = Vec::new();
        let mut deltas = Vec::new();
        for i in 0..65u32 {
            keys.push(Key::from(format!("key-{i}").into_bytes()));
            let mut vg = ValGroup::new();
            vg.push(b("f"), Bytes::from(i.to_be_bytes().to_vec()));
            deltas.push(vg);
        }
        store.set_many(keys.clone(), deltas).await.unwrap();

        let groups = keys.iter().cloned().map(KeyGroup::all).collect();
        let got = store.get_many(groups).await.unwrap();
        assert_eq!(got.len(), 65);
        for (i, vg) in got.iter().enumerate() {
            let i = u32::try_from(i).unwrap();
            assert_eq!(vg.values[0], Bytes::from(i.to_be_bytes().to_vec()));
        }
    }

    // --- errors and guards ---

    #[tokio::test]
    async fn set_rejects_mismatched_batch_lengths() {
        let store = make_store(2);
        let result = store
            .set_many(vec![Key::from_static(b"k")], Vec::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mid_batch_set_failure_applies_nothing() {
        let store = make_store(2);
        let k1 = Key::from_static(b"k1");
        let k2 = Key::from_static(b"k2");

        // A corrupt stored record for k2 makes the batch fail at its
        // second position.
        let ek2 = store.codec.encode_key(&k2).unwrap();
        store
            .cache
            .load()
            .insert(ek2, Bytes::from_static(b"\xff\xffgarbage"));

        let result = store
            .set_many(
                vec![k1.clone(), k2],
                vec![
                    group(&[("f", "v")], Expiry::Never),
                    group(&[("f", "v")], Expiry::Never),
                ],
            )
            .await;
        assert!(result.is_err());

        let got = store.get_many(vec![KeyGroup::all(k1)]).await.unwrap();
        assert!(got[0].is_empty(), "first key untouched after failed batch");
    }

    #[tokio::test]
    async fn mid_batch_del_failure_applies_nothing() {
        let store = make_store(2);
        let k1 = Key::from_static(b"k1");
        let k2 = Key::from_static(b"k2");

        store
            .set_many(
                vec![k1.clone()],
                vec![group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never)],
            )
            .await
            .unwrap();
        let ek2 = store.codec.encode_key(&k2).unwrap();
        store
            .cache
            .load()
            .insert(ek2, Bytes::from_static(b"\xff\xffgarbage"));

        let result = store
            .del_many(vec![
                KeyGroup::only(k1.clone(), vec![b("f1")]),
                KeyGroup::only(k2, vec![b("x")]),
            ])
            .await;
        assert!(result.is_err());

        let got = store.get_many(vec![KeyGroup::all(k1)]).await.unwrap();
        assert_eq!(got[0].fields, vec![b("f1"), b("f2")], "no partial delete");
    }

    #[tokio::test]
    async fn teardown_requires_test_mode() {
        let config = CacheConfig {
            test_mode: false,
            ..CacheConfig::default()
        };
        let store = CacheStore::new(PlaneId(1), Arc::new(BinaryCodec::new()), config);

        let err = store.teardown().await.unwrap_err();
        assert!(err.downcast_ref::<HangarError>().is_some());
    }

    #[tokio::test]
    async fn teardown_wipes_in_test_mode() {
        let store = make_store(2);
        let key = Key::from_static(b"k");
        store
            .set_many(vec![key.clone()], vec![group(&[("f", "v")], Expiry::Never)])
            .await
            .unwrap();

        store.teardown().await.unwrap();

        let got = store.get_many(vec![KeyGroup::all(key)]).await.unwrap();
        assert!(got[0].is_empty());
    }

    #[tokio::test]
    async fn backup_and_restore_are_unsupported() {
        let store = make_store(2);
        let mut sink = Vec::new();
        assert!(store.backup(&mut sink, 0).await.is_err());

        let mut source = std::io::Cursor::new(Vec::new());
        assert!(store.restore(&mut source).await.is_err());
    }

    #[tokio::test]
    async fn close_stops_the_worker_pool() {
        let store = make_store(2);
        store.close().await.unwrap();

        let result = store
            .get_many(vec![KeyGroup::all(Key::from_static(b"k"))])
            .await;
        assert!(result.is_err(), "reads after close fail explicitly");
    }
}
