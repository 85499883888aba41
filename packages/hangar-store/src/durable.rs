//! Durable ground-truth tier backed by an embedded transactional engine.
//!
//! Every record is stored as an 8-byte big-endian write-version (millis
//! since epoch) followed by the codec's encoded group. Reads for one
//! sub-batch share a single snapshot; `set_many`/`del_many` run
//! read-merge-write with one read snapshot and one atomic write batch, so
//! partial updates never lose fields to concurrent writers of *other*
//! fields. Two batches racing on the same field are "last write batch wins
//! per field" — nothing stronger is promised.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use hangar_core::{
    Codec, FieldSelector, HangarError, Key, KeyGroup, PlaneId, Scratch, ScratchPool, ValGroup,
    ValGroupResult,
};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::oneshot;

use crate::backup::{read_frame, read_header, write_frame, write_header};
use crate::config::DurableConfig;
use crate::hangar::Hangar;
use crate::pool::{chunk_size, into_chunks, WorkerPool, MIN_SUB_BATCH};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hangar");

/// Current wall-clock time in whole seconds since the Unix epoch.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used as the per-record write-version driving incremental backups.
fn now_millis() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Prefixes an encoded group with its write-version.
fn wrap_record(version: u64, encoded: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(8 + encoded.len());
    record.extend_from_slice(&version.to_be_bytes());
    record.extend_from_slice(encoded);
    record
}

/// Splits a stored record into its write-version and encoded group.
fn unwrap_record(raw: &[u8]) -> Result<(u64, Bytes), HangarError> {
    if raw.len() < 8 {
        return Err(HangarError::Codec(format!(
            "stored record shorter than version prefix: {} bytes",
            raw.len()
        )));
    }
    let mut version = [0u8; 8];
    version.copy_from_slice(&raw[..8]);
    Ok((u64::from_be_bytes(version), Bytes::copy_from_slice(&raw[8..])))
}

/// Durable [`Hangar`] backend.
///
/// Ground truth for the layered composition; also usable standalone.
pub struct DurableStore {
    plane: PlaneId,
    codec: Arc<dyn Codec>,
    db: Arc<Database>,
    pool: WorkerPool,
    scratch: Arc<ScratchPool>,
    config: DurableConfig,
}

impl DurableStore {
    /// Opens (or creates) the database file and starts the read workers.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened or its table created.
    pub fn open(
        plane: PlaneId,
        codec: Arc<dyn Codec>,
        config: DurableConfig,
    ) -> anyhow::Result<Self> {
        let db = Database::create(&config.path)
            .with_context(|| format!("open durable database at {}", config.path.display()))?;

        // Create the table up front so read snapshots never race its
        // first creation.
        let txn = db.begin_write().context("durable open: init transaction")?;
        txn.open_table(TABLE).context("durable open: create table")?;
        txn.commit().context("durable open: commit init")?;

        let pool = WorkerPool::start(config.workers, config.queue_depth);
        Ok(Self {
            plane,
            codec,
            db: Arc::new(db),
            pool,
            scratch: Arc::new(ScratchPool::default()),
            config,
        })
    }

    /// Merges `delta` into the stored record bytes, if any.
    fn merge_existing(
        codec: &dyn Codec,
        existing: Option<&[u8]>,
        delta: ValGroup,
        now: u64,
        scratch: &mut Scratch,
    ) -> anyhow::Result<ValGroup> {
        let merged = match existing {
            Some(raw) => {
                let (_, encoded) = unwrap_record(raw)?;
                let mut current = codec
                    .decode_val(&encoded, true)
                    .context("durable set: decode existing")?;
                if current.is_expired(now) {
                    normalized(delta)
                } else {
                    current.update(&delta, scratch).context("durable set")?;
                    current
                }
            }
            None => normalized(delta),
        };
        Ok(merged)
    }
}

fn normalized(mut delta: ValGroup) -> ValGroup {
    delta.expiry = delta.expiry.normalized();
    delta
}

/// Serves one sub-batch of selectors from a single read snapshot.
fn read_chunk(
    db: &Database,
    codec: &dyn Codec,
    scratch_pool: &ScratchPool,
    chunk: &[KeyGroup],
) -> anyhow::Result<Vec<ValGroupResult>> {
    let txn = db.begin_read().context("durable get: read snapshot")?;
    let table = txn.open_table(TABLE).context("durable get: open table")?;

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

        let guard = match table.get(encoded_key.as_ref()) {
            Ok(guard) => guard,
            Err(err) => {
                out.push(ValGroupResult::err(err));
                continue;
            }
        };
        let Some(guard) = guard else {
            out.push(ValGroupResult::absent());
            continue;
        };

        let result = match unwrap_record(guard.value()) {
            Err(err) => ValGroupResult::err(err),
            Ok((_, encoded)) => match codec.decode_val(&encoded, true) {
                Err(err) => ValGroupResult::err(err),
                Ok(mut group) => {
                    if group.is_expired(now) {
                        ValGroupResult::absent()
                    } else {
                        if let FieldSelector::Only(wanted) = &kg.fields {
                            group.select(wanted, &mut scratch);
                        }
                        ValGroupResult::ok(group)
                    }
                }
            },
        };
        out.push(result);
    }

    scratch_pool.put_back(scratch);
    Ok(out)
}

#[async_trait]
impl Hangar for DurableStore {
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
            let db = Arc::clone(&self.db);
            let codec = Arc::clone(&self.codec);
            let scratch_pool = Arc::clone(&self.scratch);
            let (tx, rx) = oneshot::channel();
            self.pool
                .submit(Box::new(move || {
                    let _ = tx.send(read_chunk(&db, codec.as_ref(), &scratch_pool, &chunk));
                }))
                .await
                .context("durable get: submit sub-batch")?;
            receivers.push(rx);
        }

        let mut out = Vec::with_capacity(total);
        for rx in receivers {
            let results = rx.await.context("durable get: worker dropped response")??;
            for result in results {
                if let Some(err) = result.error {
                    bail!("durable get: {err}");
                }
                out.push(result.group);
            }
        }
        Ok(out)
    }

    async fn set_many(&self, keys: Vec<Key>, deltas: Vec<ValGroup>) -> anyhow::Result<()> {
        if keys.len() != deltas.len() {
            bail!(
                "durable set: {} keys but {} deltas",
                keys.len(),
                deltas.len()
            );
        }

        let now = now_secs();
        let version = now_millis();
        let mut scratch = self.scratch.take();

        // Stage all merges against one consistent read view, then commit
        // the whole batch atomically. `None` stages a delete (expired).
        let staged: Vec<(Bytes, Option<Vec<u8>>)> = {
            let txn = self.db.begin_read().context("durable set: read snapshot")?;
            let table = txn.open_table(TABLE).context("durable set: open table")?;

            let mut staged = Vec::with_capacity(keys.len());
            for (key, delta) in keys.into_iter().zip(deltas) {
                delta.validate().context("durable set")?;
                let encoded_key = self.codec.encode_key(&key).context("durable set")?;

                let guard = table
                    .get(encoded_key.as_ref())
                    .context("durable set: read existing")?;
                let merged = DurableStore::merge_existing(
                    self.codec.as_ref(),
                    guard.as_ref().map(|g| g.value()),
                    delta,
                    now,
                    &mut scratch,
                )?;

                if merged.is_expired(now) {
                    staged.push((encoded_key, None));
                } else {
                    let encoded = self.codec.encode_val(&merged).context("durable set")?;
                    staged.push((encoded_key, Some(wrap_record(version, &encoded))));
                }
            }
            staged
        };
        self.scratch.put_back(scratch);

        let txn = self.db.begin_write().context("durable set: write batch")?;
        {
            let mut table = txn.open_table(TABLE).context("durable set: open table")?;
            for (encoded_key, record) in &staged {
                match record {
                    Some(record) => {
                        table
                            .insert(encoded_key.as_ref(), record.as_slice())
                            .context("durable set: insert")?;
                    }
                    None => {
                        table
                            .remove(encoded_key.as_ref())
                            .context("durable set: remove expired")?;
                    }
                }
            }
        }
        txn.commit().context("durable set: commit")?;
        Ok(())
    }

    async fn del_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<()> {
        let now = now_secs();
        let version = now_millis();
        let mut scratch = self.scratch.take();

        // Field-level deletes are computed against the same read view used
        // for the lookups, so they cannot lose concurrent writes to other
        // fields committed before our write batch.
        let staged: Vec<(Bytes, Option<Vec<u8>>)> = {
            let txn = self.db.begin_read().context("durable del: read snapshot")?;
            let table = txn.open_table(TABLE).context("durable del: open table")?;

            let mut staged = Vec::with_capacity(key_groups.len());
            for kg in key_groups {
                let encoded_key = self.codec.encode_key(&kg.key).context("durable del")?;
                match kg.fields {
                    FieldSelector::All => staged.push((encoded_key, None)),
                    FieldSelector::Only(fields) => {
                        let Some(guard) = table
                            .get(encoded_key.as_ref())
                            .context("durable del: read existing")?
                        else {
                            continue;
                        };
                        let (_, encoded) = unwrap_record(guard.value())?;
                        let mut group = self
                            .codec
                            .decode_val(&encoded, true)
                            .context("durable del: decode existing")?;
                        if group.is_expired(now) {
                            staged.push((encoded_key, None));
                            continue;
                        }
                        group.del(&fields, &mut scratch);
                        if group.is_empty() {
                            staged.push((encoded_key, None));
                        } else {
                            let encoded =
                                self.codec.encode_val(&group).context("durable del")?;
                            staged.push((encoded_key, Some(wrap_record(version, &encoded))));
                        }
                    }
                }
            }
            staged
        };
        self.scratch.put_back(scratch);

        let txn = self.db.begin_write().context("durable del: write batch")?;
        {
            let mut table = txn.open_table(TABLE).context("durable del: open table")?;
            for (encoded_key, record) in &staged {
                match record {
                    Some(record) => {
                        table
                            .insert(encoded_key.as_ref(), record.as_slice())
                            .context("durable del: insert")?;
                    }
                    None => {
                        table
                            .remove(encoded_key.as_ref())
                            .context("durable del: remove")?;
                    }
                }
            }
        }
        txn.commit().context("durable del: commit")?;
        Ok(())
    }

    async fn backup(
        &self,
        sink: &mut (dyn std::io::Write + Send),
        since_cursor: u64,
    ) -> anyhow::Result<u64> {
        let txn = self.db.begin_read().context("backup: read snapshot")?;
        let table = txn.open_table(TABLE).context("backup: open table")?;

        write_header(sink)?;
        let mut cursor = since_cursor;
        for entry in table.iter().context("backup: iterate")? {
            let (key, value) = entry.context("backup: next entry")?;
            let raw = value.value();
            let (version, _) = unwrap_record(raw)?;
            if version > since_cursor {
                write_frame(sink, key.value(), raw)?;
                cursor = cursor.max(version);
            }
        }
        sink.flush().context("backup: flush sink")?;
        Ok(cursor)
    }

    async fn restore(&self, source: &mut (dyn std::io::Read + Send)) -> anyhow::Result<()> {
        read_header(source)?;

        {
            let txn = self.db.begin_read().context("restore: read snapshot")?;
            let table = txn.open_table(TABLE).context("restore: open table")?;
            if table.iter().context("restore: inspect table")?.next().is_some() {
                bail!("restore: target store is not empty");
            }
        }

        let txn = self.db.begin_write().context("restore: write batch")?;
        {
            let mut table = txn.open_table(TABLE).context("restore: open table")?;
            while let Some((key, record)) = read_frame(source)? {
                table
                    .insert(key.as_slice(), record.as_slice())
                    .context("restore: insert")?;
            }
        }
        txn.commit().context("restore: commit")?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if !self.config.test_mode {
            return Err(HangarError::TeardownGuard.into());
        }

        let txn = self.db.begin_write().context("teardown: write batch")?;
        txn.delete_table(TABLE).context("teardown: drop table")?;
        txn.commit().context("teardown: commit")?;

        match std::fs::remove_file(&self.config.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("teardown: remove {}", self.config.path.display())
            }),
        }
    }
}
