//! The Hangar contract: one interface over every backend.
//!
//! All collaborators (aggregation engines, profile stores) talk only to
//! [`Hangar`]; which backend serves them is a wiring decision. The contract
//! is synchronous from the caller's point of view and carries no timeout or
//! cancellation token — deadlines are a caller concern.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use hangar_core::{Codec, Key, KeyGroup, PlaneId, ValGroup};

/// A sparse, field-level key-value store.
///
/// Shared semantics every implementation honors:
///
/// - A key with no stored group reads as an empty [`ValGroup`], never an
///   error; the same goes for missing fields.
/// - `set_many` merges field-by-field (last writer wins per field), it
///   never replaces a whole record unless the caller deletes first.
/// - `close` stops background work deterministically; `teardown` is a
///   test-only destructive wipe that must fail outside test mode.
///
/// Used as `Arc<dyn Hangar>`.
#[async_trait]
pub trait Hangar: Send + Sync {
    /// The logical tenant/namespace this store was opened for.
    fn plane_id(&self) -> PlaneId;

    /// The active key/value codec.
    fn codec(&self) -> Arc<dyn Codec>;

    /// Reads the selected fields for every key group, in input order.
    ///
    /// Returns one group per input selector; absent keys/fields come back
    /// as empty groups. Any per-key decode failure aborts the whole call.
    async fn get_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<Vec<ValGroup>>;

    /// Merges one delta per key into the stored groups.
    ///
    /// `keys` and `deltas` are parallel sequences. A delta with an expiry
    /// already in the past tombstones the record.
    async fn set_many(&self, keys: Vec<Key>, deltas: Vec<ValGroup>) -> anyhow::Result<()>;

    /// Deletes whole records (`All` selectors) or individual fields
    /// (`Only` selectors).
    async fn del_many(&self, key_groups: Vec<KeyGroup>) -> anyhow::Result<()>;

    /// Streams an incremental backup of records written after
    /// `since_cursor` into `sink`, returning the new cursor.
    ///
    /// Only the durable tier supports this; other backends return an
    /// explicit unsupported error.
    async fn backup(
        &self,
        sink: &mut (dyn Write + Send),
        since_cursor: u64,
    ) -> anyhow::Result<u64>;

    /// Restores a backup stream into an empty store. Destructive.
    async fn restore(&self, source: &mut (dyn Read + Send)) -> anyhow::Result<()>;

    /// Stops background workers and releases backend handles.
    async fn close(&self) -> anyhow::Result<()>;

    /// Test-only destructive wipe. Errors unless the store was built in
    /// test mode.
    async fn teardown(&self) -> anyhow::Result<()>;
}
