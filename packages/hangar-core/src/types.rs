//! Core identifier and selector types for the sparse record model.
//!
//! A [`Key`] names one sparse record, a [`KeyGroup`] is a read/delete
//! selector over it, and [`Expiry`] carries the record's lifetime. The
//! materialized record itself lives in [`ValGroup`](crate::ValGroup).

use std::fmt;

use bytes::Bytes;

use crate::valgroup::ValGroup;

/// Identifies the logical tenant/namespace multiplexed onto a physical store.
///
/// Scoping keys onto a shared physical resource is a caller concern; the
/// store only reports which plane it was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaneId(pub u32);

impl fmt::Display for PlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plane-{}", self.0)
    }
}

/// Opaque byte string identifying one sparse record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(pub Bytes);

impl Key {
    /// Creates a key from a static byte string.
    #[must_use]
    pub fn from_static(data: &'static [u8]) -> Self {
        Self(Bytes::from_static(data))
    }

    /// The raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&[u8]> for Key {
    fn from(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }
}

/// Which fields of a record a read or delete addresses.
///
/// Deliberately a tagged variant rather than an optional collection so the
/// "all fields" case is exhaustively handled everywhere it is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelector {
    /// Select every field currently stored for the key.
    All,
    /// Select only the named fields. Fields absent from the record are
    /// silently ignored, never an error.
    Only(Vec<Bytes>),
}

/// A read/delete selector: a key plus a field selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroup {
    /// The record to address.
    pub key: Key,
    /// The fields of that record to address.
    pub fields: FieldSelector,
}

impl KeyGroup {
    /// Selector for every field of `key`.
    #[must_use]
    pub fn all(key: Key) -> Self {
        Self {
            key,
            fields: FieldSelector::All,
        }
    }

    /// Selector for the named fields of `key`.
    #[must_use]
    pub fn only(key: Key, fields: Vec<Bytes>) -> Self {
        Self {
            key,
            fields: FieldSelector::Only(fields),
        }
    }
}

/// Lifetime of a record, as carried by a [`ValGroup`].
///
/// `Unspecified` is legal only on a merge delta and means "leave the stored
/// expiry unchanged"; persisting it normalizes to `Never`. There is no
/// negative-integer sentinel anywhere in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Delta-only: keep whatever expiry the stored record already has.
    Unspecified,
    /// The record never expires.
    Never,
    /// The record expires at the given epoch second. A time at or before
    /// "now" means the record is already expired (tombstoned).
    At(u64),
}

impl Expiry {
    /// Whether a record with this expiry is already dead at `now` (epoch seconds).
    #[must_use]
    pub fn is_expired(self, now: u64) -> bool {
        match self {
            Self::Unspecified | Self::Never => false,
            Self::At(at) => at <= now,
        }
    }

    /// Merge rule: an unspecified delta expiry keeps the stored one.
    #[must_use]
    pub fn or_keep(self, stored: Self) -> Self {
        match self {
            Self::Unspecified => stored,
            other => other,
        }
    }

    /// Persistence rule: `Unspecified` written to a store with no existing
    /// record normalizes to `Never`.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Unspecified => Self::Never,
            other => other,
        }
    }
}

/// One entry of a parallel batch response: the materialized group plus an
/// optional per-key error raised by the worker that served it.
#[derive(Debug, Clone)]
pub struct ValGroupResult {
    /// The materialized group. Empty when the key is absent or errored.
    pub group: ValGroup,
    /// The per-key failure, if any. The batch caller surfaces the first one.
    pub error: Option<String>,
}

impl ValGroupResult {
    /// A successful result carrying `group`.
    #[must_use]
    pub fn ok(group: ValGroup) -> Self {
        Self {
            group,
            error: None,
        }
    }

    /// An absent key: an empty group, which is not an error.
    #[must_use]
    pub fn absent() -> Self {
        Self::ok(ValGroup::new())
    }

    /// A per-key failure.
    #[must_use]
    pub fn err(error: impl fmt::Display) -> Self {
        Self {
            group: ValGroup::new(),
            error: Some(error.to_string()),
        }
    }
}
