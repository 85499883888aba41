//! The materialized sparse record and its merge algebra.
//!
//! A [`ValGroup`] is either the stored state of one key or a delta to merge
//! into it. The three operations here — [`update`](ValGroup::update),
//! [`select`](ValGroup::select), and [`del`](ValGroup::del) — are the whole
//! algebra every backend is built from. All are O(n) in the number of
//! fields and borrow a [`Scratch`] instead of allocating per call.

use bytes::Bytes;

use crate::error::HangarError;
use crate::scratch::Scratch;
use crate::types::Expiry;

/// The (field, value) pairs plus expiry for one key.
///
/// `fields[i]` names the value at `values[i]`; the two sequences must stay
/// in lock-step. Order carries no meaning beyond that pairing. An empty
/// group is the canonical representation of an absent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValGroup {
    /// Field names, parallel to `values`.
    pub fields: Vec<Bytes>,
    /// Field values, parallel to `fields`.
    pub values: Vec<Bytes>,
    /// Lifetime of the whole record.
    pub expiry: Expiry,
}

impl ValGroup {
    /// Creates an empty group that never expires.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            values: Vec::new(),
            expiry: Expiry::Never,
        }
    }

    /// Creates a group from parallel field/value sequences.
    #[must_use]
    pub fn with_expiry(fields: Vec<Bytes>, values: Vec<Bytes>, expiry: Expiry) -> Self {
        Self {
            fields,
            values,
            expiry,
        }
    }

    /// Appends one (field, value) pair.
    pub fn push(&mut self, field: Bytes, value: Bytes) {
        self.fields.push(field);
        self.values.push(value);
    }

    /// Number of (field, value) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the group holds no fields. An empty group reads as an
    /// absent record, never as an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks the fields/values lock-step invariant.
    ///
    /// # Errors
    ///
    /// Returns [`HangarError::FieldValueMismatch`] when the sequences have
    /// diverged; a mismatched group is never silently truncated.
    pub fn validate(&self) -> Result<(), HangarError> {
        if self.fields.len() == self.values.len() {
            Ok(())
        } else {
            Err(HangarError::FieldValueMismatch {
                fields: self.fields.len(),
                values: self.values.len(),
            })
        }
    }

    /// Whether the record is already dead at `now` (epoch seconds).
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry.is_expired(now)
    }

    /// Merges `other` into `self`, field by field (last writer wins).
    ///
    /// Fields of `other` overwrite matching fields of `self` and append
    /// otherwise; fields not mentioned in `other` are untouched. The expiry
    /// is replaced by `other.expiry` unless that is
    /// [`Expiry::Unspecified`], which keeps the stored one.
    ///
    /// # Errors
    ///
    /// Fails if either operand violates the lock-step invariant. `self` is
    /// not modified on error.
    pub fn update(&mut self, other: &ValGroup, scratch: &mut Scratch) -> Result<(), HangarError> {
        self.validate()?;
        other.validate()?;

        scratch.index.clear();
        for (i, field) in self.fields.iter().enumerate() {
            scratch.index.insert(field.clone(), i);
        }

        for (field, value) in other.fields.iter().zip(&other.values) {
            if let Some(&i) = scratch.index.get(field) {
                self.values[i] = value.clone();
            } else {
                self.fields.push(field.clone());
                self.values.push(value.clone());
            }
        }

        self.expiry = other.expiry.or_keep(self.expiry);
        Ok(())
    }

    /// Shrinks `self` to the intersection with `wanted`, preserving the
    /// original field order. Requested fields absent from `self` are
    /// silently ignored.
    pub fn select(&mut self, wanted: &[Bytes], scratch: &mut Scratch) {
        scratch.set.clear();
        scratch.set.extend(wanted.iter().cloned());
        self.compact(|field, set| set.contains(field), scratch);
    }

    /// Removes the named fields from `self` (set subtraction).
    pub fn del(&mut self, fields: &[Bytes], scratch: &mut Scratch) {
        scratch.set.clear();
        scratch.set.extend(fields.iter().cloned());
        self.compact(|field, set| !set.contains(field), scratch);
    }

    /// In-place stable compaction of both sequences by a field predicate.
    fn compact(
        &mut self,
        keep: impl Fn(&Bytes, &std::collections::HashSet<Bytes>) -> bool,
        scratch: &Scratch,
    ) {
        let mut write = 0;
        for read in 0..self.fields.len() {
            if keep(&self.fields[read], &scratch.set) {
                self.fields.swap(write, read);
                self.values.swap(write, read);
                write += 1;
            }
        }
        self.fields.truncate(write);
        self.values.truncate(write);
    }
}

impl Default for ValGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
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

    // --- update ---

    #[test]
    fn update_overwrites_matching_and_appends_new() {
        let mut scratch = Scratch::default();
        let mut stored = group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never);
        let delta = group(&[("f1", "v3"), ("f3", "v4")], Expiry::Never);

        stored.update(&delta, &mut scratch).unwrap();

        assert_eq!(stored.fields, vec![b("f1"), b("f2"), b("f3")]);
        assert_eq!(stored.values, vec![b("v3"), b("v2"), b("v4")]);
    }

    #[test]
    fn update_leaves_unmentioned_fields_untouched() {
        let mut scratch = Scratch::default();
        let mut stored = group(&[("f1", "v1"), ("f2", "v2")], Expiry::Never);
        let delta = group(&[("f1", "v9")], Expiry::Never);

        stored.update(&delta, &mut scratch).unwrap();

        assert_eq!(stored.values[1], b("v2"));
    }

    #[test]
    fn update_replaces_expiry() {
        let mut scratch = Scratch::default();
        let mut stored = group(&[("f", "v")], Expiry::At(100));
        let delta = group(&[("f", "v2")], Expiry::At(200));

        stored.update(&delta, &mut scratch).unwrap();
        assert_eq!(stored.expiry, Expiry::At(200));
    }

    #[test]
    fn update_keeps_expiry_when_delta_unspecified() {
        let mut scratch = Scratch::default();
        let mut stored = group(&[("f", "v")], Expiry::At(100));
        let delta = group(&[("f", "v2")], Expiry::Unspecified);

        stored.update(&delta, &mut scratch).unwrap();
        assert_eq!(stored.expiry, Expiry::At(100));
    }

    #[test]
    fn update_rejects_mismatched_operands() {
        let mut scratch = Scratch::default();
        let mut broken = group(&[("f", "v")], Expiry::Never);
        broken.values.pop();

        let delta = group(&[("f", "v2")], Expiry::Never);
        assert!(broken.update(&delta, &mut scratch).is_err());

        let mut stored = group(&[("f", "v")], Expiry::Never);
        let mut broken_delta = group(&[("g", "w")], Expiry::Never);
        broken_delta.fields.pop();
        assert!(stored.update(&broken_delta, &mut scratch).is_err());
        // The stored side must be untouched after a rejected merge.
        assert_eq!(stored.values, vec![b("v")]);
    }

    // --- select ---

    #[test]
    fn select_preserves_original_order() {
        let mut scratch = Scratch::default();
        let mut vg = group(&[("a", "1"), ("b", "2"), ("c", "3")], Expiry::Never);

        vg.select(&[b("c"), b("a")], &mut scratch);

        assert_eq!(vg.fields, vec![b("a"), b("c")]);
        assert_eq!(vg.values, vec![b("1"), b("3")]);
    }

    #[test]
    fn select_silently_ignores_absent_fields() {
        let mut scratch = Scratch::default();
        let mut vg = group(&[("a", "1")], Expiry::Never);

        vg.select(&[b("a"), b("missing")], &mut scratch);

        assert_eq!(vg.len(), 1);
        assert_eq!(vg.fields, vec![b("a")]);
    }

    #[test]
    fn select_to_nothing_yields_empty_group() {
        let mut scratch = Scratch::default();
        let mut vg = group(&[("a", "1")], Expiry::Never);

        vg.select(&[b("x")], &mut scratch);
        assert!(vg.is_empty());
    }

    // --- del ---

    #[test]
    fn del_removes_named_fields_only() {
        let mut scratch = Scratch::default();
        let mut vg = group(&[("a", "1"), ("b", "2"), ("c", "3")], Expiry::Never);

        vg.del(&[b("b")], &mut scratch);

        assert_eq!(vg.fields, vec![b("a"), b("c")]);
        assert_eq!(vg.values, vec![b("1"), b("3")]);
    }

    #[test]
    fn del_of_absent_field_is_a_no_op() {
        let mut scratch = Scratch::default();
        let mut vg = group(&[("a", "1")], Expiry::Never);

        vg.del(&[b("z")], &mut scratch);
        assert_eq!(vg.len(), 1);
    }

    // --- invariants ---

    #[test]
    fn validate_flags_diverged_sequences() {
        let mut vg = group(&[("a", "1")], Expiry::Never);
        assert!(vg.validate().is_ok());

        vg.fields.push(b("b"));
        assert!(matches!(
            vg.validate(),
            Err(HangarError::FieldValueMismatch {
                fields: 2,
                values: 1
            })
        ));
    }

    #[test]
    fn empty_group_reads_as_absent() {
        let vg = ValGroup::new();
        assert!(vg.is_empty());
        assert!(!vg.is_expired(u64::MAX));
    }
}
