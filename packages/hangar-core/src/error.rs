//! Typed errors shared by every Hangar backend.

use thiserror::Error;

/// Errors produced by the data model, the codec, and backend guards.
///
/// Backend-specific engine failures are wrapped with operation context at
/// the call site (`anyhow::Context`) rather than enumerated here.
#[derive(Debug, Error)]
pub enum HangarError {
    /// A `ValGroup` violated the fields/values lock-step invariant.
    #[error("fields/values length mismatch: {fields} fields, {values} values")]
    FieldValueMismatch {
        /// Number of field names in the group.
        fields: usize,
        /// Number of values in the group.
        values: usize,
    },

    /// An encoded key or value could not be decoded.
    #[error("codec: {0}")]
    Codec(String),

    /// `teardown()` was invoked on a store that was not built in test mode.
    #[error("teardown is only available in test mode")]
    TeardownGuard,

    /// The operation is not implemented by this backend.
    #[error("{op} is not supported by the {store} store")]
    Unsupported {
        /// Operation name (e.g., `"backup"`).
        op: &'static str,
        /// Backend name (e.g., `"cache"`).
        store: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_problem() {
        let err = HangarError::FieldValueMismatch {
            fields: 3,
            values: 2,
        };
        assert!(err.to_string().contains("3 fields"));

        let err = HangarError::Unsupported {
            op: "backup",
            store: "cache",
        };
        assert_eq!(err.to_string(), "backup is not supported by the cache store");
    }
}
