//! Hangar Core — sparse record data model, merge algebra, and codec contract.

pub mod codec;
pub mod error;
pub mod scratch;
pub mod types;
pub mod valgroup;

pub use codec::{BinaryCodec, Codec};
pub use error::HangarError;
pub use scratch::{Scratch, ScratchPool};
pub use types::{Expiry, FieldSelector, Key, KeyGroup, PlaneId, ValGroupResult};
pub use valgroup::ValGroup;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
