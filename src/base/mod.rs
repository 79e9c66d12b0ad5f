//! This module contains base types that are used across Warden.
use std::fmt;

mod error;
pub mod utils;

pub use error::{WardenError, WardenResult};

use serde::{Deserialize, Serialize};

use crate::base::utils::HexBytes;

/// A lock key as carried on the wire. Opaque 16 bytes; equality and hashing
/// are byte-wise. The little-endian word at bytes `[8..16]` addresses the
/// fast key index (see [`crate::engine`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockKey(pub [u8; 16]);

impl LockKey {
    /// The word used to derive the fast-index segment and slot for this key.
    #[inline]
    pub(crate) fn index_word(&self) -> u64 {
        u64::from_le_bytes(self.0[8..16].try_into().expect("eight bytes"))
    }
}

impl fmt::Debug for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockKey({:?})", HexBytes(&self.0))
    }
}

/// Identifies a specific holder or waiter within a key. Opaque 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockId(pub [u8; 16]);

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({:?})", HexBytes(&self.0))
    }
}

/// Correlates a result frame with the request that caused it. Echoed back
/// verbatim in every response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 16]);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({:?})", HexBytes(&self.0))
    }
}
