#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// Incremental hasher, used to digest a block or message payload
/// that is fed in more than one chunk.
pub struct Context(blake3::Hasher);

/// The digest of a candidate block or protocol message.
///
/// `Digest::none()` is the reserved all-zero value used as the
/// digest of a null request (§4.4 of the replication engine's spec).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Context {
    /// Creates a new, empty hashing context.
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    /// Feeds more data into the hashing context.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    /// Consumes the context, producing a final `Digest`.
    pub fn finish(self) -> Digest {
        let hash = self.0.finalize();
        Digest(*hash.as_bytes())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest {
    pub const LENGTH: usize = 32;

    /// Hashes `raw_bytes` in one shot.
    pub fn from_data(raw_bytes: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(raw_bytes);
        ctx.finish()
    }

    /// Parses a `Digest` out of a raw byte buffer of the right length.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }

    /// The reserved digest of a null (no-op) request.
    pub const fn none() -> Self {
        Self([0u8; Self::LENGTH])
    }

    /// Returns `true` if this is the reserved null-request digest.
    pub fn is_none(&self) -> bool {
        self.0 == [0u8; Self::LENGTH]
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_equal() {
        let a = Digest::from_data(b"block-one");
        let b = Digest::from_data(b"block-one");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_hash_different() {
        let a = Digest::from_data(b"block-one");
        let b = Digest::from_data(b"block-two");
        assert_ne!(a, b);
    }

    #[test]
    fn none_digest_is_recognized() {
        assert!(Digest::none().is_none());
        assert!(!Digest::from_data(b"anything").is_none());
    }
}
