use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// Incremental hasher, used to digest a block or message payload
/// that is fed in more than one chunk.
pub struct Context(digest::Context);

/// The digest of a candidate block or protocol message.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Context {
    pub fn new() -> Self {
        Self(digest::Context::new(&SHA256))
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finish(self) -> Digest {
        let digest = self.0.finish();
        Digest::from_bytes(digest.as_ref()).expect("SHA256 output has a fixed, valid length")
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    pub fn from_data(raw_bytes: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(raw_bytes);
        ctx.finish()
    }

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
