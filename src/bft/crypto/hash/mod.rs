//! Message and block digests.
//!
//! The concrete hash backend is chosen at compile time via Cargo
//! features, the same way the rest of the crypto stack is pluggable.

#[cfg(feature = "crypto_hash_blake3_blake3")]
mod blake3_blake3;
#[cfg(feature = "crypto_hash_blake3_blake3")]
pub use blake3_blake3::{Context, Digest};

#[cfg(all(feature = "crypto_hash_ring_sha2", not(feature = "crypto_hash_blake3_blake3")))]
mod ring_sha2;
#[cfg(all(feature = "crypto_hash_ring_sha2", not(feature = "crypto_hash_blake3_blake3")))]
pub use ring_sha2::{Context, Digest};
