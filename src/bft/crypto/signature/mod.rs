//! Replica identity and message-authentication primitives.

#[cfg(feature = "crypto_signature_ring_ed25519")]
mod ring_ed25519;
#[cfg(feature = "crypto_signature_ring_ed25519")]
pub use ring_ed25519::{KeyPair, PublicKey, Signature};
