use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// A replica's secret key material.
pub struct KeyPair(Ed25519KeyPair);

/// A replica's public key, used to verify messages signed with the
/// matching [`KeyPair`].
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PublicKey(Vec<u8>);

/// A detached Ed25519 signature.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone)]
pub struct Signature([u8; Signature::LENGTH]);

impl KeyPair {
    pub const LENGTH: usize = 32;

    /// Generates a fresh key pair, backed by the system RNG.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).wrapped(ErrorKind::CryptoSignature)?;
        let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).wrapped(ErrorKind::CryptoSignature)?;
        Ok(Self(kp))
    }

    /// Loads a key pair from its PKCS#8 encoding.
    pub fn from_bytes(pkcs8: &[u8]) -> Result<Self> {
        let kp = Ed25519KeyPair::from_pkcs8(pkcs8).wrapped(ErrorKind::CryptoSignature)?;
        Ok(Self(kp))
    }

    /// Returns the public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key().as_ref().to_vec())
    }

    /// Signs an arbitrary message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.0.sign(message);
        let mut inner = [0; Signature::LENGTH];
        inner.copy_from_slice(sig.as_ref());
        Signature(inner)
    }
}

impl PublicKey {
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != KeyPair::LENGTH {
            return Err("Public key has an invalid length").wrapped(ErrorKind::CryptoSignature);
        }
        Ok(Self(raw_bytes.to_vec()))
    }

    /// Verifies a `signature` over `message` was produced by the
    /// matching secret key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = signature::UnparsedPublicKey::new(&signature::ED25519, &self.0);
        key.verify(message, signature.as_ref())
            .simple(ErrorKind::CryptoSignature)
    }
}

impl From<PublicKey> for Vec<u8> {
    fn from(pk: PublicKey) -> Vec<u8> {
        pk.0
    }
}

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Signature has an invalid length").wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
