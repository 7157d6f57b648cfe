//! Communication primitives: node identity, the message wire format, and
//! the `Transport` collaborator contract (§6) through which the engine
//! reaches the surrounding peer-to-peer layer.

pub mod message;

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::message::{Header, SystemMessage};
use crate::bft::crypto::signature::{KeyPair, PublicKey};
use crate::bft::error::*;

/// A `NodeId` represents the id of a process in the BFT system.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// The transport collaborator contract (§6): `broadcast`/`unicast` are
/// best-effort and asynchronous from the engine's point of view —
/// delivery to the local replica comes back as a fresh queued event,
/// never as a direct call back into the engine.
///
/// Implementations are expected to return quickly; anything that could
/// block belongs behind a background task that posts its own event.
pub trait Transport<B>: Send + Sync {
    /// Best-effort delivery to every other replica.
    fn broadcast(&self, message: SystemMessage<B>, targets: Vec<NodeId>) -> Result<()>;

    /// Best-effort delivery to a single replica.
    fn unicast(&self, message: SystemMessage<B>, target: NodeId) -> Result<()>;
}

/// Signs and validates the sender identity half of the wire format
/// (§4.1): `Node` does not own sockets, it only carries the key
/// material needed to stamp and check headers handed to it by a
/// `Transport` implementation.
pub struct Node {
    id: NodeId,
    my_key: Arc<KeyPair>,
    peer_keys: Arc<HashMap<NodeId, PublicKey>>,
}

/// Bootstraps a [`Node`]'s identity material. Connection setup itself
/// is the transport collaborator's problem, not this crate's.
pub struct NodeConfig {
    /// The number of nodes allowed to fail in the system; BFT systems
    /// typically set this to 1.
    pub f: usize,
    /// The id of this node.
    pub id: NodeId,
    /// The public keys of every replica in the system, including this
    /// one.
    pub pk: HashMap<NodeId, PublicKey>,
    /// The secret key of this particular node.
    pub sk: KeyPair,
}

impl Node {
    pub fn bootstrap(cfg: NodeConfig) -> Result<Self> {
        if cfg.pk.len() < 3 * cfg.f + 1 {
            return Err("Invalid number of replicas").wrapped(ErrorKind::Communication);
        }
        if !cfg.pk.contains_key(&cfg.id) {
            return Err("Invalid node ID").wrapped(ErrorKind::Communication);
        }
        Ok(Self {
            id: cfg.id,
            my_key: Arc::new(cfg.sk),
            peer_keys: Arc::new(cfg.pk),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stamps a header for an outbound message to `to`.
    pub fn sign_header(&self, to: NodeId, length: u64, payload: &[u8]) -> Header {
        let signature = self.my_key.sign(payload);
        Header::new(self.id, to, length, signature)
    }

    /// Checks a header's embedded sender against the transport-observed
    /// sender and its signature against the known public key for that
    /// sender. This is the codec's one job (§4.1); everything else is
    /// the state machine's responsibility.
    pub fn verify_header(&self, header: &Header, observed: NodeId, payload: &[u8]) -> Result<()> {
        if !header.sender_matches(observed) {
            return Err("Header sender does not match observed sender")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        let key = self
            .peer_keys
            .get(&header.from())
            .ok_or("Unknown message sender")
            .wrapped(ErrorKind::CommunicationMessage)?;
        key.verify(payload, &header.signature())
    }
}
