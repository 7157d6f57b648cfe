//! This module contains the six wire messages traded between replicas,
//! plus the `Header` that carries routing and identity metadata for
//! every one of them (§4.1 of the replication engine's spec).

use std::mem::MaybeUninit;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo};

/// A header that is sent alongside every message in transit.
///
/// The codec's one job (§4.1) is to check that `from` matches the
/// transport-observed sender; everything else is the state machine's
/// responsibility.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Header {
    version: u32,
    from: u32,
    to: u32,
    length: u64,
    signature: [u8; Signature::LENGTH],
}

impl Header {
    pub const LENGTH: usize = std::mem::size_of::<Self>();
    pub const CURRENT_VERSION: u32 = 0;

    pub fn new(from: NodeId, to: NodeId, length: u64, signature: Signature) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            from: from.into(),
            to: to.into(),
            length,
            signature: unsafe { std::mem::transmute_copy(&signature) },
        }
    }

    pub fn from(&self) -> NodeId {
        NodeId::from(self.from)
    }

    pub fn to(&self) -> NodeId {
        NodeId::from(self.to)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn signature(&self) -> Signature {
        unsafe { std::mem::transmute_copy(&self.signature) }
    }

    /// Checks that the sender embedded in this header matches the
    /// sender the transport layer actually observed the bytes come
    /// from. A mismatch is a malformed message (§7) and must be
    /// dropped before it ever reaches the state machine.
    pub fn sender_matches(&self, observed: NodeId) -> bool {
        self.from() == observed
    }

    unsafe fn serialize_into_unchecked(self, buf: &mut [u8]) {
        #[cfg(target_endian = "big")]
        let this = Header {
            version: self.version.to_le(),
            from: self.from.to_le(),
            to: self.to.to_le(),
            length: self.length.to_le(),
            signature: self.signature,
        };
        #[cfg(not(target_endian = "big"))]
        let this = self;
        let hdr: [u8; Self::LENGTH] = std::mem::transmute(this);
        buf[..Self::LENGTH].copy_from_slice(&hdr[..]);
    }

    pub fn serialize_into(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { self.serialize_into_unchecked(buf) })
    }

    unsafe fn deserialize_from_unchecked(buf: &[u8]) -> Self {
        let mut hdr: [u8; Self::LENGTH] = MaybeUninit::uninit().assume_init();
        hdr.copy_from_slice(&buf[..Self::LENGTH]);
        let this: Self = std::mem::transmute(hdr);
        #[cfg(target_endian = "big")]
        let this = Header {
            version: this.version.to_be(),
            from: this.from.to_be(),
            to: this.to.to_be(),
            length: this.length.to_be(),
            signature: this.signature,
        };
        this
    }

    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { Self::deserialize_from_unchecked(buf) })
    }
}

/// A `SystemMessage` is one of the consensus/view-change/checkpoint/cst
/// protocol messages traded between replicas.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage<B> {
    Consensus(ConsensusMessage<B>),
    Checkpoint(CheckpointMessage),
    ViewChange(ViewChangeMessage),
    NewView(NewViewMessage),
    Cst(CstMessage<B>),
}

/// Pre-prepare / prepare / commit, the three phases of normal-case
/// operation (§4.4).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ConsensusMessage<B> {
    view: SeqNo,
    seq: SeqNo,
    kind: ConsensusMessageKind<B>,
}

#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ConsensusMessageKind<B> {
    /// Carries the candidate block itself, along with its digest, as
    /// required by §4.1; `None` marks a null-request keep-alive.
    PrePrepare(Digest, Option<B>),
    Prepare(Digest),
    Commit(Digest),
}

impl<B> ConsensusMessage<B> {
    pub fn new(view: SeqNo, seq: SeqNo, kind: ConsensusMessageKind<B>) -> Self {
        Self { view, seq, kind }
    }

    pub fn view(&self) -> SeqNo {
        self.view
    }

    pub fn kind(&self) -> &ConsensusMessageKind<B> {
        &self.kind
    }

    pub fn into_kind(self) -> ConsensusMessageKind<B> {
        self.kind
    }

    /// The digest this message is voting for, regardless of phase.
    pub fn digest(&self) -> &Digest {
        match &self.kind {
            ConsensusMessageKind::PrePrepare(d, _) => d,
            ConsensusMessageKind::Prepare(d) => d,
            ConsensusMessageKind::Commit(d) => d,
        }
    }
}

impl<B> Orderable for ConsensusMessage<B> {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// A local or received checkpoint vote (§4.1, §4.5).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CheckpointMessage {
    seq: SeqNo,
    state_id: Digest,
}

impl CheckpointMessage {
    pub fn new(seq: SeqNo, state_id: Digest) -> Self {
        Self { seq, state_id }
    }

    pub fn state_id(&self) -> &Digest {
        &self.state_id
    }
}

impl Orderable for CheckpointMessage {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// One entry of a replica's P-set: the last "prepared" decision at a
/// given sequence number (§4.6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct PEntry {
    pub seq: SeqNo,
    pub view: SeqNo,
    pub digest: Digest,
}

/// One entry of a replica's Q-set: the last "pre-prepared" decision
/// for a given `(digest, seq)` pair (§4.6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct QEntry {
    pub seq: SeqNo,
    pub view: SeqNo,
    pub digest: Digest,
}

/// A `VIEW-CHANGE` message (§4.1, §4.6).
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ViewChangeMessage {
    new_view: SeqNo,
    last_stable: SeqNo,
    checkpoint_proof: Vec<CheckpointMessage>,
    pset: Vec<PEntry>,
    qset: Vec<QEntry>,
}

impl ViewChangeMessage {
    pub fn new(
        new_view: SeqNo,
        last_stable: SeqNo,
        checkpoint_proof: Vec<CheckpointMessage>,
        pset: Vec<PEntry>,
        qset: Vec<QEntry>,
    ) -> Self {
        Self {
            new_view,
            last_stable,
            checkpoint_proof,
            pset,
            qset,
        }
    }

    pub fn new_view(&self) -> SeqNo {
        self.new_view
    }

    pub fn last_stable(&self) -> SeqNo {
        self.last_stable
    }

    pub fn checkpoint_proof(&self) -> &[CheckpointMessage] {
        &self.checkpoint_proof
    }

    pub fn pset(&self) -> &[PEntry] {
        &self.pset
    }

    pub fn qset(&self) -> &[QEntry] {
        &self.qset
    }
}

/// A `NEW-VIEW` message (§4.1, §4.6): the primary-elect's proof that a
/// quorum agreed to move to `new_view`, plus the replay window.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct NewViewMessage {
    new_view: SeqNo,
    view_change_proof: Vec<ViewChangeMessage>,
    xset: Vec<(SeqNo, Option<Digest>)>,
}

impl NewViewMessage {
    pub fn new(
        new_view: SeqNo,
        view_change_proof: Vec<ViewChangeMessage>,
        xset: Vec<(SeqNo, Option<Digest>)>,
    ) -> Self {
        Self {
            new_view,
            view_change_proof,
            xset,
        }
    }

    pub fn new_view(&self) -> SeqNo {
        self.new_view
    }

    pub fn view_change_proof(&self) -> &[ViewChangeMessage] {
        &self.view_change_proof
    }

    pub fn xset(&self) -> &[(SeqNo, Option<Digest>)] {
        &self.xset
    }
}

/// Messages exchanged by the collaborative state-transfer sub-protocol
/// (§4.7); not one of the six consensus messages, but traded on the
/// same wire and subject to the same sender check.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum CstMessage<B> {
    RequestLatestSeq,
    ReplyLatestSeq(SeqNo),
    RequestState,
    /// Carries the checkpoint's sequence number, its commitment, the
    /// application state serialized by the responder (`Service::State`
    /// has no `AsRef<[u8]>` bound of its own, unlike `Block`), and the
    /// blocks committed after that checkpoint.
    ReplyState(SeqNo, Digest, Vec<u8>, Vec<B>),
    RequestBlock(Digest),
    ReplyBlock(Digest, Option<B>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::signature::Signature;

    #[test]
    fn header_round_trips_through_bytes() {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..])
            .expect("zeroed buffer is a valid signature length");
        let old_header = Header::new(NodeId::from(0), NodeId::from(3), 20, signature);
        let mut buf = [0; Header::LENGTH];
        old_header.serialize_into(&mut buf[..]).expect("serialize failed");
        let new_header = Header::deserialize_from(&buf[..]).expect("deserialize failed");
        assert_eq!(old_header, new_header);
    }

    #[test]
    fn sender_mismatch_is_detected() {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..]).unwrap();
        let header = Header::new(NodeId::from(1), NodeId::from(2), 0, signature);
        assert!(header.sender_matches(NodeId::from(1)));
        assert!(!header.sender_matches(NodeId::from(7)));
    }
}
