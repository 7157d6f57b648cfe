//! Replica configuration and view bookkeeping (§3).
//!
//! `ReplicaConfig` is validated once, at construction time, the same
//! way `communication::NodeConfig` is validated by `Node::bootstrap` —
//! there is no separate config-file format for this crate to parse;
//! the surrounding application is expected to build the struct from
//! whatever format it likes and hand it over.

use std::collections::HashMap;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::crypto::signature::{KeyPair, PublicKey};
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// Static parameters of the replica group, plus this replica's own
/// identity material.
pub struct ReplicaConfig {
    /// This replica's id.
    pub id: NodeId,
    /// Total number of replicas, `N`. Must satisfy `N >= 3f + 1`.
    pub n: usize,
    /// Maximum number of Byzantine replicas tolerated.
    pub f: usize,
    /// Checkpoint period `K`: a local checkpoint is taken every `K`
    /// executed sequence numbers.
    pub k: u32,
    /// Log window size `L`: the high watermark is `h + L`.
    pub l: u32,
    /// Sequence number at which a planned view-change is forced, used
    /// to test primary hand-off; `None` disables the planned handover.
    pub view_change_seqno: Option<SeqNo>,
    /// If set, a view-change is automatically triggered after this
    /// many consensus instances have elapsed in the same view, even
    /// absent a timeout (§9, open question (a): the reference source
    /// appears to force this to 30 unconditionally; this crate instead
    /// makes it an explicit, honest configuration knob — see
    /// DESIGN.md).
    pub view_change_period: Option<u32>,
    /// Enables deliberately Byzantine behaviour for testing (§3): when
    /// set, the replica's own digest computation may diverge from the
    /// honest rule so test harnesses can exercise conflict handling.
    pub byzantine: bool,
    /// Public keys of every replica, including this one.
    pub pk: HashMap<NodeId, PublicKey>,
    /// This replica's secret key.
    pub sk: KeyPair,
}

impl ReplicaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n < 3 * self.f + 1 {
            return Err("n must be at least 3f + 1").wrapped(ErrorKind::ReplicaConfig);
        }
        if usize::from(self.id) >= self.n {
            return Err("replica id is out of range").wrapped(ErrorKind::ReplicaConfig);
        }
        if self.k == 0 {
            return Err("checkpoint period must be positive").wrapped(ErrorKind::ReplicaConfig);
        }
        if self.l == 0 {
            return Err("log window size must be positive").wrapped(ErrorKind::ReplicaConfig);
        }
        if self.pk.len() != self.n {
            return Err("exactly one public key is required per replica")
                .wrapped(ErrorKind::ReplicaConfig);
        }
        Ok(())
    }
}

/// View-dependent parameters, recomputed whenever the view changes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug)]
pub struct ViewInfo {
    view: SeqNo,
    n: usize,
    f: usize,
}

impl ViewInfo {
    pub fn new(view: SeqNo, n: usize, f: usize) -> Result<Self> {
        if n < 3 * f + 1 {
            return Err("n must be at least 3f + 1").wrapped(ErrorKind::ReplicaConfig);
        }
        Ok(Self { view, n, f })
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.view
    }

    pub fn params(&self) -> (usize, usize) {
        (self.n, self.f)
    }

    /// The id of the primary replica for this view: `view mod N`.
    pub fn leader(&self) -> NodeId {
        let view: u32 = self.view.into();
        NodeId::from(view % (self.n as u32))
    }

    pub fn is_leader(&self, id: NodeId) -> bool {
        self.leader() == id
    }

    /// Number of distinct replica votes (other than the implicit one
    /// from the pre-prepare) required to consider an entry prepared:
    /// `⌈(N+f)/2⌉`.
    pub fn prepare_quorum(&self) -> usize {
        (self.n + self.f + 1) / 2
    }

    /// Number of distinct replica votes required to consider an entry
    /// committed: `⌊(N+f+2)/2⌋`, which reduces to `2f+1` when
    /// `N = 3f+1`.
    pub fn commit_quorum(&self) -> usize {
        (self.n + self.f + 2) / 2
    }

    /// Returns a `ViewInfo` for the next view, in the same group.
    pub fn next_view(&self) -> Self {
        Self {
            view: self.view.next(),
            n: self.n,
            f: self.f,
        }
    }

    /// Returns a `ViewInfo` pinned to a specific view number, in the
    /// same group; used when fast-forwarding to a view announced by
    /// `f+1` other replicas.
    pub fn with_view(&self, view: SeqNo) -> Self {
        Self {
            view,
            n: self.n,
            f: self.f,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// §8's agreement invariant, reduced to its quorum-math root: for
        /// any valid `(n, f)`, two commit quorums out of `n` replicas must
        /// overlap in at least `f + 1` replicas, so every pair of commit
        /// certificates shares at least one honest witness.
        #[test]
        fn commit_quorums_always_overlap_on_an_honest_replica(f in 0usize..20, extra in 0usize..20) {
            let n = 3 * f + 1 + extra;
            let view = ViewInfo::new(SeqNo::ZERO, n, f).unwrap();
            let pq = view.prepare_quorum();
            let cq = view.commit_quorum();
            prop_assert!(cq <= n);
            prop_assert!(pq <= cq);
            let overlap = 2 * cq as isize - n as isize;
            prop_assert!(overlap >= (f + 1) as isize);
        }
    }

    #[test]
    fn leader_rotates_with_view() {
        let view = ViewInfo::new(SeqNo::ZERO, 4, 1).unwrap();
        assert_eq!(view.leader(), NodeId::from(0));
        assert_eq!(view.next_view().leader(), NodeId::from(1));
    }

    #[test]
    fn quorum_sizes_match_n_3f_plus_1() {
        let view = ViewInfo::new(SeqNo::ZERO, 4, 1).unwrap();
        assert_eq!(view.prepare_quorum(), 3);
        assert_eq!(view.commit_quorum(), 3);
    }

    #[test]
    fn rejects_insufficient_replicas() {
        assert!(ViewInfo::new(SeqNo::ZERO, 3, 1).is_err());
    }
}
