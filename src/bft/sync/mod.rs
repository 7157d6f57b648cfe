//! The view-change and new-view subprotocol (C6, §4.6): what happens
//! when a replica suspects the current primary, and how a quorum of
//! replicas agrees on a replacement.

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::{
    CheckpointMessage, NewViewMessage, PEntry, QEntry, SystemMessage, ViewChangeMessage,
};
use crate::bft::communication::{NodeId, Transport};
use crate::bft::config::ViewInfo;
use crate::bft::crypto::hash::Digest;
use crate::bft::log::CertStore;
use crate::bft::ordering::{Orderable, SeqNo};

/// Whether the replica is processing requests normally, or is
/// currently mid view-change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncPhase {
    Normal,
    ViewChanging,
}

/// Outcome of feeding a `ViewChange` message to the synchronizer.
pub enum ViewChangeStatus {
    /// Still waiting for more votes.
    Collecting,
    /// `f+1` distinct senders are advancing past our current view;
    /// the caller should fast-forward, send its own `ViewChange`, and
    /// cancel the new-view timer.
    FastForward(SeqNo),
    /// A full quorum of `ViewChange` messages for `new_view` has been
    /// collected; the caller is the primary-elect and should build and
    /// broadcast the `NewView`.
    QuorumReached(SeqNo),
}

/// Outcome of validating an incoming `NewView` message.
pub enum NewViewStatus {
    /// The proof failed to verify, or the primary's `xset` disagrees
    /// with what can be independently derived from the proof: a
    /// further view-change must be triggered.
    Invalid,
    /// Some entries of `xset` reference blocks this replica doesn't
    /// have yet; these digests must be fetched before proceeding.
    Missing(Vec<Digest>),
    /// The new view may be installed: watermarks should advance to
    /// `min_s`, and a synthetic `PrePrepare` injected for every entry
    /// of `xset`.
    Install {
        min_s: SeqNo,
        xset: Vec<(SeqNo, Option<Digest>)>,
    },
}

/// Tracks in-flight view-changes and the votes gathered so far.
pub struct Synchronizer {
    phase: SyncPhase,
    /// `viewChangeStore[(newView, fromReplica)]`.
    store: HashMap<SeqNo, HashMap<NodeId, ViewChangeMessage>>,
    /// Highest `newView` for which this replica has itself sent a
    /// `ViewChange`, used to detect duplicate fast-forwards.
    sent_for: Option<SeqNo>,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Normal,
            store: collections::hash_map(),
            sent_for: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Builds and broadcasts this replica's `ViewChange` for
    /// `view.next_view()`, grounded on the certificate store's PQ-sets.
    pub fn begin_view_change<B>(
        &mut self,
        view: &ViewInfo,
        last_stable: SeqNo,
        checkpoint_proof: Vec<CheckpointMessage>,
        certs: &CertStore,
        me: NodeId,
        transport: &dyn Transport<B>,
    ) -> ViewChangeMessage {
        self.phase = SyncPhase::ViewChanging;
        let new_view = view.next_view().sequence_number();
        self.sent_for = Some(new_view);

        let pset: Vec<PEntry> = certs.pset_above(last_stable);
        let qset: Vec<QEntry> = certs.qset_above_unprepared(last_stable);

        let message = ViewChangeMessage::new(new_view, last_stable, checkpoint_proof, pset, qset);
        self.record(new_view, me, message.clone());

        let (n, _f) = view.params();
        let targets: Vec<NodeId> = NodeId::targets(0..n as u32).filter(|id| *id != me).collect();
        let _ = transport.broadcast(SystemMessage::ViewChange(message.clone()), targets);
        message
    }

    fn record(&mut self, new_view: SeqNo, sender: NodeId, message: ViewChangeMessage) {
        self.store
            .entry(new_view)
            .or_insert_with(collections::hash_map)
            .insert(sender, message);
    }

    /// Feeds a received `ViewChange` into the vote store.
    pub fn receive_view_change(
        &mut self,
        sender: NodeId,
        message: ViewChangeMessage,
        view: &ViewInfo,
    ) -> ViewChangeStatus {
        let new_view = message.new_view();
        self.record(new_view, sender, message);

        let (n, f) = view.params();
        let votes = &self.store[&new_view];

        if new_view > view.sequence_number() {
            if votes.len() >= f + 1 && self.sent_for != Some(new_view) {
                return ViewChangeStatus::FastForward(new_view);
            }
        }

        let commit_quorum = (n + f + 2) / 2;
        if votes.len() >= commit_quorum {
            ViewChangeStatus::QuorumReached(new_view)
        } else {
            ViewChangeStatus::Collecting
        }
    }

    /// Constructs the `NewView` message, run by the primary-elect once
    /// a quorum of `ViewChange`s for `new_view` has been collected
    /// (§4.6's xset selection rule).
    pub fn construct_new_view(&self, new_view: SeqNo, view: &ViewInfo) -> NewViewMessage {
        let votes: Vec<ViewChangeMessage> = self.store[&new_view].values().cloned().collect();
        let (min_s, max_s) = watermark_bounds(&votes);
        let (_n, f) = view.params();

        let mut xset = Vec::new();
        let mut seq = min_s.next();
        while seq <= max_s {
            let digest = select_digest(&votes, seq, f);
            xset.push((seq, digest));
            seq = seq.next();
        }

        NewViewMessage::new(new_view, votes, xset)
    }

    /// Validates an incoming `NewView`, recomputing `xset` from its
    /// own proof and comparing against what the primary claimed.
    pub fn receive_new_view(&mut self, message: &NewViewMessage, view: &ViewInfo) -> NewViewStatus {
        let (n, f) = view.params();
        let commit_quorum = (n + f + 2) / 2;
        if message.view_change_proof().len() < commit_quorum {
            return NewViewStatus::Invalid;
        }
        if message
            .view_change_proof()
            .iter()
            .any(|vc| vc.new_view() != message.new_view())
        {
            return NewViewStatus::Invalid;
        }

        let (min_s, _max_s) = watermark_bounds(message.view_change_proof());
        let recomputed = self.construct_new_view(message.new_view(), view);
        if recomputed.xset() != message.xset() {
            return NewViewStatus::Invalid;
        }

        NewViewStatus::Install {
            min_s,
            xset: message.xset().to_vec(),
        }
    }

    /// Marks the view as installed and returns to normal operation.
    pub fn finalize_view_change(&mut self, new_view: SeqNo) {
        self.phase = SyncPhase::Normal;
        self.sent_for = None;
        self.store.retain(|v, _| *v > new_view);
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

/// `minS`/`maxS` as defined by §4.6: the lowest `lastStable` and the
/// highest prepared sequence number across the view-change proof.
fn watermark_bounds(votes: &[ViewChangeMessage]) -> (SeqNo, SeqNo) {
    let min_s = votes
        .iter()
        .map(|vc| vc.last_stable())
        .min()
        .unwrap_or(SeqNo::ZERO);
    let max_s = votes
        .iter()
        .flat_map(|vc| vc.pset().iter().map(|p| p.seq))
        .max()
        .unwrap_or(min_s);
    (min_s, max_s)
}

/// Selects `xset[seq]` per §4.6: a digest `d` is chosen if some vote's
/// P-set has `(seq, d)` at a given view, and at least `f+1` of the
/// votes either have no P-set entry at `seq`, or one at a
/// view no later than that pair's, with `qset` coverage of a
/// `2f+1` quorum for `d`. Otherwise the slot is a null request.
fn select_digest(votes: &[ViewChangeMessage], seq: SeqNo, f: usize) -> Option<Digest> {
    for vc in votes {
        let candidate = match vc.pset().iter().find(|p| p.seq == seq) {
            Some(p) => p,
            None => continue,
        };

        let covering = votes
            .iter()
            .filter(|other| match other.pset().iter().find(|p| p.seq == seq) {
                None => true,
                Some(p) => p.view <= candidate.view,
            })
            .count();
        if covering < f + 1 {
            continue;
        }

        let qset_quorum = 2 * f + 1;
        let qset_coverage = votes
            .iter()
            .filter(|other| {
                other
                    .qset()
                    .iter()
                    .any(|q| q.seq == seq && q.digest == candidate.digest)
            })
            .count();
        if qset_coverage >= qset_quorum {
            return Some(candidate.digest);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(tag: &[u8]) -> Digest {
        Digest::from_data(tag)
    }

    #[test]
    fn watermark_bounds_take_min_and_max() {
        let votes = vec![
            ViewChangeMessage::new(
                SeqNo::from(1),
                SeqNo::from(10),
                vec![],
                vec![PEntry {
                    seq: SeqNo::from(12),
                    view: SeqNo::ZERO,
                    digest: digest(b"a"),
                }],
                vec![],
            ),
            ViewChangeMessage::new(SeqNo::from(1), SeqNo::from(5), vec![], vec![], vec![]),
        ];
        let (min_s, max_s) = watermark_bounds(&votes);
        assert_eq!(min_s, SeqNo::from(5));
        assert_eq!(max_s, SeqNo::from(12));
    }

    #[test]
    fn select_digest_returns_none_without_qset_quorum() {
        let votes = vec![ViewChangeMessage::new(
            SeqNo::from(1),
            SeqNo::ZERO,
            vec![],
            vec![PEntry {
                seq: SeqNo::from(1),
                view: SeqNo::ZERO,
                digest: digest(b"a"),
            }],
            vec![],
        )];
        assert_eq!(select_digest(&votes, SeqNo::from(1), 1), None);
    }
}
