//! The certificate store (C3, §4.3) and watermark & checkpoint
//! manager (C4, §4.5), plus the block, P-set and Q-set stores they
//! share (§3's data model).

use tracing::{debug, error};

use crate::bft::collections::{self, HashMap, HashSet};
use crate::bft::communication::message::{CheckpointMessage, PEntry, QEntry};
use crate::bft::communication::NodeId;
use crate::bft::config::ViewInfo;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{Orderable, SeqNo};

/// One accumulating certificate for a `(view, seq)` pair (§3, §4.3).
struct CertEntry {
    pre_prepare_digest: Option<Digest>,
    prepare: HashSet<NodeId>,
    prepare_digest: Option<Digest>,
    commit: HashSet<NodeId>,
    sent_prepare: bool,
    sent_commit: bool,
}

impl CertEntry {
    fn new() -> Self {
        Self {
            pre_prepare_digest: None,
            prepare: collections::hash_set(),
            prepare_digest: None,
            commit: collections::hash_set(),
            sent_prepare: false,
            sent_commit: false,
        }
    }
}

/// Accumulates PrePrepare/Prepare/Commit votes per `(view, seq)` and
/// answers the `pre-prepared`/`prepared`/`committed` predicates.
pub struct CertStore {
    entries: HashMap<(SeqNo, SeqNo), CertEntry>,
    /// `pset[n]` — last prepared entry at each seq, used to build
    /// view-change messages.
    pset: HashMap<SeqNo, PEntry>,
    /// `qset[(d, n)]` — last pre-prepared entry per `(digest, seq)`.
    qset: HashMap<(Digest, SeqNo), QEntry>,
}

impl CertStore {
    pub fn new() -> Self {
        Self {
            entries: collections::hash_map(),
            pset: collections::hash_map(),
            qset: collections::hash_map(),
        }
    }

    fn entry(&mut self, view: SeqNo, seq: SeqNo) -> &mut CertEntry {
        self.entries.entry((view, seq)).or_insert_with(CertEntry::new)
    }

    /// Records a PrePrepare for `(view, seq, digest)`, updating `qset`.
    /// Returns `false` if a conflicting pre-prepare with a different
    /// digest is already on record (a safety-threatening conflict,
    /// §4.4, that must trigger a view-change).
    pub fn record_pre_prepare(&mut self, view: SeqNo, seq: SeqNo, digest: Digest) -> bool {
        let conflict = {
            let entry = self.entry(view, seq);
            match entry.pre_prepare_digest {
                Some(existing) if existing != digest => true,
                _ => {
                    entry.pre_prepare_digest = Some(digest);
                    false
                }
            }
        };
        if !conflict {
            self.qset.insert((digest, seq), QEntry { seq, view, digest });
        }
        !conflict
    }

    /// Records a Prepare vote from `sender`. Returns `true` if this is
    /// a new vote (not a duplicate from the same sender).
    pub fn record_prepare(&mut self, view: SeqNo, seq: SeqNo, digest: Digest, sender: NodeId) -> bool {
        let entry = self.entry(view, seq);
        entry.prepare_digest = Some(digest);
        entry.prepare.insert(sender)
    }

    /// Records a Commit vote from `sender`. Returns `true` if new.
    pub fn record_commit(&mut self, view: SeqNo, seq: SeqNo, sender: NodeId) -> bool {
        self.entry(view, seq).commit.insert(sender)
    }

    pub fn mark_prepare_sent(&mut self, view: SeqNo, seq: SeqNo) {
        self.entry(view, seq).sent_prepare = true;
    }

    pub fn prepare_sent(&self, view: SeqNo, seq: SeqNo) -> bool {
        self.entries.get(&(view, seq)).map(|e| e.sent_prepare).unwrap_or(false)
    }

    pub fn mark_commit_sent(&mut self, view: SeqNo, seq: SeqNo) {
        self.entry(view, seq).sent_commit = true;
    }

    pub fn commit_sent(&self, view: SeqNo, seq: SeqNo) -> bool {
        self.entries.get(&(view, seq)).map(|e| e.sent_commit).unwrap_or(false)
    }

    /// `pre-prepared(d, v, n)`: either `qset[(d,n)].view = v`, or the
    /// certificate's own pre-prepare matches.
    pub fn is_pre_prepared(&self, view: SeqNo, seq: SeqNo, digest: Digest) -> bool {
        if let Some(q) = self.qset.get(&(digest, seq)) {
            if q.view == view {
                return true;
            }
        }
        self.entries
            .get(&(view, seq))
            .map(|e| e.pre_prepare_digest == Some(digest))
            .unwrap_or(false)
    }

    /// `prepared(d, v, n)`: pre-prepared, and either `pset[n]`
    /// matches, or a quorum of distinct `Prepare` votes for the same
    /// digest has been collected.
    pub fn is_prepared(&self, view: SeqNo, seq: SeqNo, digest: Digest, view_info: &ViewInfo) -> bool {
        if !self.is_pre_prepared(view, seq, digest) {
            return false;
        }
        if let Some(p) = self.pset.get(&seq) {
            if p.view == view && p.digest == digest {
                return true;
            }
        }
        let entry = match self.entries.get(&(view, seq)) {
            Some(e) => e,
            None => return false,
        };
        entry.prepare_digest == Some(digest)
            && entry.prepare.len() >= view_info.prepare_quorum().saturating_sub(1)
    }

    /// `committed(d, v, n)`: prepared, and a quorum of distinct
    /// `Commit` votes has been collected.
    pub fn is_committed(&self, view: SeqNo, seq: SeqNo, digest: Digest, view_info: &ViewInfo) -> bool {
        if !self.is_prepared(view, seq, digest, view_info) {
            return false;
        }
        self.entries
            .get(&(view, seq))
            .map(|e| e.commit.len() >= view_info.commit_quorum())
            .unwrap_or(false)
    }

    /// Stores the prepared PQ entry for `n`, for later view-change use.
    pub fn record_pset(&mut self, entry: PEntry) {
        self.pset.insert(entry.seq, entry);
    }

    pub fn pset_entry(&self, seq: SeqNo) -> Option<&PEntry> {
        self.pset.get(&seq)
    }

    pub fn qset_entry(&self, digest: Digest, seq: SeqNo) -> Option<&QEntry> {
        self.qset.get(&(digest, seq))
    }

    /// All `PEntry` values with `seq > floor`, for building a
    /// view-change's `pset` (§4.6).
    pub fn pset_above(&self, floor: SeqNo) -> Vec<PEntry> {
        self.pset.values().filter(|p| p.seq > floor).cloned().collect()
    }

    /// All `QEntry` values with `seq > floor` that have no matching
    /// prepared entry, for the view-change's `qset` (§4.6).
    pub fn qset_above_unprepared(&self, floor: SeqNo) -> Vec<QEntry> {
        self.qset
            .values()
            .filter(|q| q.seq > floor && self.pset.get(&q.seq).map(|p| p.digest) != Some(q.digest))
            .cloned()
            .collect()
    }

    /// Deletes every certificate, pset and qset entry at or below
    /// `floor` (garbage collection on watermark advance, §4.5).
    pub fn garbage_collect(&mut self, floor: SeqNo) {
        let before = self.entries.len();
        self.entries.retain(|(_, seq), _| *seq > floor);
        self.pset.retain(|seq, _| *seq > floor);
        self.qset.retain(|(_, seq), _| *seq > floor);
        debug!(?floor, removed = before - self.entries.len(), "certificate store garbage collected");
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Candidate blocks keyed by their own digest (§3's `blockStore`), and
/// the subset still awaiting commit (`outstanding`).
pub struct BlockStore<B> {
    blocks: HashMap<Digest, B>,
    outstanding: HashSet<Digest>,
}

impl<B: Clone> BlockStore<B> {
    pub fn new() -> Self {
        Self {
            blocks: collections::hash_map(),
            outstanding: collections::hash_set(),
        }
    }

    pub fn insert(&mut self, digest: Digest, block: B) {
        self.blocks.insert(digest, block);
        self.outstanding.insert(digest);
    }

    pub fn get(&self, digest: &Digest) -> Option<&B> {
        self.blocks.get(digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blocks.contains_key(digest)
    }

    pub fn mark_committed(&mut self, digest: &Digest) {
        self.outstanding.remove(digest);
    }

    pub fn is_outstanding(&self, digest: &Digest) -> bool {
        self.outstanding.contains(digest)
    }

    pub fn outstanding_iter(&self) -> impl Iterator<Item = (&Digest, &B)> {
        self.outstanding.iter().filter_map(move |d| self.blocks.get(d).map(|b| (d, b)))
    }

    pub fn clear_outstanding(&mut self) {
        self.outstanding.clear();
    }

    pub fn remove_below(&mut self, floor: SeqNo, seq_of: impl Fn(&Digest) -> Option<SeqNo>) {
        let stale: Vec<Digest> = self
            .blocks
            .keys()
            .filter(|d| seq_of(d).map(|s| s <= floor).unwrap_or(false))
            .cloned()
            .collect();
        for digest in stale {
            self.blocks.remove(&digest);
            self.outstanding.remove(&digest);
        }
    }
}

impl<B: Clone> Default for BlockStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A locally generated or received checkpoint certificate outcome
/// (§4.5).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CheckpointCert {
    /// Fewer than `f+1` distinct senders agree so far.
    None,
    /// `f+1` or more distinct senders agree on `(seq, stateId)`, but
    /// not (yet) a full quorum matching the local checkpoint.
    Weak {
        seq: SeqNo,
        state_id: Digest,
        senders: Vec<NodeId>,
    },
    /// A full quorum agrees, and it matches what this replica itself
    /// generated: the watermark may advance.
    Stable { seq: SeqNo, state_id: Digest },
}

/// Watermarks, checkpoint stores and fall-behind detection (§4.5).
pub struct CheckpointManager {
    /// Low watermark; valid range is `(h, h+L]`.
    h: SeqNo,
    l: u32,
    k: u32,
    /// `chkpts[seq] = stateId`, locally generated stable points.
    chkpts: HashMap<SeqNo, Digest>,
    /// `checkpointStore`: received checkpoint votes, grouped by seq.
    checkpoint_store: HashMap<SeqNo, HashMap<NodeId, Digest>>,
    /// `hChkpts[replicaId] = seq`, highest observed checkpoint per peer.
    h_chkpts: HashMap<NodeId, SeqNo>,
}

impl CheckpointManager {
    pub fn new(k: u32, l: u32) -> Self {
        Self {
            h: SeqNo::ZERO,
            l,
            k,
            chkpts: collections::hash_map(),
            checkpoint_store: collections::hash_map(),
            h_chkpts: collections::hash_map(),
        }
    }

    pub fn low_watermark(&self) -> SeqNo {
        self.h
    }

    pub fn high_watermark(&self) -> SeqNo {
        self.h.saturating_add(self.l)
    }

    pub fn in_range(&self, seq: SeqNo) -> bool {
        seq > self.h && seq <= self.high_watermark()
    }

    pub fn period(&self) -> u32 {
        self.k
    }

    /// Records a locally generated checkpoint.
    pub fn record_local_checkpoint(&mut self, seq: SeqNo, state_id: Digest) {
        self.chkpts.insert(seq, state_id);
    }

    pub fn local_checkpoint(&self, seq: SeqNo) -> Option<Digest> {
        self.chkpts.get(&seq).copied()
    }

    /// Processes an incoming `CheckpointMessage` (§4.5). Returns
    /// `Err(m)` if out-of-range detection fires (`m` is the new
    /// fall-behind watermark target), otherwise tallies the vote and
    /// reports the resulting certificate state.
    pub fn receive(
        &mut self,
        sender: NodeId,
        msg: &CheckpointMessage,
        f: usize,
        n: usize,
    ) -> Result<CheckpointCert, SeqNo> {
        let seq = msg.sequence_number();

        if seq > self.high_watermark() {
            self.h_chkpts.insert(sender, seq);
            if self.h_chkpts.len() >= f + 1 {
                let mut values: Vec<SeqNo> = self.h_chkpts.values().copied().collect();
                values.sort();
                values.reverse();
                let m = values[f];
                if m > self.high_watermark() {
                    return Err(m);
                }
            }
            return Ok(CheckpointCert::None);
        }

        let votes = self.checkpoint_store.entry(seq).or_insert_with(collections::hash_map);
        votes.insert(sender, *msg.state_id());

        let mut by_digest: HashMap<Digest, Vec<NodeId>> = collections::hash_map();
        for (replica, digest) in votes.iter() {
            by_digest.entry(*digest).or_insert_with(Vec::new).push(*replica);
        }
        if by_digest.len() > f + 1 {
            error!(
                ?seq,
                distinct_digests = by_digest.len(),
                f,
                "more than f+1 distinct checkpoint digests at the same seq: the network \
                 exceeds its assumed fault bound, this replica cannot make safe progress"
            );
            std::process::exit(1);
        }

        let commit_quorum = (n + f + 2) / 2;

        for (digest, senders) in by_digest.into_iter() {
            if senders.len() >= commit_quorum && self.chkpts.get(&seq) == Some(&digest) {
                return Ok(CheckpointCert::Stable { seq, state_id: digest });
            }
            if senders.len() >= f + 1 {
                return Ok(CheckpointCert::Weak {
                    seq,
                    state_id: digest,
                    senders,
                });
            }
        }

        Ok(CheckpointCert::None)
    }

    /// Advances the low watermark to `⌊seq/K⌋·K` and clears any state
    /// tracking below it.
    pub fn advance(&mut self, seq: SeqNo) {
        let floor = seq.rounddown(self.k);
        self.h = floor;
        self.chkpts.retain(|s, _| *s > floor);
        self.checkpoint_store.retain(|s, _| *s > floor);
        self.h_chkpts.retain(|_, s| *s > floor);
        debug!(?floor, "low watermark advanced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ViewInfo {
        ViewInfo::new(SeqNo::ZERO, 4, 1).unwrap()
    }

    #[test]
    fn pre_prepare_then_quorum_of_prepares_is_prepared() {
        let mut store = CertStore::new();
        let view_no = SeqNo::ZERO;
        let seq = SeqNo::from(1);
        let digest = Digest::from_data(b"block");

        assert!(store.record_pre_prepare(view_no, seq, digest));
        assert!(!store.is_prepared(view_no, seq, digest, &view()));

        store.record_prepare(view_no, seq, digest, NodeId::from(1));
        store.record_prepare(view_no, seq, digest, NodeId::from(2));
        assert!(store.is_prepared(view_no, seq, digest, &view()));
    }

    #[test]
    fn conflicting_pre_prepare_is_rejected() {
        let mut store = CertStore::new();
        let view_no = SeqNo::ZERO;
        let seq = SeqNo::from(1);
        let d1 = Digest::from_data(b"one");
        let d2 = Digest::from_data(b"two");

        assert!(store.record_pre_prepare(view_no, seq, d1));
        assert!(!store.record_pre_prepare(view_no, seq, d2));
    }

    #[test]
    fn committed_requires_commit_quorum() {
        let mut store = CertStore::new();
        let view_no = SeqNo::ZERO;
        let seq = SeqNo::from(1);
        let digest = Digest::from_data(b"block");
        let vi = view();

        store.record_pre_prepare(view_no, seq, digest);
        store.record_prepare(view_no, seq, digest, NodeId::from(1));
        store.record_prepare(view_no, seq, digest, NodeId::from(2));
        assert!(!store.is_committed(view_no, seq, digest, &vi));

        store.record_commit(view_no, seq, NodeId::from(0));
        store.record_commit(view_no, seq, NodeId::from(1));
        store.record_commit(view_no, seq, NodeId::from(2));
        assert!(store.is_committed(view_no, seq, digest, &vi));
    }

    #[test]
    fn watermark_advance_garbage_collects_below_floor() {
        let mut mgr = CheckpointManager::new(10, 20);
        mgr.advance(SeqNo::from(10));
        assert_eq!(mgr.low_watermark(), SeqNo::from(10));
        assert_eq!(mgr.high_watermark(), SeqNo::from(30));
        assert!(!mgr.in_range(SeqNo::from(5)));
        assert!(mgr.in_range(SeqNo::from(15)));
    }
}
