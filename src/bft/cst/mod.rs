//! Collaborative state transfer (C7, §4.7).
//!
//! Based on the paper «On the Efficiency of Durable State Machine
//! Replication», by A. Bessani et al. A replica that detects it has
//! fallen behind (a weak checkpoint certificate it didn't itself
//! generate) asks the group for the latest agreed sequence number,
//! then for the state itself, and installs it through the execution
//! collaborator before resuming normal operation.

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::{CstMessage, Header, SystemMessage};
use crate::bft::communication::{NodeId, Transport};
use crate::bft::config::ViewInfo;
use crate::bft::crypto::hash::Digest;
use crate::bft::executable::Service;
use crate::bft::ordering::SeqNo;

/// The best weak-certificate catch-up point observed so far
/// (`highStateTarget`, §3).
#[derive(Clone)]
pub struct HighStateTarget {
    pub seq: SeqNo,
    pub state_id: Digest,
    pub replicas: Vec<NodeId>,
}

enum ProtoPhase {
    Init,
    ReceivingSeq,
    ReceivingState,
}

/// Outcome of driving the state-transfer state machine.
pub enum CstStatus<S: Service> {
    /// Not presently running; drop any stray message.
    Nil,
    /// Still waiting on more replies.
    Running,
    /// A peer asked for our latest executed sequence number; reply to
    /// it directly (it is not tallied against a quorum on our end).
    ReplyLatestSeq(NodeId),
    /// A peer asked for our last checkpointed state; reply to it with
    /// whatever we have stashed, if anything.
    ReplyState(NodeId),
    /// A quorum-worthy tally of replies to `RequestLatestSeq`.
    SeqNo(SeqNo),
    /// The state at `seq` with commitment `state_id`, plus the blocks
    /// committed after the checkpoint that produced it, ready to
    /// install.
    State(SeqNo, Digest, S::State, Vec<S::Block>),
}

/// Tracks an in-progress (or idle) state-transfer attempt.
pub struct CollabStateTransfer<S: Service> {
    phase: ProtoPhase,
    skip_in_progress: bool,
    state_transferring: bool,
    high_state_target: Option<HighStateTarget>,
    seq_votes: HashMap<SeqNo, Vec<NodeId>>,
    state_votes: HashMap<Digest, Vec<NodeId>>,
    /// Wire-received candidate payloads for a `RequestState` in
    /// flight, keyed by the claimed `state_id`, awaiting `f+1`
    /// agreeing votes before being trusted and decoded.
    pending_state_bytes: HashMap<Digest, (SeqNo, Vec<u8>, Vec<S::Block>)>,
    /// This replica's own most recently executed checkpoint, stashed
    /// so it can serve a `RequestState` without re-asking the
    /// executor for it.
    latest_checkpoint: Option<(SeqNo, Digest, S::State, Vec<S::Block>)>,
}

impl<S> CollabStateTransfer<S>
where
    S: Service + 'static,
{
    pub fn new() -> Self {
        Self {
            phase: ProtoPhase::Init,
            skip_in_progress: false,
            state_transferring: false,
            high_state_target: None,
            seq_votes: collections::hash_map(),
            state_votes: collections::hash_map(),
            pending_state_bytes: collections::hash_map(),
            latest_checkpoint: None,
        }
    }

    pub fn skip_in_progress(&self) -> bool {
        self.skip_in_progress
    }

    /// No state-transfer attempt nor catch-up request is presently in
    /// flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, ProtoPhase::Init)
    }

    /// Records a weak checkpoint certificate observed from a peer
    /// (§4.5) as the best known catch-up point, if it improves on the
    /// one already on file.
    pub fn record_high_state_target(&mut self, seq: SeqNo, state_id: Digest, senders: Vec<NodeId>) {
        let better = match &self.high_state_target {
            Some(existing) => seq > existing.seq,
            None => true,
        };
        if better {
            self.high_state_target = Some(HighStateTarget {
                seq,
                state_id,
                replicas: senders,
            });
        }
    }

    /// Enters the out-of-range recovery path: the caller should clear
    /// `blockStore`/`outstanding` and persist the deletions before
    /// calling this.
    pub fn invalidate_state(&mut self) {
        self.skip_in_progress = true;
    }

    /// No-op while execution is draining or a transfer is already in
    /// flight; otherwise locks in a target and reports it so the
    /// caller can issue the collaborator's `skipTo` request.
    pub fn retry_state_transfer(
        &mut self,
        target: Option<HighStateTarget>,
        execution_in_progress: bool,
    ) -> Option<HighStateTarget> {
        if execution_in_progress || self.state_transferring {
            return None;
        }
        let target = target.or_else(|| self.high_state_target.clone())?;
        self.state_transferring = true;
        self.phase = ProtoPhase::ReceivingState;
        Some(target)
    }

    pub fn request_latest_seq<B>(&mut self, view: &ViewInfo, me: NodeId, transport: &dyn Transport<B>) {
        self.phase = ProtoPhase::ReceivingSeq;
        self.seq_votes.clear();
        let (n, _f) = view.params();
        let targets: Vec<NodeId> = NodeId::targets(0..n as u32).filter(|id| *id != me).collect();
        let _ = transport.broadcast(SystemMessage::Cst(CstMessage::<B>::RequestLatestSeq), targets);
    }

    pub fn request_state<B>(&mut self, target: &HighStateTarget, transport: &dyn Transport<B>) {
        for replica in &target.replicas {
            let _ = transport.unicast(SystemMessage::Cst(CstMessage::<B>::RequestState), *replica);
        }
    }

    /// Feeds a received `CstMessage` into the state machine.
    pub fn process_message(
        &mut self,
        header: Header,
        message: CstMessage<S::Block>,
        view: &ViewInfo,
    ) -> CstStatus<S>
    where
        S::State: serde::de::DeserializeOwned,
        S::Block: Clone,
    {
        match message {
            CstMessage::ReplyLatestSeq(seq) => {
                if !matches!(self.phase, ProtoPhase::ReceivingSeq) {
                    return CstStatus::Nil;
                }
                let votes = self.seq_votes.entry(seq).or_insert_with(Vec::new);
                if !votes.contains(&header.from()) {
                    votes.push(header.from());
                }
                let (_n, f) = view.params();
                if votes.len() >= f + 1 {
                    CstStatus::SeqNo(seq)
                } else {
                    CstStatus::Running
                }
            }
            CstMessage::ReplyState(seq, state_id, state_bytes, blocks) => {
                if !matches!(self.phase, ProtoPhase::ReceivingState) {
                    return CstStatus::Nil;
                }
                self.pending_state_bytes
                    .entry(state_id)
                    .or_insert((seq, state_bytes, blocks));
                let votes = self.state_votes.entry(state_id).or_insert_with(Vec::new);
                if !votes.contains(&header.from()) {
                    votes.push(header.from());
                }
                let (_n, f) = view.params();
                if votes.len() >= f + 1 {
                    if let Some((seq, bytes, blocks)) = self.pending_state_bytes.remove(&state_id) {
                        if let Ok(state) = bincode::deserialize::<S::State>(&bytes) {
                            self.state_transferring = false;
                            return CstStatus::State(seq, state_id, state, blocks);
                        }
                    }
                }
                CstStatus::Running
            }
            CstMessage::RequestLatestSeq => CstStatus::ReplyLatestSeq(header.from()),
            CstMessage::RequestState => CstStatus::ReplyState(header.from()),
            CstMessage::RequestBlock(_) | CstMessage::ReplyBlock(..) => CstStatus::Nil,
        }
    }

    /// Called whenever the local executor produces a new checkpointed
    /// state, so this replica can serve it to a peer that later asks
    /// via `RequestState`, without going back to the executor.
    pub fn stash_payload(&mut self, seq: SeqNo, state_id: Digest, state: S::State, blocks: Vec<S::Block>) {
        let better = match &self.latest_checkpoint {
            Some((existing_seq, ..)) => seq > *existing_seq,
            None => true,
        };
        if better {
            self.latest_checkpoint = Some((seq, state_id, state, blocks));
        }
    }

    /// Builds the `ReplyState` this replica should send in response to
    /// a `RequestState`, if it has a checkpointed state to offer.
    pub fn build_state_reply(&self) -> Option<CstMessage<S::Block>>
    where
        S::State: serde::Serialize,
        S::Block: Clone,
    {
        let (seq, state_id, state, blocks) = self.latest_checkpoint.as_ref()?;
        let bytes = bincode::serialize(state).ok()?;
        Some(CstMessage::ReplyState(*seq, *state_id, bytes, blocks.clone()))
    }

    /// Completes a transfer: clears in-flight bookkeeping once the
    /// executor reports the new state is installed (§4.7's
    /// `stateUpdateEvent` handling).
    pub fn finish(&mut self) {
        self.skip_in_progress = false;
        self.state_transferring = false;
        self.phase = ProtoPhase::Init;
        self.seq_votes.clear();
        self.state_votes.clear();
        self.pending_state_bytes.clear();
    }
}

impl<S> Default for CollabStateTransfer<S>
where
    S: Service + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct NoopState;
    #[derive(Clone)]
    struct NoopBlock;
    impl AsRef<[u8]> for NoopBlock {
        fn as_ref(&self) -> &[u8] {
            &[]
        }
    }
    struct NoopService;
    impl Service for NoopService {
        type Block = NoopBlock;
        type State = NoopState;
        fn initial_state(&mut self) -> crate::bft::error::Result<Self::State> {
            Ok(NoopState)
        }
        fn execute(&mut self, _state: &mut Self::State, _block: &Self::Block) -> Digest {
            Digest::none()
        }
    }

    #[test]
    fn retry_is_noop_while_execution_in_progress() {
        let mut cst = CollabStateTransfer::<NoopService>::new();
        let target = HighStateTarget {
            seq: SeqNo::from(10),
            state_id: Digest::none(),
            replicas: vec![NodeId::from(0)],
        };
        assert!(cst.retry_state_transfer(Some(target.clone()), true).is_none());
        assert!(cst.retry_state_transfer(Some(target), false).is_some());
    }

    #[test]
    fn high_state_target_only_improves() {
        let mut cst = CollabStateTransfer::<NoopService>::new();
        cst.record_high_state_target(SeqNo::from(10), Digest::none(), vec![NodeId::from(0)]);
        cst.record_high_state_target(SeqNo::from(5), Digest::none(), vec![NodeId::from(1)]);
        assert_eq!(cst.high_state_target.as_ref().unwrap().seq, SeqNo::from(10));
    }
}
