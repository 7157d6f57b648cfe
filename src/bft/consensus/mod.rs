//! The normal-case pre-prepare/prepare/commit algorithm (C5, §4.4),
//! plus the time-bounded-out-of-order queue (`TboQueue`) that lets
//! messages for a future consensus instance wait around instead of
//! being dropped.

use std::collections::VecDeque;

use either::{Left, Right};
use tracing::debug;

use crate::bft::communication::message::{
    ConsensusMessage, ConsensusMessageKind, Header, PEntry, SystemMessage,
};
use crate::bft::communication::{NodeId, Transport};
use crate::bft::config::ViewInfo;
use crate::bft::crypto::hash::Digest;
use crate::bft::executable::Service;
use crate::bft::log::{BlockStore, CertStore};
use crate::bft::ordering::{Orderable, SeqNo};
use crate::bft::persistence::PersistentLog;

/// Tells `core::Replica` what to do next after polling the consensus
/// tracker.
pub enum ConsensusPollStatus<B> {
    /// Nothing queued for the current instance; poll the transport.
    Recv,
    /// The replica is the primary and idle: it should propose a new
    /// block if one is pending, otherwise poll the transport.
    TryProposeAndRecv,
    /// A message for the current instance is ready to be processed.
    NextMessage(Header, ConsensusMessage<B>),
}

/// Buffers consensus messages by how far ahead of the current instance
/// they are, so a `PREPARE` that outruns its `PRE-PREPARE` is not
/// simply discarded.
struct TboQueue<B> {
    curr_seq: SeqNo,
    get_queue: bool,
    pre_prepares: VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>,
    prepares: VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>,
    commits: VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>,
}

impl<B> TboQueue<B> {
    fn new(curr_seq: SeqNo) -> Self {
        Self {
            curr_seq,
            get_queue: false,
            pre_prepares: VecDeque::new(),
            prepares: VecDeque::new(),
            commits: VecDeque::new(),
        }
    }

    fn pop_message(
        tbo: &mut VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>,
    ) -> Option<(Header, ConsensusMessage<B>)> {
        if tbo.is_empty() {
            None
        } else {
            tbo[0].pop_front()
        }
    }

    fn queue_message(
        curr_seq: SeqNo,
        tbo: &mut VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>,
        h: Header,
        m: ConsensusMessage<B>,
    ) {
        let index = match m.sequence_number().index(curr_seq) {
            Right(i) => i,
            Left(_) => return,
        };
        if index >= tbo.len() {
            let grow_by = index - tbo.len() + 1;
            tbo.extend(std::iter::repeat_with(VecDeque::new).take(grow_by));
        }
        tbo[index].push_back((h, m));
    }

    fn advance_message_queue(tbo: &mut VecDeque<VecDeque<(Header, ConsensusMessage<B>)>>) {
        if let Some(mut front) = tbo.pop_front() {
            front.clear();
            tbo.push_back(front);
        }
    }

    fn signal(&mut self) {
        self.get_queue = true;
    }

    fn next_instance(&mut self) {
        self.curr_seq = self.curr_seq.next();
        Self::advance_message_queue(&mut self.pre_prepares);
        Self::advance_message_queue(&mut self.prepares);
        Self::advance_message_queue(&mut self.commits);
    }

    fn queue(&mut self, h: Header, m: ConsensusMessage<B>) {
        match m.kind() {
            ConsensusMessageKind::PrePrepare(..) => {
                Self::queue_message(self.curr_seq, &mut self.pre_prepares, h, m)
            }
            ConsensusMessageKind::Prepare(_) => {
                Self::queue_message(self.curr_seq, &mut self.prepares, h, m)
            }
            ConsensusMessageKind::Commit(_) => {
                Self::queue_message(self.curr_seq, &mut self.commits, h, m)
            }
        }
    }
}

/// The phase a single consensus instance is in, from the point of view
/// of this replica.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtoPhase {
    Init,
    Preparing,
    Committing,
}

/// Outcome of feeding a message into `Consensus::process_message`.
pub enum ConsensusStatus {
    /// The replica rejected a conflicting `PRE-PREPARE`: a
    /// view-change should be triggered.
    Conflicting(SeqNo),
    /// Still collecting votes for the current instance.
    Deciding,
    /// The current instance has been committed; `digest` should be
    /// handed to the executor and a new instance begun.
    Decided(Digest),
}

/// Tracks the in-progress consensus instance, plus the out-of-order
/// buffer for future ones.
pub struct Consensus<S: Service> {
    phase: ProtoPhase,
    tbo: TboQueue<S::Block>,
    proposed: Option<(Digest, S::Block)>,
}

impl<S> Consensus<S>
where
    S: Service + 'static,
{
    pub fn new(initial_seq_no: SeqNo) -> Self {
        Self {
            phase: ProtoPhase::Init,
            tbo: TboQueue::new(initial_seq_no),
            proposed: None,
        }
    }

    pub fn sequence_number(&self) -> SeqNo {
        self.tbo.curr_seq
    }

    pub fn phase(&self) -> ProtoPhase {
        self.phase
    }

    pub fn signal(&mut self) {
        self.tbo.signal();
    }

    /// Queues a message belonging to a future instance, or the current
    /// one if it arrived out of phase order.
    pub fn queue(&mut self, h: Header, m: ConsensusMessage<S::Block>) {
        self.tbo.queue(h, m);
    }

    fn pop_for_phase(&mut self) -> Option<(Header, ConsensusMessage<S::Block>)> {
        match self.phase {
            ProtoPhase::Init => TboQueue::pop_message(&mut self.tbo.pre_prepares),
            ProtoPhase::Preparing => TboQueue::pop_message(&mut self.tbo.prepares),
            ProtoPhase::Committing => TboQueue::pop_message(&mut self.tbo.commits),
        }
    }

    /// Returns the next thing the replica's event loop should do.
    pub fn poll(&mut self, is_leader: bool) -> ConsensusPollStatus<S::Block> {
        if let Some((h, m)) = self.pop_for_phase() {
            return ConsensusPollStatus::NextMessage(h, m);
        }
        if self.tbo.get_queue {
            self.tbo.get_queue = false;
            if is_leader && self.phase == ProtoPhase::Init && self.proposed.is_none() {
                return ConsensusPollStatus::TryProposeAndRecv;
            }
        }
        ConsensusPollStatus::Recv
    }

    /// Called by the primary to begin ordering `block`, broadcasting
    /// the `PRE-PREPARE` to every other replica. The primary accepts its
    /// own proposal the same way a backup accepts one arriving over the
    /// network, otherwise it could never observe its own instance as
    /// prepared or committed.
    pub fn propose(
        &mut self,
        digest: Digest,
        block: S::Block,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        blocks: &mut BlockStore<S::Block>,
        persistence: &PersistentLog<S::Block>,
    ) -> ConsensusStatus
    where
        S::Block: Clone,
    {
        if self.phase != ProtoPhase::Init || !view.is_leader(me) {
            return ConsensusStatus::Deciding;
        }
        self.proposed = Some((digest, block.clone()));

        let seq = self.sequence_number();
        let view_no = view.sequence_number();
        let message = ConsensusMessage::new(
            view_no,
            seq,
            ConsensusMessageKind::PrePrepare(digest, Some(block.clone())),
        );
        let targets = other_replicas(view, me);
        let _ = transport.broadcast(SystemMessage::Consensus(message), targets);

        self.accept_pre_prepare(
            view, me, transport, certs, blocks, persistence, seq, view_no, digest, Some(block),
        )
    }

    /// Test-only: behaves like [`propose`](Self::propose), except `target`
    /// is unicast `divergent` in place of `digest` (§8 scenario 3,
    /// conflicting `PRE-PREPARE`). Never reachable from the production
    /// event surface; gated by `ReplicaConfig::byzantine` at the call site.
    pub fn propose_byzantine(
        &mut self,
        digest: Digest,
        divergent: Digest,
        block: S::Block,
        target: NodeId,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        blocks: &mut BlockStore<S::Block>,
        persistence: &PersistentLog<S::Block>,
    ) -> ConsensusStatus
    where
        S::Block: Clone,
    {
        if self.phase != ProtoPhase::Init || !view.is_leader(me) {
            return ConsensusStatus::Deciding;
        }
        self.proposed = Some((digest, block.clone()));

        let seq = self.sequence_number();
        let view_no = view.sequence_number();
        for id in other_replicas(view, me) {
            let sent_digest = if id == target { divergent } else { digest };
            let message = ConsensusMessage::new(
                view_no,
                seq,
                ConsensusMessageKind::PrePrepare(sent_digest, Some(block.clone())),
            );
            let _ = transport.unicast(SystemMessage::Consensus(message), id);
        }

        self.accept_pre_prepare(
            view, me, transport, certs, blocks, persistence, seq, view_no, digest, Some(block),
        )
    }

    /// Called by the primary to keep the view alive when no real block
    /// is pending (§5's null-request keep-alive): broadcasts a
    /// `PRE-PREPARE` carrying no block, so idle replicas still make
    /// progress toward a checkpoint instead of suspecting the primary.
    pub fn propose_null(
        &mut self,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        blocks: &mut BlockStore<S::Block>,
        persistence: &PersistentLog<S::Block>,
    ) -> ConsensusStatus {
        if self.phase != ProtoPhase::Init || !view.is_leader(me) {
            return ConsensusStatus::Deciding;
        }
        let digest = Digest::none();
        let seq = self.sequence_number();
        let view_no = view.sequence_number();
        let message = ConsensusMessage::new(view_no, seq, ConsensusMessageKind::PrePrepare(digest, None));
        let targets = other_replicas(view, me);
        let _ = transport.broadcast(SystemMessage::Consensus(message), targets);

        self.accept_pre_prepare(view, me, transport, certs, blocks, persistence, seq, view_no, digest, None)
    }

    /// Shared pre-prepare acceptance path: records the certificate,
    /// stashes the block, sends this replica's own `PREPARE` vote if it
    /// hasn't already, and checks whether the instance can advance.
    /// Used both for pre-prepares arriving over the network and for the
    /// primary's own proposal.
    #[allow(clippy::too_many_arguments)]
    fn accept_pre_prepare(
        &mut self,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        blocks: &mut BlockStore<S::Block>,
        persistence: &PersistentLog<S::Block>,
        seq: SeqNo,
        view_no: SeqNo,
        digest: Digest,
        block: Option<S::Block>,
    ) -> ConsensusStatus {
        if !certs.record_pre_prepare(view_no, seq, digest) {
            debug!(?view_no, ?seq, "conflicting pre-prepare digest, rejecting");
            return ConsensusStatus::Conflicting(seq);
        }
        if let Some(qentry) = certs.qset_entry(digest, seq) {
            let _ = persistence.persist_qset_entry(qentry);
        }
        if let Some(block) = block {
            let _ = persistence.persist_block(digest, &block);
            blocks.insert(digest, block);
        }
        self.phase = ProtoPhase::Preparing;

        if !certs.prepare_sent(view_no, seq) {
            certs.mark_prepare_sent(view_no, seq);
            let reply = ConsensusMessage::new(view_no, seq, ConsensusMessageKind::Prepare(digest));
            let targets = other_replicas(view, me);
            let _ = transport.broadcast(SystemMessage::Consensus(reply), targets);
        }
        self.advance_if_possible(view, me, transport, certs, persistence, digest)
    }

    /// Feeds a received message into the consensus state machine.
    #[allow(clippy::too_many_arguments)]
    pub fn process_message(
        &mut self,
        header: Header,
        message: ConsensusMessage<S::Block>,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        blocks: &mut BlockStore<S::Block>,
        persistence: &PersistentLog<S::Block>,
    ) -> ConsensusStatus
    where
        S::Block: Clone,
    {
        let seq = message.sequence_number();
        if seq != self.sequence_number() {
            self.queue(header, message);
            return ConsensusStatus::Deciding;
        }
        let view_no = view.sequence_number();

        match message.into_kind() {
            ConsensusMessageKind::PrePrepare(digest, block) => self.accept_pre_prepare(
                view, me, transport, certs, blocks, persistence, seq, view_no, digest, block,
            ),
            ConsensusMessageKind::Prepare(digest) => {
                if header.from() == view.leader() {
                    debug!(sender = ?header.from(), ?seq, "dropping prepare sent by the primary (§4.4)");
                    return ConsensusStatus::Deciding;
                }
                if !certs.record_prepare(view_no, seq, digest, header.from()) {
                    debug!(sender = ?header.from(), ?view_no, ?seq, "duplicate prepare vote");
                }
                self.advance_if_possible(view, me, transport, certs, persistence, digest)
            }
            ConsensusMessageKind::Commit(digest) => {
                if !certs.record_commit(view_no, seq, header.from()) {
                    debug!(sender = ?header.from(), ?view_no, ?seq, "duplicate commit vote");
                }
                self.advance_if_possible(view, me, transport, certs, persistence, digest)
            }
        }
    }

    fn advance_if_possible(
        &mut self,
        view: &ViewInfo,
        me: NodeId,
        transport: &dyn Transport<S::Block>,
        certs: &mut CertStore,
        persistence: &PersistentLog<S::Block>,
        digest: Digest,
    ) -> ConsensusStatus {
        let view_no = view.sequence_number();
        let seq = self.sequence_number();

        if self.phase == ProtoPhase::Preparing && certs.is_prepared(view_no, seq, digest, view) {
            self.phase = ProtoPhase::Committing;
            let entry = PEntry { seq, view: view_no, digest };
            let _ = persistence.persist_pset_entry(&entry);
            certs.record_pset(entry);
        }

        if self.phase == ProtoPhase::Committing
            && certs.is_prepared(view_no, seq, digest, view)
            && !certs.commit_sent(view_no, seq)
        {
            certs.mark_commit_sent(view_no, seq);
            let commit = ConsensusMessage::new(view_no, seq, ConsensusMessageKind::Commit(digest));
            let targets = other_replicas(view, me);
            let _ = transport.broadcast(SystemMessage::Consensus(commit), targets);
        }

        if certs.is_committed(view_no, seq, digest, view) {
            ConsensusStatus::Decided(digest)
        } else {
            ConsensusStatus::Deciding
        }
    }

    /// Clears per-instance phase state and advances to the next
    /// sequence number, after the current one has been decided.
    pub fn next_instance(&mut self) {
        self.phase = ProtoPhase::Init;
        self.proposed = None;
        self.tbo.next_instance();
    }

    pub fn proposed_block(&self) -> Option<&S::Block> {
        self.proposed.as_ref().map(|(_, b)| b)
    }
}

fn other_replicas(view: &ViewInfo, me: NodeId) -> Vec<NodeId> {
    let (n, _f) = view.params();
    NodeId::targets(0..n as u32).filter(|id| *id != me).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::bft::crypto::signature::Signature;
    use crate::bft::persistence::MemoryStorage;

    use super::*;

    #[test]
    fn tbo_queue_buffers_future_instances() {
        let mut tbo: TboQueue<()> = TboQueue::new(SeqNo::ZERO);
        assert!(TboQueue::pop_message(&mut tbo.pre_prepares).is_none());
        tbo.next_instance();
        assert_eq!(tbo.curr_seq, SeqNo::from(1));
    }

    #[derive(Clone)]
    struct TestBlock(Vec<u8>);

    impl AsRef<[u8]> for TestBlock {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    struct TestService;

    impl Service for TestService {
        type Block = TestBlock;
        type State = ();

        fn initial_state(&mut self) -> crate::bft::error::Result<Self::State> {
            Ok(())
        }

        fn execute(&mut self, _state: &mut Self::State, block: &Self::Block) -> Digest {
            Digest::from_data(block.as_ref())
        }
    }

    fn clone_kind(kind: &ConsensusMessageKind<TestBlock>) -> ConsensusMessageKind<TestBlock> {
        match kind {
            ConsensusMessageKind::PrePrepare(d, b) => ConsensusMessageKind::PrePrepare(*d, b.clone()),
            ConsensusMessageKind::Prepare(d) => ConsensusMessageKind::Prepare(*d),
            ConsensusMessageKind::Commit(d) => ConsensusMessageKind::Commit(*d),
        }
    }

    fn clone_system_message(message: &SystemMessage<TestBlock>) -> SystemMessage<TestBlock> {
        match message {
            SystemMessage::Consensus(m) => {
                SystemMessage::Consensus(ConsensusMessage::new(m.view(), m.sequence_number(), clone_kind(m.kind())))
            }
            _ => panic!("this harness only ever puts Consensus messages on the bus"),
        }
    }

    fn dummy_header(from: NodeId, to: NodeId) -> Header {
        let signature = Signature::from_bytes(&[0; Signature::LENGTH][..]).unwrap();
        Header::new(from, to, 0, signature)
    }

    /// Routes messages between a fixed set of replicas in-process,
    /// standing in for a real network transport in these tests.
    struct BusTransport {
        id: NodeId,
        bus: Arc<Mutex<VecDeque<(NodeId, NodeId, SystemMessage<TestBlock>)>>>,
    }

    impl Transport<TestBlock> for BusTransport {
        fn broadcast(&self, message: SystemMessage<TestBlock>, targets: Vec<NodeId>) -> crate::bft::error::Result<()> {
            let mut bus = self.bus.lock();
            for target in targets {
                bus.push_back((self.id, target, clone_system_message(&message)));
            }
            Ok(())
        }

        fn unicast(&self, message: SystemMessage<TestBlock>, target: NodeId) -> crate::bft::error::Result<()> {
            self.bus.lock().push_back((self.id, target, message));
            Ok(())
        }
    }

    struct Replica {
        id: NodeId,
        consensus: Consensus<TestService>,
        certs: CertStore,
        blocks: BlockStore<TestBlock>,
        transport: BusTransport,
        persistence: PersistentLog<TestBlock>,
    }

    /// Drains the bus, feeding every message addressed to a replica into
    /// its `Consensus::process_message`, until nothing is left to
    /// deliver. Returns the sequence of `Decided` digests observed, in
    /// delivery order, one per replica that reached it.
    fn drain_bus(
        bus: &Arc<Mutex<VecDeque<(NodeId, NodeId, SystemMessage<TestBlock>)>>>,
        replicas: &mut [Replica],
        view: &ViewInfo,
    ) -> Vec<(NodeId, Digest)> {
        let mut decided = Vec::new();
        loop {
            let next = bus.lock().pop_front();
            let Some((from, to, message)) = next else { break };
            let replica = replicas.iter_mut().find(|r| r.id == to).expect("unknown target");
            let header = dummy_header(from, to);
            match message {
                SystemMessage::Consensus(m) => {
                    let status = replica.consensus.process_message(
                        header,
                        m,
                        view,
                        replica.id,
                        &replica.transport,
                        &mut replica.certs,
                        &mut replica.blocks,
                        &replica.persistence,
                    );
                    if let ConsensusStatus::Decided(digest) = status {
                        decided.push((replica.id, digest));
                    }
                }
                _ => unreachable!(),
            }
        }
        decided
    }

    /// §8 happy-path scenario: N=4, f=1, a single proposal by the
    /// primary reaches `Decided` on every backup once its `PREPARE`/
    /// `COMMIT` quorums are satisfied, without the primary ever having
    /// received its own `PRE-PREPARE` back over the network.
    #[test]
    fn happy_path_n4_f1_reaches_decided_everywhere() {
        let n = 4;
        let f = 1;
        let view = ViewInfo::new(SeqNo::ZERO, n, f).unwrap();
        let bus = Arc::new(Mutex::new(VecDeque::new()));

        let mut replicas: Vec<Replica> = (0..n as u32)
            .map(|id| Replica {
                id: NodeId::from(id),
                consensus: Consensus::new(SeqNo::ZERO.next()),
                certs: CertStore::new(),
                blocks: BlockStore::new(),
                transport: BusTransport { id: NodeId::from(id), bus: bus.clone() },
                persistence: PersistentLog::new(Box::new(MemoryStorage::new())),
            })
            .collect();

        let leader = view.leader();
        let block = TestBlock(b"order me".to_vec());
        let digest = Digest::from_data(block.as_ref());

        {
            let leader_replica = replicas.iter_mut().find(|r| r.id == leader).unwrap();
            let status = leader_replica.consensus.propose(
                digest,
                block,
                &view,
                leader_replica.id,
                &leader_replica.transport,
                &mut leader_replica.certs,
                &mut leader_replica.blocks,
                &leader_replica.persistence,
            );
            // With f=1, prepare_quorum()-1 = 2 and commit_quorum() = 3:
            // the leader alone can't be committed yet.
            assert!(matches!(status, ConsensusStatus::Deciding));
            assert!(leader_replica.certs.is_pre_prepared(view.sequence_number(), SeqNo::ZERO.next(), digest));
        }

        let decided = drain_bus(&bus, &mut replicas, &view);

        // Every replica, including the leader (whose own pre-prepare
        // was recorded locally by `propose`, not via the network),
        // reaches Decided for the same digest.
        assert_eq!(decided.len(), n);
        for (_, d) in &decided {
            assert_eq!(*d, digest);
        }
        let decided_ids: std::collections::HashSet<NodeId> = decided.iter().map(|(id, _)| *id).collect();
        assert_eq!(decided_ids.len(), n);
    }

    /// §8 scenario 3: a Byzantine leader unicasts a divergent digest to
    /// one target. That replica records a conflicting `PRE-PREPARE` and
    /// is told to begin a view-change, while the honest majority still
    /// reaches `Decided` on the real digest.
    #[test]
    fn conflicting_pre_prepare_is_detected_by_its_target() {
        let n = 4;
        let f = 1;
        let view = ViewInfo::new(SeqNo::ZERO, n, f).unwrap();
        let bus = Arc::new(Mutex::new(VecDeque::new()));

        let mut replicas: Vec<Replica> = (0..n as u32)
            .map(|id| Replica {
                id: NodeId::from(id),
                consensus: Consensus::new(SeqNo::ZERO.next()),
                certs: CertStore::new(),
                blocks: BlockStore::new(),
                transport: BusTransport { id: NodeId::from(id), bus: bus.clone() },
                persistence: PersistentLog::new(Box::new(MemoryStorage::new())),
            })
            .collect();

        let leader = view.leader();
        let target = NodeId::from(((u32::from(leader) + 1) % n as u32) as u32);
        let block = TestBlock(b"honest".to_vec());
        let digest = Digest::from_data(block.as_ref());
        let divergent = Digest::from_data(b"dishonest");

        {
            let leader_replica = replicas.iter_mut().find(|r| r.id == leader).unwrap();
            let _ = leader_replica.consensus.propose_byzantine(
                digest,
                divergent,
                block,
                target,
                &view,
                leader_replica.id,
                &leader_replica.transport,
                &mut leader_replica.certs,
                &mut leader_replica.blocks,
                &leader_replica.persistence,
            );
        }

        // Feed only the target's inbound message first, to isolate the
        // conflict it should observe before any PREPARE muddies the
        // CertStore entry.
        let targets_first_message = {
            let mut bus = bus.lock();
            let pos = bus.iter().position(|(_, to, _)| *to == target).unwrap();
            bus.remove(pos).unwrap()
        };
        let (from, to, message) = targets_first_message;
        let target_replica = replicas.iter_mut().find(|r| r.id == to).unwrap();
        let header = dummy_header(from, to);
        let SystemMessage::Consensus(m) = message else { unreachable!() };
        let status = target_replica.consensus.process_message(
            header,
            m,
            &view,
            target_replica.id,
            &target_replica.transport,
            &mut target_replica.certs,
            &mut target_replica.blocks,
            &target_replica.persistence,
        );
        assert!(matches!(status, ConsensusStatus::Conflicting(_)));
    }
}
