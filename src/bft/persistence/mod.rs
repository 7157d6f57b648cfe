//! The persistence mirror (C8, §4.8) and the `Storage` collaborator
//! contract it is built on (§6): a key-addressable byte store with
//! prefixes for blocks, P-set, Q-set and checkpoints. `put`/`delete`
//! are required to be idempotent, since garbage collection and crash
//! recovery both re-issue them freely.

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::message::{PEntry, QEntry};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// A key under the reserved `pbft.*` namespace (§6's persisted
/// layout). Kept as a typed enum rather than a formatted string so
/// that a real backend can dispatch on the prefix without parsing.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Key {
    Block(Digest),
    PSet(SeqNo),
    QSet(Digest, SeqNo),
    Checkpoint(SeqNo),
    /// Points at the most recently persisted stable checkpoint's
    /// `SeqNo`, so a restart can find it without the backend needing
    /// to support key enumeration.
    LastCheckpoint,
}

/// Key-addressable byte store consumed by the persistence mirror.
/// Implementations must make `put` and `delete` idempotent: replaying
/// either against a key already in the target state is a no-op.
pub trait Storage: Send + Sync {
    fn put(&self, key: Key, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: Key) -> Result<()>;
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;
}

/// An in-memory `Storage`, used by tests and by deployments that do
/// not need crash recovery across process restarts.
#[derive(Default)]
pub struct MemoryStorage {
    inner: parking_lot::Mutex<HashMap<Key, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(collections::hash_map()),
        }
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.inner.lock().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: Key) -> Result<()> {
        self.inner.lock().remove(&key);
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().get(key).cloned())
    }
}

fn encode_seqno(seq: SeqNo) -> Vec<u8> {
    u32::from(seq).to_le_bytes().to_vec()
}

fn decode_seqno(bytes: &[u8]) -> Option<SeqNo> {
    let buf: [u8; 4] = bytes.try_into().ok()?;
    Some(SeqNo::from(u32::from_le_bytes(buf)))
}

fn encode_entry(view: SeqNo, digest: Digest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + Digest::LENGTH);
    buf.extend_from_slice(&u32::from(view).to_le_bytes());
    buf.extend_from_slice(digest.as_ref());
    buf
}

/// Mirrors in-flight blocks, P-set, Q-set and the last stable
/// checkpoint to a `Storage` backend, so that the recovered state
/// feeds back into memory before event processing begins on restart
/// (§4.8). Every write here must happen atomically with its
/// corresponding in-memory mutation; callers are expected to persist
/// before acting on a change, not after.
///
/// Blocks are persisted as their own raw bytes — `Service::Block` is
/// already required to be `AsRef<[u8]>` — rather than through a
/// serde round-trip; P-set/Q-set entries use the same fixed
/// `view | digest` layout `Header`'s own codec uses for the wire
/// format.
pub struct PersistentLog<B> {
    storage: Box<dyn Storage>,
    _marker: std::marker::PhantomData<B>,
}

impl<B> PersistentLog<B>
where
    B: AsRef<[u8]>,
{
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self {
            storage,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn persist_block(&self, digest: Digest, block: &B) -> Result<()> {
        self.storage.put(Key::Block(digest), block.as_ref().to_vec())
    }

    pub fn delete_block(&self, digest: Digest) -> Result<()> {
        self.storage.delete(Key::Block(digest))
    }

    pub fn persist_pset_entry(&self, entry: &PEntry) -> Result<()> {
        self.storage.put(Key::PSet(entry.seq), encode_entry(entry.view, entry.digest))
    }

    pub fn delete_pset_entry(&self, seq: SeqNo) -> Result<()> {
        self.storage.delete(Key::PSet(seq))
    }

    pub fn persist_qset_entry(&self, entry: &QEntry) -> Result<()> {
        self.storage
            .put(Key::QSet(entry.digest, entry.seq), encode_entry(entry.view, entry.digest))
    }

    pub fn delete_qset_entry(&self, digest: Digest, seq: SeqNo) -> Result<()> {
        self.storage.delete(Key::QSet(digest, seq))
    }

    /// Persists the last stable checkpoint, plus a pointer to it under
    /// a reserved key so a restart can find the latest one without
    /// the backend needing to support key enumeration.
    pub fn persist_checkpoint(&self, seq: SeqNo, state_id: Digest) -> Result<()> {
        self.storage.put(Key::Checkpoint(seq), state_id.as_ref().to_vec())?;
        self.storage.put(Key::LastCheckpoint, encode_seqno(seq))
    }

    pub fn delete_checkpoint(&self, seq: SeqNo) -> Result<()> {
        self.storage.delete(Key::Checkpoint(seq))
    }

    /// Loads the last persisted stable checkpoint, if any, so
    /// `Replica::bootstrap` can fast-forward its watermarks before
    /// processing its first event after a restart (§4.8). P-set/Q-set
    /// and in-flight blocks below that checkpoint are not replayed:
    /// they are, by construction, below the watermark the checkpoint
    /// itself establishes, so the replica simply resumes ordering from
    /// there, the same place it would be after an ordinary garbage
    /// collection pass.
    pub fn load_last_checkpoint(&self) -> Result<Option<(SeqNo, Digest)>> {
        let seq = match self.storage.get(&Key::LastCheckpoint)? {
            Some(bytes) => match decode_seqno(&bytes) {
                Some(seq) => seq,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        match self.storage.get(&Key::Checkpoint(seq))? {
            Some(bytes) => Ok(Some((seq, Digest::from_bytes(&bytes)?))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_delete_are_idempotent() {
        let storage = MemoryStorage::new();
        let key = Key::Checkpoint(SeqNo::from(10));
        storage.put(key.clone(), vec![1, 2, 3]).unwrap();
        storage.put(key.clone(), vec![1, 2, 3]).unwrap();
        assert_eq!(storage.get(&key).unwrap(), Some(vec![1, 2, 3]));
        storage.delete(key.clone()).unwrap();
        storage.delete(key.clone()).unwrap();
        assert_eq!(storage.get(&key).unwrap(), None);
    }

    #[test]
    fn checkpoint_round_trips_through_the_last_checkpoint_pointer() {
        let log = PersistentLog::<Vec<u8>>::new(Box::new(MemoryStorage::new()));
        let state_id = Digest::from_data(b"state");
        log.persist_checkpoint(SeqNo::from(20), state_id).unwrap();
        let loaded = log.load_last_checkpoint().unwrap();
        assert_eq!(loaded, Some((SeqNo::from(20), state_id)));
    }

    #[test]
    fn no_checkpoint_persisted_yields_none() {
        let log = PersistentLog::<Vec<u8>>::new(Box::new(MemoryStorage::new()));
        assert_eq!(log.load_last_checkpoint().unwrap(), None);
    }
}
