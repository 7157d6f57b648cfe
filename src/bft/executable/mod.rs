//! The execution collaborator contract (§6) and its background-thread
//! implementation, in the same shape as the original executor: a
//! dedicated OS thread owns the application state and drains a
//! request channel, so that potentially slow user code never blocks
//! the replica's event loop.

use std::sync::mpsc;
use std::thread;

use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// Application logic pluggable into the replication engine. The core
/// never interprets block contents (§1's non-goals); it only compares
/// hashes it voted on against what this trait reports.
pub trait Service: Send {
    /// The block type ordered by consensus. Required to be hashable on
    /// its own bytes, independent of any state, since a block's digest
    /// is what goes in a `PRE-PREPARE` and gets voted on before the
    /// block is ever executed.
    type Block: Clone + Send + AsRef<[u8]> + 'static;
    /// The application state type, checkpointed and shipped whole by
    /// state transfer.
    type State: Clone + Send + 'static;

    /// Returns the initial state of the application.
    fn initial_state(&mut self) -> Result<Self::State>;

    /// Applies `block` on top of `state`, returning a commitment
    /// (digest) to the resulting state. This is `getState()` folded
    /// into the same call, since the engine always wants the new
    /// commitment immediately after executing.
    fn execute(&mut self, state: &mut Self::State, block: &Self::Block) -> Digest;
}

pub type Block<S> = <S as Service>::Block;
pub type State<S> = <S as Service>::State;

/// Posted back to the engine's event queue when a request completes;
/// the engine is expected to convert this into a local event variant.
pub enum ExecutionResult<S: Service> {
    /// `execute(seq, block)` completed; the replica may advance
    /// `lastExec` and consider taking a checkpoint.
    Executed { seq: SeqNo, state_id: Digest },
    /// The state requested by a checkpoint/state-transfer handshake is
    /// ready to ship.
    StateReady {
        seq: SeqNo,
        state_id: Digest,
        state: State<S>,
    },
}

enum ExecutionRequest<S: Service> {
    Execute { seq: SeqNo, block: S::Block },
    ExecuteAndGetAppstate { seq: SeqNo, block: S::Block },
    InstallState { state: S::State, after: Vec<S::Block> },
}

/// A handle to the background executor thread, cloneable so every
/// collaborator that needs to submit work (core, cst) can hold one.
pub struct ExecutorHandle<S: Service> {
    tx: mpsc::Sender<ExecutionRequest<S>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> ExecutorHandle<S>
where
    S: Service + 'static,
    State<S>: Send,
{
    /// Queues `block` at `seq` for execution.
    pub fn execute(&self, seq: SeqNo, block: Block<S>) -> Result<()> {
        self.tx
            .send(ExecutionRequest::Execute { seq, block })
            .simple(ErrorKind::Executable)
    }

    /// Same as `execute`, additionally reporting the serialized
    /// application state; used right before a checkpoint.
    pub fn execute_and_get_appstate(&self, seq: SeqNo, block: Block<S>) -> Result<()> {
        self.tx
            .send(ExecutionRequest::ExecuteAndGetAppstate { seq, block })
            .simple(ErrorKind::Executable)
    }

    /// Installs state received via state transfer, then replays any
    /// blocks committed after the checkpoint that produced it.
    pub fn install_state(&self, state: State<S>, after: Vec<Block<S>>) -> Result<()> {
        self.tx
            .send(ExecutionRequest::InstallState { state, after })
            .simple(ErrorKind::Executable)
    }
}

/// Spawns the background thread running `service`, delivering
/// completion events through `on_result`.
pub fn spawn<S, F>(mut service: S, on_result: F) -> Result<ExecutorHandle<S>>
where
    S: Service + 'static,
    F: Fn(ExecutionResult<S>) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<ExecutionRequest<S>>();
    let mut state = service.initial_state()?;

    thread::Builder::new()
        .name("pbft-executor".to_string())
        .spawn(move || {
            let mut last_exec = SeqNo::ZERO;
            while let Ok(req) = rx.recv() {
                match req {
                    ExecutionRequest::Execute { seq, block } => {
                        let state_id = service.execute(&mut state, &block);
                        last_exec = seq;
                        on_result(ExecutionResult::Executed { seq, state_id });
                    }
                    ExecutionRequest::ExecuteAndGetAppstate { seq, block } => {
                        let state_id = service.execute(&mut state, &block);
                        last_exec = seq;
                        on_result(ExecutionResult::StateReady {
                            seq,
                            state_id,
                            state: state.clone(),
                        });
                    }
                    ExecutionRequest::InstallState { state: new_state, after } => {
                        state = new_state;
                        for block in after {
                            last_exec = last_exec.next();
                            let state_id = service.execute(&mut state, &block);
                            on_result(ExecutionResult::Executed {
                                seq: last_exec,
                                state_id,
                            });
                        }
                    }
                }
            }
        })
        .wrapped(ErrorKind::Executable)?;

    Ok(ExecutorHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[derive(Clone)]
    struct CounterState(u64);

    #[derive(Clone)]
    struct Increment([u8; 8]);

    impl Increment {
        fn new(n: u64) -> Self {
            Self(n.to_le_bytes())
        }

        fn value(&self) -> u64 {
            u64::from_le_bytes(self.0)
        }
    }

    impl AsRef<[u8]> for Increment {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    struct CounterService;

    impl Service for CounterService {
        type Block = Increment;
        type State = CounterState;

        fn initial_state(&mut self) -> Result<Self::State> {
            Ok(CounterState(0))
        }

        fn execute(&mut self, state: &mut Self::State, block: &Self::Block) -> Digest {
            state.0 += block.value();
            Digest::from_data(&state.0.to_le_bytes())
        }
    }

    #[test]
    fn background_executor_applies_blocks_in_order() {
        let (result_tx, result_rx) = std_mpsc::channel();
        let handle = spawn(CounterService, move |result| {
            result_tx.send(matches!(result, ExecutionResult::Executed { .. })).unwrap();
        })
        .unwrap();

        handle.execute(SeqNo::from(1), Increment::new(2)).unwrap();
        handle.execute(SeqNo::from(2), Increment::new(3)).unwrap();

        assert!(result_rx.recv().unwrap());
        assert!(result_rx.recv().unwrap());
    }
}
