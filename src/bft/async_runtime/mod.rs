//! A background async runtime, used only to host the timer service
//! (§4.2) and the execution collaborator's worker thread. The
//! replica's own event loop (`core::Replica::poll`) is plain
//! synchronous code; nothing in the protocol engine itself awaits.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;
#[cfg(feature = "async_runtime_tokio")]
use self::tokio as backend;

#[cfg(feature = "async_runtime_async_std")]
mod async_std;
#[cfg(all(feature = "async_runtime_async_std", not(feature = "async_runtime_tokio")))]
use self::async_std as backend;

use std::future::Future;

pub use backend::Runtime;

/// Builds a multi-threaded background runtime with `num_threads`
/// worker threads.
pub fn init(num_threads: usize) -> Result<Runtime, ()> {
    backend::init(num_threads)
}

/// Spawns a future onto the ambient background runtime, detached.
pub fn spawn<F>(future: F) -> backend::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    backend::spawn(future)
}
