//! This module contains the implementation details of `pbft-core`.

pub mod async_runtime;
pub mod collections;
pub mod communication;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod cst;
pub mod error;
pub mod executable;
pub mod log;
pub mod ordering;
pub mod persistence;
pub mod sync;
pub mod timeouts;

use std::ops::Drop;
use std::sync::atomic::{AtomicBool, Ordering};

use error::*;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of worker threads made available to the execution
    /// collaborator's background runtime, if one is spawned by the
    /// embedding application.
    pub exec_threads: usize,
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before constructing a [`core::Replica`],
/// otherwise runtime panics may ensue.
pub fn init(_c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::SeqCst);
    }
}
