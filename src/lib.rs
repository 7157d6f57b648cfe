//! `pbft-core` is a single-threaded Practical Byzantine Fault Tolerant
//! replication engine, driving block ordering for a permissioned chain.
//!
//! The engine itself never touches transport, persistent storage, or
//! transaction execution; those are external collaborators, reached
//! through the traits in [`bft::communication`], [`bft::persistence`]
//! and [`bft::executable`].

pub mod bft;
