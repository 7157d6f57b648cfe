use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

/// List of error kinds raised throughout the crate.
///
/// Kept as a flat list, the same way the upstream `bafomet` crate
/// generates its `ErrorKind` enum from a build script, so that new
/// components only need to add a variant name here.
const ERROR_KINDS: &[&str] = &[
    "Error",
    "Communication",
    "CommunicationMessage",
    "CryptoHash",
    "CryptoSignature",
    "Consensus",
    "ConsensusLog",
    "Synchronizer",
    "Cst",
    "Executable",
    "Timeouts",
    "Persistence",
    "ReplicaConfig",
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("error_kind.rs");

    let variants = ERROR_KINDS.iter().map(|k| format!("    {},", k)).join("\n");

    let code = format!(
        "/// Identifies the subsystem that raised an [`crate::bft::error::Error`].\n\
         #[derive(Debug, Copy, Clone, Eq, PartialEq)]\n\
         pub enum ErrorKind {{\n{variants}\n}}\n",
        variants = variants,
    );

    fs::write(&dest_path, code).expect("failed to write error_kind.rs");

    println!("cargo:rerun-if-changed=build.rs");
}
