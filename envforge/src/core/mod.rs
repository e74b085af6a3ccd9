//! Pure, deterministic logic: classification, ledger, reply parsing, accounting.
//!
//! Nothing in here touches the filesystem, processes or the container runtime.

pub mod classifier;
pub mod heuristics;
pub mod ledger;
pub mod react;
pub mod secrets;
pub mod transcript;
pub mod types;
pub mod usage;
