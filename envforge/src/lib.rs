//! Automated discovery of a working build environment for a repository.
//!
//! An oracle proposes shell commands one at a time; a sandbox engine runs them
//! in a container, snapshots after every successful state change and rolls
//! back after every failure. The commands that worked become a Dockerfile.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, ledger, reply
//!   parsing, cost accounting). No I/O.
//! - **[`io`]**: Side-effecting operations (docker, oracle processes, git,
//!   config and run artifacts). Isolated behind traits for testing.
//!
//! Orchestration modules ([`sandbox`], [`agent`], [`run`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod agent;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
