//! Side-effecting adapters: processes, docker, oracles, config and run artifacts.

pub mod config;
pub mod docker;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod substrate;
pub mod workplace;
