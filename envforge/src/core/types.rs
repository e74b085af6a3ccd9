//! Shared deterministic types for envforge core logic.
//!
//! These types define stable contracts between the classifier, the ledger and
//! the orchestration loop. They carry no I/O handles.

use serde::{Deserialize, Serialize};

/// Result of classifying one finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Exit status 0, or an informational exit (help/usage output).
    pub is_success: bool,
    /// The command may have changed persistent state of the context.
    pub is_mutating: bool,
}

/// One executed command as observed by the sandbox engine.
///
/// Immutable once produced; the ledger and the secret scanner only read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub command: String,
    pub exit_code: i32,
    /// Combined stdout+stderr, decoded lossily.
    pub output: String,
    pub success: bool,
    pub mutating: bool,
    /// Snapshot taken right after this command, if any.
    pub snapshot: Option<String>,
}

impl ExecutionRecord {
    /// Successful and mutating: the only records that enter the build script.
    pub fn is_replayable(&self) -> bool {
        self.success && self.mutating
    }
}

/// Oracle-declared end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalOutcome {
    Success,
    Failure,
}

/// Token usage reported by one oracle call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One proposal from the oracle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReply {
    pub thought: Option<String>,
    /// At most one shell command.
    pub action: Option<String>,
    /// `Some` ends the run.
    pub terminal: Option<TerminalOutcome>,
    /// Unparsed reply text, kept for the transcript and step logs.
    pub raw: String,
    pub usage: Usage,
}

/// A credential requirement surfaced from command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHint {
    pub name: String,
    pub context: String,
}
