//! Deterministic classification of finished commands.
//!
//! Pure and total over `(command, exit_code, output)`: decides whether a run
//! counts as success and whether it is worth a snapshot.

use crate::core::heuristics::Heuristics;
use crate::core::types::Classification;

/// Classify a finished command.
///
/// - success: exit 0, or an informational exit (see [`is_informational_exit`]).
/// - mutating: the first whitespace-delimited token is not a read-only verb.
pub fn classify(
    command: &str,
    exit_code: i32,
    output: &str,
    heuristics: &Heuristics,
) -> Classification {
    Classification {
        is_success: exit_code == 0 || is_informational_exit(exit_code, output, heuristics),
        is_mutating: is_mutating(command, heuristics),
    }
}

/// Nonzero exit in the informational set whose output looks like help text.
pub fn is_informational_exit(exit_code: i32, output: &str, heuristics: &Heuristics) -> bool {
    if !heuristics.informational_exit_codes.contains(&exit_code) {
        return false;
    }
    let lower = output.to_lowercase();
    heuristics
        .help_markers
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
}

/// Conservative: anything not starting with a known inspection verb mutates.
pub fn is_mutating(command: &str, heuristics: &Heuristics) -> bool {
    let verb = first_token(command);
    !heuristics
        .read_only_verbs
        .iter()
        .any(|ro| ro.eq_ignore_ascii_case(&verb))
}

/// Lowercased first whitespace-delimited token, or `""` for blank input.
pub fn first_token(command: &str) -> String {
    command
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .unwrap_or_default()
}
