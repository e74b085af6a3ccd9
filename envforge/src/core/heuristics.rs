//! Keyword tables that drive command classification and ledger filtering.
//!
//! Every table is plain data so it can be extended from `[heuristics]` in the
//! config file without touching control flow. Defaults mirror what the agent
//! typically sees when probing Python/Node/C repositories.

use serde::{Deserialize, Serialize};

/// A family of output phrases that point at one missing credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretFamily {
    /// Normalized key name recorded in the ledger (e.g. `OPENAI_API_KEY`).
    pub name: String,
    /// Lowercase phrases; any hit in the lowercased output selects this family.
    pub patterns: Vec<String>,
}

impl SecretFamily {
    fn new(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Overridable classification tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Heuristics {
    /// First tokens of side-effect-free inspection commands (never snapshotted).
    pub read_only_verbs: Vec<String>,
    /// Nonzero exit statuses that may still be informational.
    pub informational_exit_codes: Vec<i32>,
    /// Case-insensitive markers of help/usage text.
    pub help_markers: Vec<String>,
    /// Case-insensitive substrings marking a command as part of a reproducible setup.
    pub setup_keywords: Vec<String>,
    /// Maximum characters of output kept as a secret hint's context snippet.
    pub secret_snippet_chars: usize,
    /// Checked in order; the first family with a matching phrase wins.
    pub secret_families: Vec<SecretFamily>,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            read_only_verbs: strings(&[
                "ls", "cat", "pwd", "echo", "env", "hostname", "whoami", "head", "tail", "grep",
                "find", "du", "df", "top", "ps", "date", "which", "type", "file",
            ]),
            informational_exit_codes: vec![1, 2],
            help_markers: strings(&[
                "usage:",
                "--help",
                "options:",
                "commands:",
                "positional arguments:",
                "optional arguments:",
            ]),
            setup_keywords: strings(&[
                "pip install",
                "apt",
                "yum",
                "npm install",
                "yarn add",
                "git clone",
                "wget",
                "curl",
                "make",
                "cmake",
                "python -m",
                "poetry install",
                "conda install",
            ]),
            secret_families: vec![
                SecretFamily::new(
                    "OPENAI_API_KEY",
                    &[
                        "openai_api_key",
                        "openai api key",
                        "invalid api key",
                        "api key not found",
                    ],
                ),
                SecretFamily::new(
                    "ANTHROPIC_API_KEY",
                    &["anthropic_api_key", "anthropic api key", "claude api key"],
                ),
                SecretFamily::new(
                    "API_KEY",
                    &[
                        "missing api key",
                        "api key required",
                        "no api key",
                        "api_key not set",
                    ],
                ),
                SecretFamily::new(
                    "ACCESS_TOKEN",
                    &[
                        "access token",
                        "access_token",
                        "invalid token",
                        "token required",
                    ],
                ),
            ],
            secret_snippet_chars: 200,
        }
    }
}

impl Heuristics {
    /// Reject tables that would silently disable a classification rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.help_markers.iter().any(|m| m.trim().is_empty()) {
            return Err("heuristics.help_markers must not contain empty markers".to_string());
        }
        if self.setup_keywords.iter().any(|k| k.trim().is_empty()) {
            return Err("heuristics.setup_keywords must not contain empty keywords".to_string());
        }
        if self.informational_exit_codes.contains(&0) {
            return Err("heuristics.informational_exit_codes must not contain 0".to_string());
        }
        for family in &self.secret_families {
            if family.name.trim().is_empty() {
                return Err("heuristics.secret_families entries need a name".to_string());
            }
            if family.patterns.iter().any(|p| p.trim().is_empty()) {
                return Err(format!(
                    "heuristics.secret_families[{}] has an empty pattern",
                    family.name
                ));
            }
        }
        if self.secret_snippet_chars == 0 {
            return Err("heuristics.secret_snippet_chars must be > 0".to_string());
        }
        Ok(())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Heuristics::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_exit_code_cannot_be_informational() {
        let heuristics = Heuristics {
            informational_exit_codes: vec![0, 1],
            ..Heuristics::default()
        };
        let err = heuristics.validate().unwrap_err();
        assert!(err.contains("must not contain 0"));
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let parsed: Heuristics = toml::from_str("read_only_verbs = [\"ls\", \"tree\"]\n")
            .expect("parse heuristics");
        assert_eq!(parsed.read_only_verbs, vec!["ls", "tree"]);
        assert_eq!(parsed.help_markers, Heuristics::default().help_markers);
    }
}
