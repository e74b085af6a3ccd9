//! Append-only record of what worked during one run.
//!
//! The ledger grows monotonically and is consumed once at the end of a run to
//! produce the build script and the setup subset handed to doc generation.

use serde::Serialize;

use crate::core::types::SecretHint;

/// Ordered successful commands plus detected credential requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    instructions: Vec<String>,
    setup_commands: Vec<String>,
    secret_hints: Vec<SecretHint>,
    #[serde(skip)]
    setup_keywords: Vec<String>,
}

impl Ledger {
    /// Create an empty ledger that tags setup commands using `setup_keywords`.
    pub fn new(setup_keywords: Vec<String>) -> Self {
        Self {
            setup_keywords: setup_keywords
                .into_iter()
                .map(|keyword| keyword.to_lowercase())
                .collect(),
            ..Self::default()
        }
    }

    /// Append a successful command. Order of calls defines replay order.
    pub fn record_success(&mut self, command: &str) {
        self.instructions.push(command.to_string());
        if self.is_setup_command(command) {
            self.setup_commands.push(command.to_string());
        }
    }

    /// Record a credential hint; returns `false` if the exact pair was already known.
    pub fn record_secret_hint(&mut self, name: &str, context: &str) -> bool {
        let known = self
            .secret_hints
            .iter()
            .any(|hint| hint.name == name && hint.context == context);
        if known {
            return false;
        }
        self.secret_hints.push(SecretHint {
            name: name.to_string(),
            context: context.to_string(),
        });
        true
    }

    /// Commands to replay, in recording order.
    pub fn build_instructions(&self) -> &[String] {
        &self.instructions
    }

    /// Recorded commands that belong in a reproducible setup script.
    pub fn build_setup_subset(&self) -> &[String] {
        &self.setup_commands
    }

    pub fn secret_hints(&self) -> &[SecretHint] {
        &self.secret_hints
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    fn is_setup_command(&self, command: &str) -> bool {
        let lower = command.to_lowercase();
        self.setup_keywords
            .iter()
            .any(|keyword| lower.contains(keyword.as_str()))
    }
}

/// Declarative build script: base template, working directory and commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildScript {
    pub base_image: String,
    pub workdir: String,
    pub commands: Vec<String>,
}

impl BuildScript {
    pub fn from_ledger(ledger: &Ledger, base_image: &str, workdir: &str) -> Self {
        Self {
            base_image: base_image.to_string(),
            workdir: workdir.to_string(),
            commands: ledger.build_instructions().to_vec(),
        }
    }

    /// Render as a Dockerfile: the build context is copied into the workdir,
    /// then every command becomes one `RUN` line.
    pub fn render_dockerfile(&self) -> String {
        let mut lines = vec![
            format!("FROM {}", self.base_image),
            format!("WORKDIR {}", self.workdir),
            format!("COPY . {}", self.workdir),
            String::new(),
        ];
        lines.extend(self.commands.iter().map(|cmd| format!("RUN {cmd}")));
        lines.join("\n")
    }
}

/// Render setup commands as a standalone shell script.
pub fn render_setup_script(commands: &[String]) -> String {
    let mut buf = String::from("#!/usr/bin/env bash\nset -euo pipefail\n\n");
    for command in commands {
        buf.push_str(command);
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heuristics::Heuristics;

    fn ledger() -> Ledger {
        Ledger::new(Heuristics::default().setup_keywords)
    }

    #[test]
    fn instructions_preserve_recording_order_and_repeats() {
        let mut ledger = ledger();
        for cmd in ["pip install -e .", "python setup.py build", "pip install -e ."] {
            ledger.record_success(cmd);
        }
        assert_eq!(
            ledger.build_instructions(),
            ["pip install -e .", "python setup.py build", "pip install -e ."]
        );
    }

    #[test]
    fn setup_subset_is_keyword_filtered_view() {
        let mut ledger = ledger();
        ledger.record_success("apt-get update");
        ledger.record_success("export FOO=1");
        ledger.record_success("Make -j4");
        ledger.record_success("python app.py --check");
        assert_eq!(ledger.build_setup_subset(), ["apt-get update", "Make -j4"]);
        assert_eq!(ledger.build_instructions().len(), 4);
    }

    #[test]
    fn secret_hints_deduplicate_exact_pairs() {
        let mut ledger = ledger();
        assert!(ledger.record_secret_hint("OPENAI_API_KEY", "missing OPENAI_API_KEY"));
        assert!(!ledger.record_secret_hint("OPENAI_API_KEY", "missing OPENAI_API_KEY"));
        assert!(ledger.record_secret_hint("OPENAI_API_KEY", "other context"));
        assert_eq!(ledger.secret_hints().len(), 2);
    }

    #[test]
    fn dockerfile_lists_commands_after_header() {
        let mut ledger = ledger();
        ledger.record_success("pip install -r requirements.txt");
        ledger.record_success("pip install -e .");
        let script = BuildScript::from_ledger(&ledger, "python:3.10", "/app");
        assert_eq!(
            script.render_dockerfile(),
            "FROM python:3.10\nWORKDIR /app\nCOPY . /app\n\nRUN pip install -r requirements.txt\nRUN pip install -e ."
        );
    }

    #[test]
    fn setup_script_has_strict_shell_header() {
        let script = render_setup_script(&["pip install .".to_string()]);
        assert!(script.starts_with("#!/usr/bin/env bash\nset -euo pipefail\n"));
        assert!(script.ends_with("pip install .\n"));
    }
}
