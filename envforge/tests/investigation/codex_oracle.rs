//! Investigation tests for the Codex-backed oracle.
//!
//! # Prerequisites
//!
//! - Codex CLI installed and in PATH
//! - Valid API credentials configured for it
//!
//! # Running
//!
//! ```bash
//! cargo test --test investigation codex -- --ignored
//! ```

use std::fs;
use std::process::Command;
use std::time::Duration;

use envforge::core::transcript::Transcript;
use envforge::io::oracle::{CodexOracle, Oracle, OracleRequest};
use envforge::io::prompt::PromptEnvironment;

/// Verifies the Codex CLI is available in PATH.
#[test]
#[ignore]
fn codex_cli_available() {
    let output = Command::new("codex")
        .arg("--version")
        .output()
        .expect("codex not in PATH");
    assert!(
        output.status.success(),
        "codex --version failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    println!("Codex CLI version: {}", String::from_utf8_lossy(&output.stdout).trim());
}

/// Verifies a first-step proposal is schema-valid and leaves its files behind.
#[test]
#[ignore]
fn codex_first_step_proposes_an_action() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let oracle = CodexOracle {
        codex_bin: "codex".to_string(),
        model: "gpt-4o-mini".to_string(),
        timeout: Duration::from_secs(120),
        prompt_env: PromptEnvironment {
            base_image: "python:3.10".to_string(),
            workdir: "/app".to_string(),
            observation_limit_bytes: 4_000,
        },
        work_dir: tmp.path().to_path_buf(),
    };
    let transcript = Transcript::new("https://github.com/psf/requests.git");

    let reply = oracle
        .propose(&OracleRequest {
            transcript: &transcript,
            step: 1,
            max_steps: 10,
        })
        .expect("propose");

    println!("reply: {reply:#?}");
    assert!(reply.action.is_some() || reply.terminal.is_some());
    assert!(tmp.path().join("1.reply.json").exists());
    let events = fs::read_to_string(tmp.path().join("1.events.jsonl")).expect("events");
    assert!(!events.is_empty());
}
