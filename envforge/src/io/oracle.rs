//! Oracle abstraction for proposing the next command.
//!
//! The [`Oracle`] trait decouples the agent loop from the model backend.
//! [`CodexOracle`] runs `codex exec` with a JSON output schema;
//! [`CommandOracle`] pipes the prompt into any command that answers in ReAct
//! text. Tests use a scripted oracle that returns queued replies.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::react::{clean_action, parse_reply};
use crate::core::transcript::Transcript;
use crate::core::types::{OracleReply, TerminalOutcome, Usage};
use crate::io::process::{ProcessLimits, run_process};
use crate::io::prompt::{PromptEnvironment, ReplyFormat, render_oracle_prompt};

pub const REPLY_SCHEMA: &str = include_str!("../../schemas/oracle_reply.schema.json");

/// Bytes of oracle stdout kept in memory.
const ORACLE_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Everything an oracle sees when proposing one step.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    /// History so far; the last turn carries the latest observation.
    pub transcript: &'a Transcript,
    pub step: u32,
    pub max_steps: u32,
}

/// Abstraction over decision backends.
pub trait Oracle {
    /// Propose exactly one action or a terminal outcome.
    ///
    /// Errors are unrecoverable for the run.
    fn propose(&self, request: &OracleRequest<'_>) -> Result<OracleReply>;
}

/// Oracle that spawns `codex exec` with a structured reply schema.
#[derive(Debug)]
pub struct CodexOracle {
    pub codex_bin: String,
    pub model: String,
    pub timeout: Duration,
    pub prompt_env: PromptEnvironment,
    /// Directory receiving the schema, per-step replies and event streams.
    pub work_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct StructuredReply {
    thought: String,
    action: Option<String>,
    #[serde(rename = "final")]
    terminal: Option<TerminalOutcome>,
}

impl CodexOracle {
    fn schema_path(&self) -> PathBuf {
        self.work_dir.join("oracle_reply.schema.json")
    }

    fn ensure_schema(&self) -> Result<PathBuf> {
        let path = self.schema_path();
        if !path.exists() {
            fs::create_dir_all(&self.work_dir)
                .with_context(|| format!("create oracle dir {}", self.work_dir.display()))?;
            fs::write(&path, REPLY_SCHEMA)
                .with_context(|| format!("write reply schema {}", path.display()))?;
        }
        Ok(path)
    }
}

impl Oracle for CodexOracle {
    #[instrument(skip_all, fields(step = request.step, model = %self.model))]
    fn propose(&self, request: &OracleRequest<'_>) -> Result<OracleReply> {
        let prompt = render_oracle_prompt(
            &self.prompt_env,
            request.transcript,
            request.step,
            request.max_steps,
            ReplyFormat::Json,
        )?;
        let schema_path = self.ensure_schema()?;
        let reply_path = self.work_dir.join(format!("{}.reply.json", request.step));
        let stream_path = self.work_dir.join(format!("{}.events.jsonl", request.step));

        let mut cmd = Command::new(&self.codex_bin);
        cmd.arg("exec")
            .arg("--json")
            .arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check")
            .arg("-m")
            .arg(&self.model)
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&reply_path)
            .arg("-")
            .current_dir(&self.work_dir);

        info!("asking codex for next action");
        let limits = ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: ORACLE_OUTPUT_LIMIT,
        };
        let output = run_process(cmd, Some(prompt.as_bytes()), &limits, Some(stream_path))
            .context("run codex exec")?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "codex exec timed out");
            bail!("codex exec timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            bail!(
                "codex exec failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            );
        }

        let usage = usage_from_events(&output.stdout_text());
        let raw = fs::read_to_string(&reply_path)
            .with_context(|| format!("read codex reply {}", reply_path.display()))?;
        let reply = parse_structured_reply(&raw, usage)?;
        debug!(
            has_action = reply.action.is_some(),
            terminal = ?reply.terminal,
            "parsed codex reply"
        );
        Ok(reply)
    }
}

/// Validate and convert a schema-constrained JSON reply.
pub fn parse_structured_reply(raw: &str, usage: Usage) -> Result<OracleReply> {
    let instance: Value = serde_json::from_str(raw.trim()).context("parse oracle reply json")?;
    let schema: Value = serde_json::from_str(REPLY_SCHEMA).context("parse reply schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile reply schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("oracle reply failed validation:\n- {}", messages.join("\n- "));
    }
    let parsed: StructuredReply =
        serde_json::from_value(instance).context("decode oracle reply")?;
    let thought = Some(parsed.thought.trim().to_string()).filter(|t| !t.is_empty());
    Ok(OracleReply {
        thought,
        action: parsed
            .action
            .map(|action| clean_action(&action))
            .filter(|action| !action.is_empty()),
        terminal: parsed.terminal,
        raw: raw.trim().to_string(),
        usage,
    })
}

/// Sum token usage over `turn.completed` events of a `codex exec --json` stream.
pub fn usage_from_events(stream: &str) -> Usage {
    let mut usage = Usage::default();
    for line in stream.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event.get("type").and_then(Value::as_str) != Some("turn.completed") {
            continue;
        }
        let counts = &event["usage"];
        usage.input_tokens += counts["input_tokens"].as_u64().unwrap_or(0);
        usage.output_tokens += counts["output_tokens"].as_u64().unwrap_or(0);
    }
    usage
}

/// Oracle that pipes the prompt into an arbitrary command and parses ReAct text.
#[derive(Debug)]
pub struct CommandOracle {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub prompt_env: PromptEnvironment,
    pub workdir: Option<PathBuf>,
}

impl CommandOracle {
    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = self.workdir.as_deref().filter(|dir| dir.is_dir()) {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(step = request.step))]
    fn propose(&self, request: &OracleRequest<'_>) -> Result<OracleReply> {
        let prompt = render_oracle_prompt(
            &self.prompt_env,
            request.transcript,
            request.step,
            request.max_steps,
            ReplyFormat::React,
        )?;
        let limits = ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: ORACLE_OUTPUT_LIMIT,
        };
        let output = run_process(self.command()?, Some(prompt.as_bytes()), &limits, None)
            .context("run oracle command")?;
        if output.timed_out {
            bail!("oracle command timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "oracle command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            );
        }
        Ok(parse_reply(&output.stdout_text(), Usage::default()))
    }
}

/// Path where [`CodexOracle`] keeps its files for a run directory.
pub fn oracle_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("oracle")
}
