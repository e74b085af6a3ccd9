//! Test doubles for the substrate and the oracle.
//!
//! [`FakeSubstrate`] simulates containers as in-memory file maps: starting
//! from an image copies its files, a snapshot copies a container's files into
//! a new image, and scripted commands apply file effects even when they fail,
//! so rollback is observable. [`ScriptedOracle`] returns queued replies.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::{Result, anyhow};

use crate::core::types::{OracleReply, TerminalOutcome, Usage};
use crate::io::oracle::{Oracle, OracleRequest};
use crate::io::substrate::{ContextSpec, ExecOutput, ExecutionContext, Substrate, SubstrateError};

pub type Files = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FakeOp {
    Start,
    Exec,
    Snapshot,
    RemoveSnapshot,
    Destroy,
    Prune,
}

impl FakeOp {
    fn name(self) -> &'static str {
        match self {
            FakeOp::Start => "run",
            FakeOp::Exec => "exec",
            FakeOp::Snapshot => "commit",
            FakeOp::RemoveSnapshot => "rmi",
            FakeOp::Destroy => "rm",
            FakeOp::Prune => "image prune",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    Write(String, String),
    Remove(String),
}

/// Canned result of one command, with file effects applied regardless of exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCommand {
    exit_code: i32,
    output: String,
    effects: Vec<Effect>,
}

impl ScriptedCommand {
    pub fn ok(output: &str) -> Self {
        Self::exit(0, output)
    }

    pub fn exit(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            output: output.to_string(),
            effects: Vec::new(),
        }
    }

    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        self.effects
            .push(Effect::Write(path.to_string(), contents.to_string()));
        self
    }

    pub fn removes(mut self, path: &str) -> Self {
        self.effects.push(Effect::Remove(path.to_string()));
        self
    }
}

#[derive(Debug)]
struct FakeContainer {
    files: Files,
}

#[derive(Debug, Default)]
struct FakeState {
    base_files: Files,
    scripts: HashMap<String, ScriptedCommand>,
    containers: BTreeMap<String, FakeContainer>,
    snapshots: BTreeMap<String, Files>,
    next_id: u32,
    counts: BTreeMap<FakeOp, u32>,
    pending_failures: Vec<(FakeOp, SubstrateError)>,
    executed: Vec<String>,
}

impl FakeState {
    fn enter(&mut self, op: FakeOp) -> Result<(), SubstrateError> {
        *self.counts.entry(op).or_default() += 1;
        if let Some(idx) = self.pending_failures.iter().position(|(pending, _)| *pending == op) {
            let (_, err) = self.pending_failures.remove(idx);
            return Err(err);
        }
        Ok(())
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory substrate. Interior mutability keeps the `&self` trait shape.
#[derive(Debug, Default)]
pub struct FakeSubstrate {
    state: RefCell<FakeState>,
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file present in every context started from a base image.
    pub fn base_file(&self, path: &str, contents: &str) {
        self.state
            .borrow_mut()
            .base_files
            .insert(path.to_string(), contents.to_string());
    }

    pub fn script(&self, command: &str, scripted: ScriptedCommand) {
        self.state
            .borrow_mut()
            .scripts
            .insert(command.to_string(), scripted);
    }

    /// Make the next call of `op` fail as if the daemon were gone.
    pub fn fail_next(&self, op: FakeOp) {
        let err = SubstrateError::unreachable(
            op.name(),
            "Cannot connect to the Docker daemon (injected)",
        );
        self.state.borrow_mut().pending_failures.push((op, err));
    }

    /// Make the next call of `op` be refused as if its container had stopped.
    pub fn reject_next(&self, op: FakeOp) {
        let err = SubstrateError::rejected(op.name(), "container is not running (injected)");
        self.state.borrow_mut().pending_failures.push((op, err));
    }

    pub fn count(&self, op: FakeOp) -> u32 {
        self.state.borrow().counts.get(&op).copied().unwrap_or(0)
    }

    pub fn live_contexts(&self) -> usize {
        self.state.borrow().containers.len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.state.borrow().containers.contains_key(id)
    }

    pub fn live_snapshots(&self) -> Vec<String> {
        self.state.borrow().snapshots.keys().cloned().collect()
    }

    /// Files of a live context, if it exists.
    pub fn files(&self, id: &str) -> Option<Files> {
        self.state
            .borrow()
            .containers
            .get(id)
            .map(|container| container.files.clone())
    }

    /// Commands executed so far, in order, across all contexts.
    pub fn executed(&self) -> Vec<String> {
        self.state.borrow().executed.clone()
    }
}

fn builtin(command: &str, files: &Files) -> ExecOutput {
    let mut parts = command.split_whitespace();
    let program = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    match program {
        "ls" => ExecOutput {
            exit_code: 0,
            output: files.keys().map(|path| format!("{path}\n")).collect(),
        },
        "cat" => {
            let mut output = String::new();
            for path in &args {
                match files.get(*path) {
                    Some(contents) => output.push_str(contents),
                    None => {
                        return ExecOutput {
                            exit_code: 1,
                            output: format!("cat: {path}: No such file or directory\n"),
                        };
                    }
                }
            }
            ExecOutput {
                exit_code: 0,
                output,
            }
        }
        "echo" => ExecOutput {
            exit_code: 0,
            output: format!("{}\n", args.join(" ")),
        },
        "mkdir" | "pwd" | "true" => ExecOutput {
            exit_code: 0,
            output: String::new(),
        },
        _ => ExecOutput {
            exit_code: 127,
            output: format!("bash: {program}: command not found\n"),
        },
    }
}

impl Substrate for FakeSubstrate {
    fn start(&self, spec: &ContextSpec, image: &str) -> Result<ExecutionContext, SubstrateError> {
        let mut state = self.state.borrow_mut();
        state.enter(FakeOp::Start)?;
        let files = if let Some(files) = state.snapshots.get(image) {
            files.clone()
        } else if image.starts_with("fake-snapshot:") {
            return Err(SubstrateError::rejected(
                "run",
                format!("Unable to find image '{image}' locally"),
            ));
        } else {
            state.base_files.clone()
        };
        let id = format!("ctx-{}", state.next_id());
        state.containers.insert(id.clone(), FakeContainer { files });
        Ok(ExecutionContext {
            id,
            workdir: spec.workdir.clone(),
            mounts: spec.mounts.clone(),
            image: image.to_string(),
        })
    }

    fn exec(&self, ctx: &ExecutionContext, command: &str) -> Result<ExecOutput, SubstrateError> {
        let mut state = self.state.borrow_mut();
        state.enter(FakeOp::Exec)?;
        state.executed.push(command.to_string());
        let scripted = state.scripts.get(command).cloned();
        let container = state.containers.get_mut(&ctx.id).ok_or_else(|| {
            SubstrateError::rejected("exec", format!("No such container: {}", ctx.id))
        })?;
        let Some(scripted) = scripted else {
            return Ok(builtin(command, &container.files));
        };
        for effect in scripted.effects {
            match effect {
                Effect::Write(path, contents) => {
                    container.files.insert(path, contents);
                }
                Effect::Remove(path) => {
                    container.files.remove(&path);
                }
            }
        }
        Ok(ExecOutput {
            exit_code: scripted.exit_code,
            output: scripted.output,
        })
    }

    fn snapshot(&self, ctx: &ExecutionContext, label: &str) -> Result<String, SubstrateError> {
        let mut state = self.state.borrow_mut();
        state.enter(FakeOp::Snapshot)?;
        let files = state
            .containers
            .get(&ctx.id)
            .map(|container| container.files.clone())
            .ok_or_else(|| {
                SubstrateError::rejected("commit", format!("No such container: {}", ctx.id))
            })?;
        let name = format!("fake-snapshot:{}-{label}", state.next_id());
        state.snapshots.insert(name.clone(), files);
        Ok(name)
    }

    fn remove_snapshot(&self, snapshot: &str) -> Result<(), SubstrateError> {
        let mut state = self.state.borrow_mut();
        state.enter(FakeOp::RemoveSnapshot)?;
        state
            .snapshots
            .remove(snapshot)
            .map(|_| ())
            .ok_or_else(|| SubstrateError::rejected("rmi", format!("No such image: {snapshot}")))
    }

    fn destroy(&self, ctx: &ExecutionContext) -> Result<(), SubstrateError> {
        let mut state = self.state.borrow_mut();
        state.enter(FakeOp::Destroy)?;
        state
            .containers
            .remove(&ctx.id)
            .map(|_| ())
            .ok_or_else(|| SubstrateError::rejected("rm", format!("No such container: {}", ctx.id)))
    }

    fn prune(&self) -> Result<(), SubstrateError> {
        self.state.borrow_mut().enter(FakeOp::Prune)
    }
}

/// What a [`ScriptedOracle`] was asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub step: u32,
    pub max_steps: u32,
    pub turns: usize,
    /// Observation attached to the latest turn.
    pub last_observation: Option<String>,
}

/// Oracle returning queued replies, then an optional fallback forever.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<OracleReply>>,
    fallback: Option<OracleReply>,
    requests: RefCell<Vec<RecordedRequest>>,
    fail_at: Option<u32>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<OracleReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            ..Self::default()
        }
    }

    /// Answer every call with `reply`.
    pub fn repeating(reply: OracleReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    /// Return an error when asked for `step`.
    pub fn failing_at(mut self, step: u32) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<OracleReply> {
        let turns = request.transcript.turns();
        self.requests.borrow_mut().push(RecordedRequest {
            step: request.step,
            max_steps: request.max_steps,
            turns: turns.len(),
            last_observation: turns.last().and_then(|turn| turn.observation.clone()),
        });
        if self.fail_at == Some(request.step) {
            return Err(anyhow!("oracle backend unavailable"));
        }
        self.replies
            .borrow_mut()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("scripted oracle has no reply for step {}", request.step))
    }
}

const SCRIPTED_USAGE: Usage = Usage {
    input_tokens: 1_000,
    output_tokens: 100,
};

/// Reply proposing `command`.
pub fn action_reply(command: &str) -> OracleReply {
    OracleReply {
        thought: Some(format!("run {command}")),
        action: Some(command.to_string()),
        terminal: None,
        raw: format!("Thought: run {command}\nAction: {command}"),
        usage: SCRIPTED_USAGE,
    }
}

/// Reply ending the run with `outcome`.
pub fn final_reply(outcome: TerminalOutcome) -> OracleReply {
    let verdict = match outcome {
        TerminalOutcome::Success => "Success",
        TerminalOutcome::Failure => "cannot configure",
    };
    OracleReply {
        thought: Some("done".to_string()),
        action: None,
        terminal: Some(outcome),
        raw: format!("Thought: done\nFinal Answer: {verdict}"),
        usage: SCRIPTED_USAGE,
    }
}

/// Reply with neither an action nor a terminal outcome.
pub fn malformed_reply(text: &str) -> OracleReply {
    OracleReply {
        thought: None,
        action: None,
        terminal: None,
        raw: text.to_string(),
        usage: SCRIPTED_USAGE,
    }
}
