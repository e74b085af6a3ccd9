//! Bounded oracle/sandbox loop.
//!
//! Each step asks the oracle for one action, runs it through the sandbox
//! engine and feeds the output back as the next observation. The loop stops on
//! a terminal reply, when the step budget runs out, or on a fatal error. The
//! engine is closed on every path.

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::core::heuristics::Heuristics;
use crate::core::ledger::Ledger;
use crate::core::secrets::detect_secret_hint;
use crate::core::transcript::Transcript;
use crate::core::types::{ExecutionRecord, OracleReply, SecretHint, TerminalOutcome};
use crate::core::usage::{CostMeter, ModelPrice, StepCost};
use crate::io::oracle::{Oracle, OracleRequest};
use crate::io::run_log::timestamp;
use crate::io::substrate::{ExecutionContext, Substrate};
use crate::sandbox::SandboxEngine;

/// Observation fed back when a reply has neither an action nor a verdict.
pub const NO_ACTION_OBSERVATION: &str =
    "Error: No command found. Please specify an action in 'Action: <command>' format.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub repo_url: String,
    pub max_steps: u32,
    /// Leave the live context running after the loop.
    pub keep_alive: bool,
    pub heuristics: Heuristics,
    pub price: ModelPrice,
}

/// Everything one run accumulates. Owned by the loop, handed back at the end.
#[derive(Debug, Clone)]
pub struct RunState {
    pub ledger: Ledger,
    pub meter: CostMeter,
    pub transcript: Transcript,
}

impl RunState {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            ledger: Ledger::new(config.heuristics.setup_keywords.clone()),
            meter: CostMeter::new(config.price),
            transcript: Transcript::new(config.repo_url.clone()),
        }
    }
}

/// One finished loop step, reported through the `on_step` callback.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: u32,
    pub started_at: String,
    pub ended_at: String,
    pub reply: OracleReply,
    pub execution: Option<ExecutionRecord>,
    /// Corrective observation used instead of a command result, or the
    /// fatal error that ended the run at this step.
    pub note: Option<String>,
    /// Secret hint first recorded in this step.
    pub new_secret_hint: Option<SecretHint>,
    pub cost: StepCost,
}

/// Why [`run_agent`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    Terminal(TerminalOutcome),
    BudgetExhausted,
    /// Unrecoverable error (substrate or oracle); the run failed.
    Fatal(String),
}

#[derive(Debug)]
pub struct RunReport {
    pub success: bool,
    pub stop: RunStop,
    pub steps: u32,
    pub state: RunState,
    pub kept_context: Option<ExecutionContext>,
    /// Cleanup failure, reported but never changing the verdict.
    pub cleanup_error: Option<String>,
}

/// Drive the oracle against the engine until a verdict, the budget, or a fatal error.
///
/// Consumes the engine: it is always closed before this returns.
#[instrument(skip_all, fields(repo_url = %config.repo_url, max_steps = config.max_steps))]
pub fn run_agent<S, O, F>(
    mut engine: SandboxEngine<S>,
    oracle: &O,
    config: &AgentConfig,
    mut on_step: F,
) -> RunReport
where
    S: Substrate,
    O: Oracle + ?Sized,
    F: FnMut(&StepOutcome),
{
    let mut state = RunState::new(config);
    let mut steps = 0u32;

    let attempt = (|| -> Result<RunStop> {
        for step in 1..=config.max_steps {
            steps = step;
            let outcome = match run_step(&mut engine, oracle, config, &mut state, step) {
                Ok(outcome) => outcome,
                Err(abort) => {
                    if let Some(partial) = &abort.partial {
                        on_step(partial);
                    }
                    return Err(abort.error);
                }
            };
            on_step(&outcome);
            if let Some(verdict) = outcome.reply.terminal {
                info!(step, verdict = ?verdict, "oracle declared a verdict");
                return Ok(RunStop::Terminal(verdict));
            }
        }
        warn!(max_steps = config.max_steps, "step budget exhausted");
        Ok(RunStop::BudgetExhausted)
    })();

    let stop = match attempt {
        Ok(stop) => stop,
        Err(err) => {
            let message = format!("{err:#}");
            error!(err = %message, steps, "run aborted");
            RunStop::Fatal(message)
        }
    };

    let (kept_context, cleanup_error) = match engine.close(config.keep_alive) {
        Ok(report) => (report.kept_context, None),
        Err(err) => {
            warn!(err = %err, "sandbox cleanup failed");
            (None, Some(err.to_string()))
        }
    };

    RunReport {
        success: stop == RunStop::Terminal(TerminalOutcome::Success),
        stop,
        steps,
        state,
        kept_context,
        cleanup_error,
    }
}

/// A step that ended the run. `partial` holds what the step produced before
/// the error, when the oracle had already replied.
struct StepAbort {
    partial: Option<StepOutcome>,
    error: anyhow::Error,
}

impl From<anyhow::Error> for StepAbort {
    fn from(error: anyhow::Error) -> Self {
        Self {
            partial: None,
            error,
        }
    }
}

fn run_step<S: Substrate, O: Oracle + ?Sized>(
    engine: &mut SandboxEngine<S>,
    oracle: &O,
    config: &AgentConfig,
    state: &mut RunState,
    step: u32,
) -> Result<StepOutcome, StepAbort> {
    let started_at = timestamp();
    let reply = oracle
        .propose(&OracleRequest {
            transcript: &state.transcript,
            step,
            max_steps: config.max_steps,
        })
        .with_context(|| format!("oracle call for step {step}"))?;
    let cost = state.meter.record(reply.usage);
    state.transcript.push_reply(step, &reply.raw);

    let mut outcome = StepOutcome {
        step,
        started_at,
        ended_at: String::new(),
        reply,
        execution: None,
        note: None,
        new_secret_hint: None,
        cost,
    };

    if outcome.reply.terminal.is_none() {
        match outcome.reply.action.clone() {
            None => {
                debug!(step, "reply carried no action");
                state.transcript.attach_observation(NO_ACTION_OBSERVATION);
                outcome.note = Some(NO_ACTION_OBSERVATION.to_string());
            }
            Some(action) => {
                let executed = engine
                    .execute(&action)
                    .with_context(|| format!("execute `{action}`"));
                let record = match executed {
                    Ok(record) => record,
                    Err(error) => {
                        outcome.note = Some(format!("Fatal: {error:#}"));
                        outcome.ended_at = timestamp();
                        return Err(StepAbort {
                            partial: Some(outcome),
                            error,
                        });
                    }
                };
                state.transcript.attach_observation(&record.output);
                outcome.new_secret_hint = scan_for_secrets(&record.output, config, state);
                if record.is_replayable() {
                    state.ledger.record_success(&record.command);
                }
                outcome.execution = Some(record);
            }
        }
    }

    outcome.ended_at = timestamp();
    Ok(outcome)
}

fn scan_for_secrets(
    output: &str,
    config: &AgentConfig,
    state: &mut RunState,
) -> Option<SecretHint> {
    let heuristics = &config.heuristics;
    let hint = detect_secret_hint(
        output,
        &heuristics.secret_families,
        heuristics.secret_snippet_chars,
    )?;
    if state.ledger.record_secret_hint(&hint.name, &hint.context) {
        info!(name = %hint.name, "secret requirement detected");
        Some(hint)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::usage::{FALLBACK_MODEL, default_pricing, price_for};
    use crate::io::substrate::ContextSpec;
    use crate::sandbox::SandboxSettings;
    use crate::test_support::{
        FakeOp, FakeSubstrate, ScriptedCommand, ScriptedOracle, action_reply, final_reply,
        malformed_reply,
    };

    fn config(max_steps: u32) -> AgentConfig {
        AgentConfig {
            repo_url: "https://github.com/acme/widget.git".to_string(),
            max_steps,
            keep_alive: false,
            heuristics: Heuristics::default(),
            price: price_for(&default_pricing(), FALLBACK_MODEL),
        }
    }

    fn engine(fake: &FakeSubstrate) -> SandboxEngine<&FakeSubstrate> {
        SandboxEngine::start(
            fake,
            SandboxSettings {
                base_image: "python:3.10".to_string(),
                context: ContextSpec {
                    workdir: "/app".to_string(),
                    mounts: Vec::new(),
                },
                seed: None,
            },
            Heuristics::default(),
        )
        .expect("start")
    }

    #[test]
    fn success_verdict_ends_run() {
        let fake = FakeSubstrate::new();
        fake.script("pip install .", ScriptedCommand::ok("Successfully installed widget"));
        let oracle = ScriptedOracle::new(vec![
            action_reply("pip install ."),
            final_reply(TerminalOutcome::Success),
        ]);

        let report = run_agent(engine(&fake), &oracle, &config(10), |_| {});
        assert!(report.success);
        assert_eq!(report.stop, RunStop::Terminal(TerminalOutcome::Success));
        assert_eq!(report.steps, 2);
        assert_eq!(report.state.ledger.build_instructions(), ["pip install ."]);
        assert_eq!(report.state.meter.calls(), 2);
        assert_eq!(fake.live_contexts(), 0);
    }

    #[test]
    fn failure_verdict_is_not_success() {
        let fake = FakeSubstrate::new();
        let oracle = ScriptedOracle::new(vec![final_reply(TerminalOutcome::Failure)]);

        let report = run_agent(engine(&fake), &oracle, &config(10), |_| {});
        assert!(!report.success);
        assert_eq!(report.stop, RunStop::Terminal(TerminalOutcome::Failure));
        assert_eq!(fake.count(FakeOp::Exec), 0);
    }

    #[test]
    fn malformed_reply_gets_corrective_observation_and_costs_a_step() {
        let fake = FakeSubstrate::new();
        let oracle = ScriptedOracle::new(vec![
            malformed_reply("I think we should look around."),
            final_reply(TerminalOutcome::Success),
        ]);
        let mut notes = Vec::new();

        let report = run_agent(engine(&fake), &oracle, &config(10), |step| {
            notes.push(step.note.clone());
        });
        assert_eq!(report.steps, 2);
        assert_eq!(notes[0].as_deref(), Some(NO_ACTION_OBSERVATION));
        let requests = oracle.requests();
        assert_eq!(requests[1].last_observation.as_deref(), Some(NO_ACTION_OBSERVATION));
    }

    #[test]
    fn observation_is_previous_command_output() {
        let fake = FakeSubstrate::new();
        fake.base_file("README.md", "# widget\n");
        let oracle = ScriptedOracle::new(vec![
            action_reply("cat README.md"),
            final_reply(TerminalOutcome::Success),
        ]);

        run_agent(engine(&fake), &oracle, &config(10), |_| {});
        let requests = oracle.requests();
        assert_eq!(requests[0].turns, 0);
        assert_eq!(requests[0].last_observation, None);
        assert_eq!(requests[1].last_observation.as_deref(), Some("# widget\n"));
    }

    #[test]
    fn oracle_error_is_fatal_and_still_cleans_up() {
        let fake = FakeSubstrate::new();
        fake.script("make", ScriptedCommand::ok("built"));
        let oracle = ScriptedOracle::repeating(action_reply("make")).failing_at(2);

        let report = run_agent(engine(&fake), &oracle, &config(10), |_| {});
        assert!(!report.success);
        assert!(
            matches!(&report.stop, RunStop::Fatal(msg) if msg.contains("oracle backend unavailable"))
        );
        assert_eq!(fake.live_contexts(), 0);
        assert!(fake.live_snapshots().is_empty());
    }
}
