//! `envforge run`: wire config, workplace, substrate and oracle into one run.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::agent::{AgentConfig, RunReport, RunStop, StepOutcome, run_agent};
use crate::core::ledger::BuildScript;
use crate::core::types::TerminalOutcome;
use crate::core::usage::price_for;
use crate::io::config::{EnvforgeConfig, OracleBackend};
use crate::io::docker::{DockerSettings, DockerSubstrate};
use crate::io::oracle::{CodexOracle, CommandOracle, Oracle, oracle_dir};
use crate::io::prompt::PromptEnvironment;
use crate::io::run_log::{
    OracleTotals, RunLog, RunSummary, StepExecution, StepLog, StopReason, generate_run_id,
    timestamp,
};
use crate::io::substrate::{ContextSpec, Mount, MountMode, Substrate};
use crate::io::workplace::prepare_workplace;
use crate::sandbox::{SandboxEngine, SandboxSettings};

/// Container path of the read-only checkout mount.
pub const SOURCE_MOUNT: &str = "/envforge/source";

/// Result of a finished run plus where its artifacts live.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub report: RunReport,
    pub summary: RunSummary,
}

pub fn stop_reason(stop: &RunStop) -> StopReason {
    match stop {
        RunStop::Terminal(TerminalOutcome::Success) => StopReason::OracleSuccess,
        RunStop::Terminal(TerminalOutcome::Failure) => StopReason::OracleFailure,
        RunStop::BudgetExhausted => StopReason::BudgetExhausted,
        RunStop::Fatal(_) => StopReason::Fatal,
    }
}

pub fn agent_config(cfg: &EnvforgeConfig, repo_url: &str) -> AgentConfig {
    AgentConfig {
        repo_url: repo_url.to_string(),
        max_steps: cfg.max_steps,
        keep_alive: cfg.keep_container,
        heuristics: cfg.heuristics.clone(),
        price: price_for(&cfg.pricing, &cfg.oracle.model),
    }
}

/// Clone the repository, start the sandbox and run the loop against Docker.
pub fn run_repository<F: FnMut(&StepOutcome)>(
    cfg: &EnvforgeConfig,
    repo_url: &str,
    on_step: F,
) -> Result<RunOutcome> {
    let run_id = generate_run_id();
    let run_log = RunLog::create(&cfg.output_dir, &run_id)?;
    info!(run_id = %run_id, dir = %run_log.paths().dir.display(), "run started");

    let workplace = prepare_workplace(&cfg.workplace, repo_url)?;
    let substrate = DockerSubstrate::new(DockerSettings {
        docker_bin: cfg.sandbox.docker_bin.clone(),
        command_timeout: cfg.sandbox.command_timeout(),
        output_limit_bytes: cfg.sandbox.output_limit_bytes,
        snapshot_repository: cfg.sandbox.snapshot_repository.clone(),
        run_label: run_id.clone(),
    });
    let settings = sandbox_settings(cfg, &workplace);
    let engine = SandboxEngine::start(substrate, settings, cfg.heuristics.clone())
        .context("start sandbox")?;
    let oracle = build_oracle(cfg, &run_log.paths().dir, &workplace);
    run_with(engine, oracle.as_ref(), cfg, repo_url, &run_id, &run_log, on_step)
}

/// The checkout is mounted read-only and copied into the workdir, so the
/// workdir lives in the container layer that snapshots capture.
pub fn sandbox_settings(cfg: &EnvforgeConfig, workplace: &Path) -> SandboxSettings {
    let workdir = &cfg.sandbox.workdir;
    SandboxSettings {
        base_image: cfg.sandbox.base_image.clone(),
        context: ContextSpec {
            workdir: workdir.clone(),
            mounts: vec![Mount {
                host: workplace.to_path_buf(),
                target: SOURCE_MOUNT.to_string(),
                mode: MountMode::Ro,
            }],
        },
        seed: Some(format!("cp -a {SOURCE_MOUNT}/. {workdir}")),
    }
}

fn build_oracle(cfg: &EnvforgeConfig, run_dir: &Path, workplace: &Path) -> Box<dyn Oracle> {
    let prompt_env = PromptEnvironment {
        base_image: cfg.sandbox.base_image.clone(),
        workdir: cfg.sandbox.workdir.clone(),
        observation_limit_bytes: cfg.oracle.observation_limit_bytes,
    };
    match cfg.oracle.backend {
        OracleBackend::Codex => Box::new(CodexOracle {
            codex_bin: cfg.oracle.codex_bin.clone(),
            model: cfg.oracle.model.clone(),
            timeout: cfg.oracle.timeout(),
            prompt_env,
            work_dir: oracle_dir(run_dir),
        }),
        OracleBackend::Command => Box::new(CommandOracle {
            argv: cfg.oracle.command.clone(),
            timeout: cfg.oracle.timeout(),
            prompt_env,
            workdir: Some(workplace.to_path_buf()),
        }),
    }
}

/// Run the loop on a started engine, logging every step and the final artifacts.
pub fn run_with<S, O, F>(
    engine: SandboxEngine<S>,
    oracle: &O,
    cfg: &EnvforgeConfig,
    repo_url: &str,
    run_id: &str,
    run_log: &RunLog,
    mut on_step: F,
) -> Result<RunOutcome>
where
    S: Substrate,
    O: Oracle + ?Sized,
    F: FnMut(&StepOutcome),
{
    let started_at = timestamp();
    let agent_cfg = agent_config(cfg, repo_url);
    let report = run_agent(engine, oracle, &agent_cfg, |step| {
        if let Err(err) = run_log.write_step(&step_log(step)) {
            warn!(step = step.step, err = ?err, "failed to write step log");
        }
        on_step(step);
    });

    let ledger = &report.state.ledger;
    let meter = &report.state.meter;
    let summary = RunSummary {
        run_id: run_id.to_string(),
        repo_url: repo_url.to_string(),
        base_image: cfg.sandbox.base_image.clone(),
        model: cfg.oracle.model.clone(),
        started_at,
        ended_at: timestamp(),
        success: report.success,
        stop_reason: stop_reason(&report.stop),
        steps: report.steps,
        error: match &report.stop {
            RunStop::Fatal(message) => Some(message.clone()),
            _ => report.cleanup_error.clone(),
        },
        oracle: OracleTotals {
            calls: meter.calls(),
            input_tokens: meter.input_tokens(),
            output_tokens: meter.output_tokens(),
            total_cost: meter.total_cost(),
        },
        instructions: ledger.build_instructions().to_vec(),
        setup_commands: ledger.build_setup_subset().to_vec(),
        secret_hints: ledger.secret_hints().to_vec(),
        kept_container: report.kept_context.as_ref().map(|ctx| ctx.id.clone()),
    };
    run_log.write_summary(&summary)?;

    if report.success {
        let script =
            BuildScript::from_ledger(ledger, &cfg.sandbox.base_image, &cfg.sandbox.workdir);
        run_log.write_build_artifacts(&script, ledger.build_setup_subset())?;
        info!(
            dockerfile = %run_log.paths().dockerfile_path.display(),
            instructions = ledger.build_instructions().len(),
            "build artifacts written"
        );
    }

    Ok(RunOutcome {
        run_id: run_id.to_string(),
        report,
        summary,
    })
}

fn step_log(step: &StepOutcome) -> StepLog {
    StepLog {
        step: step.step,
        started_at: step.started_at.clone(),
        ended_at: step.ended_at.clone(),
        thought: step.reply.thought.clone(),
        action: step.reply.action.clone(),
        execution: step.execution.as_ref().map(|record| StepExecution {
            exit_code: record.exit_code,
            success: record.success,
            mutating: record.mutating,
            snapshot: record.snapshot.clone(),
            output: record.output.clone(),
        }),
        note: step.note.clone(),
        cost: step.cost,
    }
    .with_bounded_output()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_is_mounted_read_only_and_seeded_into_workdir() {
        let cfg = EnvforgeConfig::default();
        let settings = sandbox_settings(&cfg, Path::new("/tmp/workplace"));

        assert_eq!(settings.context.workdir, "/app");
        assert_eq!(settings.context.mounts.len(), 1);
        let mount = &settings.context.mounts[0];
        assert_eq!(mount.mode, MountMode::Ro);
        assert_eq!(mount.target, SOURCE_MOUNT);
        assert_ne!(mount.target, settings.context.workdir);
        assert_eq!(
            settings.seed.as_deref(),
            Some("cp -a /envforge/source/. /app")
        );
    }
}
