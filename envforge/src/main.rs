//! envforge: find a working build environment for a repository.
//!
//! `envforge run <REPO_URL>` clones the repository, lets an oracle drive a
//! sandboxed container one command at a time and, on success, writes a
//! Dockerfile replaying every command that changed the environment.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use envforge::agent::{RunStop, StepOutcome};
use envforge::core::transcript::tail_bytes;
use envforge::exit_codes;
use envforge::io::config::{
    ConfigOverrides, DEFAULT_CONFIG_FILE, EnvforgeConfig, load_config, write_config,
};
use envforge::run::{RunOutcome, run_repository};

/// Bytes of command output echoed to the terminal per step.
const TERMINAL_OUTPUT_LIMIT: usize = 2_000;

#[derive(Parser)]
#[command(
    name = "envforge",
    version,
    about = "Discover a reproducible build environment for a repository"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Configure an environment for REPO_URL inside a sandboxed container.
    Run {
        /// Git URL of the repository to configure.
        repo_url: String,
        /// Config file (missing file means defaults).
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Base image for the sandbox.
        #[arg(long)]
        image: Option<String>,
        /// Oracle model name.
        #[arg(long)]
        model: Option<String>,
        /// Step budget.
        #[arg(long)]
        steps: Option<u32>,
        /// Leave the final container running for inspection.
        #[arg(long)]
        keep_container: bool,
        /// Host directory to clone into (an earlier checkout there is replaced).
        #[arg(long)]
        workplace: Option<PathBuf>,
        /// Output directory for run artifacts.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Enable debug diagnostics on stderr.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write the default `envforge.toml`.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Command::Run { verbose: true, .. });
    envforge::logging::init(verbose);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force, config } => cmd_init(&config, force),
        Command::Run {
            repo_url,
            config,
            image,
            model,
            steps,
            keep_container,
            workplace,
            out,
            verbose: _,
        } => {
            let mut cfg = load_config(&config)?;
            cfg.apply_overrides(ConfigOverrides {
                base_image: image,
                model,
                max_steps: steps,
                keep_container,
                workplace,
                output_dir: out,
            })?;
            cmd_run(&cfg, &repo_url)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &EnvforgeConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &EnvforgeConfig, repo_url: &str) -> Result<i32> {
    println!("Configuring {repo_url} on {}", cfg.sandbox.base_image);
    let outcome = run_repository(cfg, repo_url, print_step)?;
    print_verdict(cfg, &outcome);
    Ok(exit_code_for(&outcome.report.stop))
}

fn exit_code_for(stop: &RunStop) -> i32 {
    match stop {
        RunStop::Terminal(envforge::core::types::TerminalOutcome::Success) => exit_codes::OK,
        RunStop::Fatal(_) => exit_codes::INVALID,
        RunStop::Terminal(_) | RunStop::BudgetExhausted => exit_codes::INCOMPLETE,
    }
}

fn print_step(step: &StepOutcome) {
    println!("\n--- Step {} ---", step.step);
    if let Some(thought) = &step.reply.thought {
        println!("[Thought]\n{thought}");
    }
    if let Some(action) = &step.reply.action {
        println!("[Action]\n{action}");
    }
    if let Some(record) = &step.execution {
        let verdict = match (record.success, record.snapshot.as_deref()) {
            (true, Some(snapshot)) => format!("ok, snapshot {snapshot}"),
            (true, None) => "ok".to_string(),
            (false, _) => "failed, rolled back".to_string(),
        };
        println!("[Observation] exit {} ({verdict})", record.exit_code);
        println!("{}", tail_bytes(record.output.trim_end(), TERMINAL_OUTPUT_LIMIT));
    }
    if let Some(note) = &step.note {
        println!("[Observation]\n{note}");
    }
    if let Some(hint) = &step.new_secret_hint {
        println!("[Secret] {} may be required", hint.name);
    }
    println!(
        "[Cost] in={} out={} step=${:.6} total=${:.6}",
        step.cost.input_tokens, step.cost.output_tokens, step.cost.step_cost, step.cost.total_cost
    );
}

fn print_verdict(cfg: &EnvforgeConfig, outcome: &RunOutcome) {
    let summary = &outcome.summary;
    let run_dir = cfg.output_dir.join("runs").join(&outcome.run_id);
    println!();
    match &outcome.report.stop {
        RunStop::Terminal(envforge::core::types::TerminalOutcome::Success) => {
            println!("Environment configured in {} steps.", summary.steps);
            println!("Dockerfile: {}", run_dir.join("Dockerfile").display());
        }
        RunStop::Terminal(_) => println!("Oracle gave up after {} steps.", summary.steps),
        RunStop::BudgetExhausted => {
            println!("Step budget of {} exhausted; configuration incomplete.", cfg.max_steps);
        }
        RunStop::Fatal(message) => println!("Run aborted: {message}"),
    }
    for hint in &summary.secret_hints {
        println!("Requires secret {}: {}", hint.name, hint.context.trim());
    }
    println!(
        "Oracle: {} calls, {} in / {} out tokens, ${:.4}",
        summary.oracle.calls,
        summary.oracle.input_tokens,
        summary.oracle.output_tokens,
        summary.oracle.total_cost
    );
    if let Some(id) = &summary.kept_container {
        let docker = &cfg.sandbox.docker_bin;
        println!("Container kept alive: {id}");
        println!("  inspect: {docker} exec -it {id} /bin/bash");
        println!("  remove:  {docker} rm -f {id}");
    }
    if let Some(error) = &outcome.report.cleanup_error {
        eprintln!("cleanup failed: {error}");
    }
    println!("Run log: {}", run_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use envforge::core::types::TerminalOutcome;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["envforge", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false, .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["envforge", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "envforge",
            "run",
            "https://github.com/acme/widget.git",
            "--image",
            "node:20",
            "--steps",
            "5",
            "--keep-container",
        ]);
        let Command::Run {
            repo_url,
            config,
            image,
            steps,
            keep_container,
            verbose,
            ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(repo_url, "https://github.com/acme/widget.git");
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert_eq!(image.as_deref(), Some("node:20"));
        assert_eq!(steps, Some(5));
        assert!(keep_container);
        assert!(!verbose);
    }

    #[test]
    fn exit_codes_follow_stop_reason() {
        assert_eq!(
            exit_code_for(&RunStop::Terminal(TerminalOutcome::Success)),
            exit_codes::OK
        );
        assert_eq!(
            exit_code_for(&RunStop::Terminal(TerminalOutcome::Failure)),
            exit_codes::INCOMPLETE
        );
        assert_eq!(exit_code_for(&RunStop::BudgetExhausted), exit_codes::INCOMPLETE);
        assert_eq!(
            exit_code_for(&RunStop::Fatal("docker down".to_string())),
            exit_codes::INVALID
        );
    }
}
