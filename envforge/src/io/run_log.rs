//! Run artifacts under `<output_dir>/runs/<run-id>/`.
//!
//! These are product output: always written, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::debug;

use crate::core::ledger::{BuildScript, render_setup_script};
use crate::core::transcript::tail_bytes;
use crate::core::types::SecretHint;
use crate::core::usage::StepCost;
use crate::io::config::write_atomic;

/// Output kept in a step log; the full text already went to the oracle.
const STEP_OUTPUT_LIMIT: usize = 64 * 1024;

/// `run-<UTC timestamp>-<6 random lowercase alphanumerics>`.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

/// Current UTC time as RFC 3339.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    OracleSuccess,
    OracleFailure,
    BudgetExhausted,
    Fatal,
}

/// Outcome of the command executed in one step, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepExecution {
    pub exit_code: i32,
    pub success: bool,
    pub mutating: bool,
    pub snapshot: Option<String>,
    pub output: String,
}

/// One loop step as written to `steps/<n>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct StepLog {
    pub step: u32,
    pub started_at: String,
    pub ended_at: String,
    pub thought: Option<String>,
    pub action: Option<String>,
    pub execution: Option<StepExecution>,
    /// What was fed back when no command ran (malformed reply), or the error
    /// that ended the run.
    pub note: Option<String>,
    pub cost: StepCost,
}

impl StepLog {
    /// Bound the stored output so step logs stay small.
    pub fn with_bounded_output(mut self) -> Self {
        if let Some(execution) = &mut self.execution {
            execution.output = tail_bytes(&execution.output, STEP_OUTPUT_LIMIT);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OracleTotals {
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
}

/// `run.json`: the verdict and everything needed to reproduce the environment.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub repo_url: String,
    pub base_image: String,
    pub model: String,
    pub started_at: String,
    pub ended_at: String,
    pub success: bool,
    pub stop_reason: StopReason,
    pub steps: u32,
    pub error: Option<String>,
    pub oracle: OracleTotals,
    pub instructions: Vec<String>,
    pub setup_commands: Vec<String>,
    pub secret_hints: Vec<SecretHint>,
    pub kept_container: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub steps_dir: PathBuf,
    pub summary_path: PathBuf,
    pub dockerfile_path: PathBuf,
    pub setup_script_path: PathBuf,
}

impl RunPaths {
    pub fn new(output_dir: &Path, run_id: &str) -> Self {
        let dir = output_dir.join("runs").join(run_id);
        Self {
            steps_dir: dir.join("steps"),
            summary_path: dir.join("run.json"),
            dockerfile_path: dir.join("Dockerfile"),
            setup_script_path: dir.join("setup.sh"),
            dir,
        }
    }

    pub fn step_path(&self, step: u32) -> PathBuf {
        self.steps_dir.join(format!("{step}.json"))
    }
}

/// Writes step logs and final artifacts for one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    paths: RunPaths,
}

impl RunLog {
    pub fn create(output_dir: &Path, run_id: &str) -> Result<Self> {
        let paths = RunPaths::new(output_dir, run_id);
        fs::create_dir_all(&paths.steps_dir)
            .with_context(|| format!("create run dir {}", paths.dir.display()))?;
        debug!(dir = %paths.dir.display(), "run directory created");
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn write_step(&self, log: &StepLog) -> Result<PathBuf> {
        let path = self.paths.step_path(log.step);
        write_json(&path, log)?;
        Ok(path)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        buf.push('\n');
        write_atomic(&self.paths.summary_path, &buf)
    }

    /// Write `Dockerfile` and `setup.sh` for a configured environment.
    pub fn write_build_artifacts(&self, script: &BuildScript, setup: &[String]) -> Result<()> {
        write_text(&self.paths.dockerfile_path, &script.render_dockerfile())?;
        write_text(&self.paths.setup_script_path, &render_setup_script(setup))?;
        Ok(())
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::Ledger;

    #[test]
    fn run_ids_have_timestamp_and_suffix() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "run");
        assert!(parts[1].ends_with('Z'));
        assert_eq!(parts[2].len(), 6);
        assert!(
            parts[2]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn run_paths_are_stable() {
        let paths = RunPaths::new(Path::new(".envforge"), "run-1");
        assert_eq!(paths.dir, Path::new(".envforge/runs/run-1"));
        assert_eq!(paths.step_path(3), Path::new(".envforge/runs/run-1/steps/3.json"));
        assert!(paths.summary_path.ends_with("run.json"));
    }

    #[test]
    fn writes_steps_summary_and_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::create(temp.path(), "run-x").expect("create");

        let step = StepLog {
            step: 1,
            started_at: timestamp(),
            ended_at: timestamp(),
            thought: Some("install".to_string()),
            action: Some("pip install -r requirements.txt".to_string()),
            execution: Some(StepExecution {
                exit_code: 0,
                success: true,
                mutating: true,
                snapshot: Some("envforge-snapshot:run-x-1".to_string()),
                output: "y".repeat(STEP_OUTPUT_LIMIT + 10),
            }),
            note: None,
            cost: StepCost::default(),
        }
        .with_bounded_output();
        let step_path = log.write_step(&step).expect("write step");
        let written = fs::read_to_string(step_path).expect("read step");
        assert!(written.contains("bytes omitted"));

        let mut ledger = Ledger::new(vec!["pip install".to_string()]);
        ledger.record_success("pip install -r requirements.txt");
        ledger.record_success("python setup.py build_ext");
        let script = BuildScript::from_ledger(&ledger, "python:3.10", "/app");
        log.write_build_artifacts(&script, ledger.build_setup_subset())
            .expect("write artifacts");
        let dockerfile = fs::read_to_string(&log.paths().dockerfile_path).expect("dockerfile");
        assert!(dockerfile.starts_with("FROM python:3.10\nWORKDIR /app\n"));
        let setup = fs::read_to_string(&log.paths().setup_script_path).expect("setup");
        assert!(setup.contains("pip install -r requirements.txt"));
        assert!(!setup.contains("build_ext"));

        let summary = RunSummary {
            run_id: "run-x".to_string(),
            repo_url: "https://github.com/acme/widget.git".to_string(),
            base_image: "python:3.10".to_string(),
            model: "gpt-4o".to_string(),
            started_at: timestamp(),
            ended_at: timestamp(),
            success: true,
            stop_reason: StopReason::OracleSuccess,
            steps: 1,
            error: None,
            oracle: OracleTotals::default(),
            instructions: ledger.build_instructions().to_vec(),
            setup_commands: ledger.build_setup_subset().to_vec(),
            secret_hints: Vec::new(),
            kept_container: None,
        };
        log.write_summary(&summary).expect("write summary");
        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&log.paths().summary_path).expect("read summary"),
        )
        .expect("parse summary");
        assert_eq!(json["stop_reason"], "oracle_success");
        assert_eq!(json["instructions"][1], "python setup.py build_ext");
    }
}
