//! [`Substrate`] implementation driving the `docker` CLI.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::io::process::{ProcessLimits, ProcessOutput, run_process};
use crate::io::substrate::{ContextSpec, ExecOutput, ExecutionContext, Substrate, SubstrateError};

/// Exit status reported for a command killed by the per-command timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Budget for lifecycle calls (run, commit, rm); these never run user code.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(600);
const LIFECYCLE_OUTPUT_LIMIT: usize = 64 * 1024;

/// Client stderr fragments that mean the daemon cannot be reached.
const UNREACHABLE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
];

/// Client stderr fragments that mean the target container is gone or stopped.
const DEAD_CONTEXT_MARKERS: &[&str] = &["no such container", "is not running", "is paused"];

#[derive(Debug, Clone)]
pub struct DockerSettings {
    pub docker_bin: String,
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Repository name used when tagging snapshot images.
    pub snapshot_repository: String,
    /// Unique per run; snapshot tags are `<repository>:<run_label>-<n>`.
    pub run_label: String,
}

/// Docker CLI substrate. Contexts are containers, snapshots are tagged images.
#[derive(Debug)]
pub struct DockerSubstrate {
    settings: DockerSettings,
}

impl DockerSubstrate {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    fn docker(&self) -> Command {
        Command::new(&self.settings.docker_bin)
    }

    fn lifecycle_limits() -> ProcessLimits {
        ProcessLimits {
            timeout: LIFECYCLE_TIMEOUT,
            output_limit_bytes: LIFECYCLE_OUTPUT_LIMIT,
        }
    }

    /// Run a lifecycle command and return its trimmed stdout.
    fn run_lifecycle(&self, operation: &'static str, args: &[String]) -> Result<String, SubstrateError> {
        let mut cmd = self.docker();
        cmd.args(args);
        let output = run_process(cmd, None, &Self::lifecycle_limits(), None)
            .map_err(|err| SubstrateError::unreachable(operation, format!("{err:#}")))?;
        if output.timed_out {
            return Err(SubstrateError::unreachable(
                operation,
                format!("docker {operation} timed out after {}s", LIFECYCLE_TIMEOUT.as_secs()),
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            return Err(classify_client_failure(operation, stderr.trim()));
        }
        Ok(output.stdout_text().trim().to_string())
    }
}

/// Arguments for `docker run` that start a long-lived shell container.
pub fn run_args(spec: &ContextSpec, image: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "-t".to_string(),
        "-w".to_string(),
        spec.workdir.clone(),
    ];
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:{}",
            mount.host.display(),
            mount.target,
            mount.mode.as_str()
        ));
    }
    args.push(image.to_string());
    args.push("/bin/bash".to_string());
    args
}

/// Arguments for `docker exec` with stderr folded into stdout.
pub fn exec_args(ctx: &ExecutionContext, command: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "-w".to_string(),
        ctx.workdir.clone(),
        ctx.id.clone(),
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!("exec 2>&1\n{command}"),
    ]
}

fn contains_any(stderr: &str, markers: &[&str]) -> bool {
    let lowered = stderr.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

/// Map a failed docker client call to the substrate error kind.
pub fn classify_client_failure(operation: &'static str, stderr: &str) -> SubstrateError {
    if contains_any(stderr, UNREACHABLE_MARKERS) {
        SubstrateError::unreachable(operation, stderr)
    } else {
        SubstrateError::rejected(operation, stderr)
    }
}

/// Substrate error for a failed `docker exec`, or `None` when the failure
/// belongs to the command inside the container.
///
/// The command's own stderr is folded into stdout, so `client_stderr` only
/// carries what the docker client printed.
pub fn classify_exec_failure(client_stderr: &str) -> Option<SubstrateError> {
    let stderr = client_stderr.trim();
    if contains_any(stderr, UNREACHABLE_MARKERS) {
        Some(SubstrateError::unreachable("exec", stderr))
    } else if contains_any(stderr, DEAD_CONTEXT_MARKERS) {
        Some(SubstrateError::rejected("exec", stderr))
    } else {
        None
    }
}

fn is_missing_container(stderr: &str) -> bool {
    contains_any(stderr, &["no such container"])
}

fn exec_output(output: &ProcessOutput, timeout: Duration) -> ExecOutput {
    let mut text = output.stdout_text();
    if output.timed_out {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!(
            "[command timed out after {}s]\n",
            timeout.as_secs()
        ));
        return ExecOutput {
            exit_code: TIMEOUT_EXIT_CODE,
            output: text,
        };
    }
    ExecOutput {
        exit_code: output.exit_code(),
        output: text,
    }
}

impl Substrate for DockerSubstrate {
    #[instrument(skip_all, fields(image = %image))]
    fn start(&self, spec: &ContextSpec, image: &str) -> Result<ExecutionContext, SubstrateError> {
        let id = self.run_lifecycle("run", &run_args(spec, image))?;
        if id.is_empty() {
            return Err(SubstrateError::rejected("run", "docker run printed no container id"));
        }
        let ctx = ExecutionContext {
            id,
            workdir: spec.workdir.clone(),
            mounts: spec.mounts.clone(),
            image: image.to_string(),
        };
        info!(container = %ctx.short_id(), "container started");

        let mkdir = self.exec(&ctx, &format!("mkdir -p {}", ctx.workdir))?;
        if mkdir.exit_code != 0 {
            warn!(exit_code = mkdir.exit_code, output = %mkdir.output.trim(), "failed to create workdir");
        }
        Ok(ctx)
    }

    #[instrument(skip_all, fields(container = %ctx.short_id()))]
    fn exec(&self, ctx: &ExecutionContext, command: &str) -> Result<ExecOutput, SubstrateError> {
        let mut cmd = self.docker();
        cmd.args(exec_args(ctx, command));
        let limits = ProcessLimits {
            timeout: self.settings.command_timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
        };
        let output = run_process(cmd, None, &limits, None)
            .map_err(|err| SubstrateError::unreachable("exec", format!("{err:#}")))?;

        if !output.status.success() && !output.timed_out {
            if let Some(err) = classify_exec_failure(&output.stderr_text()) {
                return Err(err);
            }
        }
        let result = exec_output(&output, self.settings.command_timeout);
        debug!(exit_code = result.exit_code, bytes = result.output.len(), "command finished");
        Ok(result)
    }

    #[instrument(skip_all, fields(container = %ctx.short_id(), label = %label))]
    fn snapshot(&self, ctx: &ExecutionContext, label: &str) -> Result<String, SubstrateError> {
        let tag = format!(
            "{}:{}-{label}",
            self.settings.snapshot_repository, self.settings.run_label
        );
        self.run_lifecycle("commit", &["commit".to_string(), ctx.id.clone(), tag.clone()])?;
        info!(tag = %tag, "snapshot committed");
        Ok(tag)
    }

    fn remove_snapshot(&self, snapshot: &str) -> Result<(), SubstrateError> {
        self.run_lifecycle("rmi", &["rmi".to_string(), snapshot.to_string()])?;
        debug!(tag = %snapshot, "snapshot removed");
        Ok(())
    }

    fn destroy(&self, ctx: &ExecutionContext) -> Result<(), SubstrateError> {
        match self.run_lifecycle("rm", &["rm".to_string(), "-f".to_string(), ctx.id.clone()]) {
            Ok(_) => debug!(container = %ctx.short_id(), "container removed"),
            Err(SubstrateError::Rejected { message, .. }) if is_missing_container(&message) => {
                debug!(container = %ctx.short_id(), "container already gone");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn prune(&self) -> Result<(), SubstrateError> {
        let args = ["image", "prune", "-f", "--filter", "dangling=true"].map(String::from);
        self.run_lifecycle("image prune", &args)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::io::substrate::{Mount, MountMode};

    fn context() -> ExecutionContext {
        ExecutionContext {
            id: "abc123".to_string(),
            workdir: "/app".to_string(),
            mounts: Vec::new(),
            image: "python:3.10".to_string(),
        }
    }

    #[test]
    fn run_args_bind_mounts_and_keep_a_shell_alive() {
        let spec = ContextSpec {
            workdir: "/app".to_string(),
            mounts: vec![Mount {
                host: PathBuf::from("/tmp/workplace"),
                target: "/app".to_string(),
                mode: MountMode::Rw,
            }],
        };
        assert_eq!(
            run_args(&spec, "python:3.10"),
            vec![
                "run", "-d", "-t", "-w", "/app", "-v", "/tmp/workplace:/app:rw", "python:3.10",
                "/bin/bash",
            ]
        );
    }

    #[test]
    fn exec_args_fold_stderr_into_stdout() {
        let args = exec_args(&context(), "pip install -e .");
        assert_eq!(&args[..4], ["exec", "-w", "/app", "abc123"]);
        assert_eq!(args[6], "exec 2>&1\npip install -e .");
    }

    #[test]
    fn exec_failures_split_by_cause() {
        let err = classify_exec_failure(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.\n",
        )
        .expect("daemon down");
        assert!(matches!(err, SubstrateError::Unreachable { operation: "exec", .. }));

        let err = classify_exec_failure(
            "Error response from daemon: container 3f2a is not running",
        )
        .expect("stopped container");
        assert!(matches!(err, SubstrateError::Rejected { operation: "exec", .. }));

        let err = classify_exec_failure("Error response from daemon: No such container: abc")
            .expect("removed container");
        assert!(matches!(err, SubstrateError::Rejected { operation: "exec", .. }));

        assert!(classify_exec_failure("").is_none());
        assert!(classify_exec_failure("bash: line 1: pytest: command not found").is_none());
    }

    #[test]
    fn client_failures_split_into_unreachable_and_rejected() {
        let err = classify_client_failure(
            "commit",
            "Cannot connect to the Docker daemon. Is the docker daemon running?",
        );
        assert!(matches!(err, SubstrateError::Unreachable { operation: "commit", .. }));

        let err = classify_client_failure("run", "Unable to find image 'nope:latest' locally");
        assert!(matches!(err, SubstrateError::Rejected { operation: "run", .. }));
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_command_reports_exit_124() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf partial; exec sleep 5");
        let limits = ProcessLimits {
            timeout: Duration::from_millis(200),
            output_limit_bytes: 1024,
        };
        let output = run_process(cmd, None, &limits, None).expect("run");
        let result = exec_output(&output, Duration::from_secs(7));
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.output.ends_with("[command timed out after 7s]\n"));
    }
}
