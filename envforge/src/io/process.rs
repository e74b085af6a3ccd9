//! Child process execution with a wall-clock timeout and bounded output.
//!
//! Every external program envforge drives (`docker`, `git`, oracle CLIs) goes
//! through [`run_process`], so pipe draining, truncation and timeout handling
//! live in one place.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How to run one child process.
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Exit code, or `-1` when the process was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&truncated_notice("stdout", self.stdout_truncated));
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        text.push_str(&truncated_notice("stderr", self.stderr_truncated));
        text
    }
}

fn truncated_notice(label: &str, truncated: usize) -> String {
    if truncated > 0 {
        format!("\n[{label} truncated {truncated} bytes]\n")
    } else {
        String::new()
    }
}

/// Run `cmd`, optionally feeding `stdin` and tee-ing stdout lines to `tee_path`.
///
/// Output is read concurrently while the child runs so a chatty process can
/// never deadlock on a full pipe. A timed-out child is killed and reported
/// with `timed_out = true` rather than as an error; only failures to spawn or
/// wait are errors.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), tee = tee_path.is_some()))]
pub fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: &ProcessLimits,
    tee_path: Option<PathBuf>,
) -> Result<ProcessOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn command {program}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tee = match tee_path {
        Some(path) => Some(open_tee(path)?),
        None => None,
    };
    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit, tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit, None));

    // Feed stdin only once both pipes are being drained.
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(err) = child_stdin.write_all(input) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err).context("write stdin");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(limits.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                program = %program,
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type TeeWriter = Arc<Mutex<BufWriter<File>>>;

fn open_tee(path: PathBuf) -> Result<TeeWriter> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create tee dir {}", parent.display()))?;
    }
    let file =
        File::create(&path).with_context(|| format!("create tee file {}", path.display()))?;
    Ok(Arc::new(Mutex::new(BufWriter::new(file))))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read `reader` in fixed-size chunks, keeping at most `limit` bytes.
///
/// Memory stays bounded even for output without newlines. Every chunk is
/// written through to `tee` and flushed, so the tee file follows the child
/// while it runs.
fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    tee: Option<TeeWriter>,
) -> Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = &tee
            && let Ok(mut writer) = writer.lock()
            && let Err(e) = writer.write_all(&chunk[..n]).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write tee file");
        }
        keep_within_limit(&mut collected, &mut truncated, &chunk[..n], limit);
    }

    Ok((collected, truncated))
}

fn keep_within_limit(collected: &mut Vec<u8>, truncated: &mut usize, bytes: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(collected.len());
    let keep = bytes.len().min(remaining);
    collected.extend_from_slice(&bytes[..keep]);
    *truncated += bytes.len() - keep;
}
