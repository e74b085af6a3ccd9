//! Host-side checkout that gets bind-mounted into the sandbox.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::io::process::{ProcessLimits, run_process};

const CLONE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CLONE_OUTPUT_LIMIT: usize = 64 * 1024;

/// Wipe `path`, recreate it and clone `repo_url` into it.
///
/// Only an empty directory or a previous checkout (one with a `.git` entry)
/// is wiped, and never the current directory or one of its ancestors.
/// Returns the absolute workplace path suitable for a bind mount.
#[instrument(skip_all, fields(path = %path.display(), repo_url = %repo_url))]
pub fn prepare_workplace(path: &Path, repo_url: &str) -> Result<PathBuf> {
    if path.exists() {
        ensure_replaceable(path)?;
        fs::remove_dir_all(path)
            .with_context(|| format!("remove old workplace {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("create workplace {}", path.display()))?;
    let absolute = path
        .canonicalize()
        .with_context(|| format!("resolve workplace {}", path.display()))?;

    info!(repo_url, "cloning repository");
    let mut cmd = Command::new("git");
    cmd.arg("clone").arg(repo_url).arg(".").current_dir(&absolute);
    let limits = ProcessLimits {
        timeout: CLONE_TIMEOUT,
        output_limit_bytes: CLONE_OUTPUT_LIMIT,
    };
    let output = run_process(cmd, None, &limits, None).context("run git clone")?;
    if output.timed_out {
        return Err(anyhow!("git clone timed out after {:?}", CLONE_TIMEOUT));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "git clone {repo_url} failed: {}",
            output.stderr_text().trim()
        ));
    }
    Ok(absolute)
}

fn ensure_replaceable(path: &Path) -> Result<()> {
    let absolute = path
        .canonicalize()
        .with_context(|| format!("resolve workplace {}", path.display()))?;
    let cwd = std::env::current_dir()
        .and_then(|dir| dir.canonicalize())
        .context("resolve current directory")?;
    if cwd.starts_with(&absolute) {
        return Err(anyhow!(
            "refusing to wipe workplace {}: it contains the current directory",
            absolute.display()
        ));
    }
    if !absolute.is_dir() {
        return Err(anyhow!("workplace {} is not a directory", absolute.display()));
    }
    let previous_checkout = absolute.join(".git").exists();
    let empty = fs::read_dir(&absolute)
        .with_context(|| format!("read workplace {}", absolute.display()))?
        .next()
        .is_none();
    if !previous_checkout && !empty {
        return Err(anyhow!(
            "refusing to wipe workplace {}: not empty and not a git checkout",
            absolute.display()
        ));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    /// Verifies an existing workplace is replaced by a fresh clone.
    #[test]
    fn clones_into_fresh_workplace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin");
        fs::create_dir_all(&origin).expect("mkdir origin");
        git(&origin, &["init", "-q"]);
        git(&origin, &["config", "user.email", "dev@example.com"]);
        git(&origin, &["config", "user.name", "dev"]);
        fs::write(origin.join("requirements.txt"), "requests\n").expect("write");
        git(&origin, &["add", "."]);
        git(&origin, &["commit", "-q", "-m", "init"]);

        let workplace = temp.path().join("workplace");
        fs::create_dir_all(workplace.join(".git")).expect("mkdir workplace");
        fs::write(workplace.join("stale.txt"), "old").expect("write stale");

        let url = origin.display().to_string();
        let mounted = prepare_workplace(&workplace, &url).expect("prepare");
        assert!(mounted.is_absolute());
        assert!(mounted.join("requirements.txt").is_file());
        assert!(!mounted.join("stale.txt").exists());
    }

    /// Verifies a directory holding unrelated files is left alone.
    #[test]
    fn foreign_directory_is_not_wiped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let notes = temp.path().join("notes.txt");
        fs::write(&notes, "keep me").expect("write");

        let err = prepare_workplace(temp.path(), "https://github.com/acme/widget.git")
            .expect_err("non-empty directory");
        assert!(err.to_string().contains("not a git checkout"), "{err}");
        assert_eq!(fs::read_to_string(&notes).expect("read"), "keep me");
    }

    /// Verifies the current directory and its ancestors are refused.
    #[test]
    fn current_directory_is_not_wiped() {
        let cwd = std::env::current_dir().expect("cwd");
        let root = cwd.ancestors().last().expect("root").to_path_buf();
        for path in [PathBuf::from("."), cwd.clone(), root] {
            let err = prepare_workplace(&path, "https://github.com/acme/widget.git")
                .expect_err("current directory");
            assert!(err.to_string().contains("current directory"), "{}: {err}", path.display());
        }
        assert!(cwd.exists());
    }

    #[test]
    fn clone_failure_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("no-such-repo");
        let err = prepare_workplace(&temp.path().join("wp"), &missing.display().to_string())
            .unwrap_err();
        assert!(err.to_string().contains("git clone"));
    }
}
