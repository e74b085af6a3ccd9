//! Execution substrate abstraction.
//!
//! The [`Substrate`] trait decouples the sandbox engine from the container
//! runtime. [`crate::io::docker::DockerSubstrate`] drives the `docker` CLI;
//! tests use an in-memory fake that simulates file effects.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of the substrate itself (never of the command being run).
///
/// `Unreachable` is always fatal to a run. `Rejected` is fatal for lifecycle
/// calls; from `exec` it means the context itself is gone, which the engine
/// treats as a failed command and rolls back.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The runtime could not be reached or the client could not be spawned.
    #[error("execution substrate unreachable during {operation}: {message}")]
    Unreachable {
        operation: &'static str,
        message: String,
    },
    /// The runtime answered with an error about the request or its context.
    #[error("{operation} rejected by execution substrate: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl SubstrateError {
    pub fn unreachable(operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Unreachable {
            operation,
            message: message.to_string(),
        }
    }

    pub fn rejected(operation: &'static str, message: impl fmt::Display) -> Self {
        Self::Rejected {
            operation,
            message: message.to_string(),
        }
    }
}

/// Read/write access of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Rw,
    Ro,
}

impl MountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MountMode::Rw => "rw",
            MountMode::Ro => "ro",
        }
    }
}

/// Host path bound into every context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub mode: MountMode,
}

/// Everything needed to materialize a context apart from its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    pub workdir: String,
    pub mounts: Vec<Mount>,
}

/// One live, addressable execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub id: String,
    pub workdir: String,
    pub mounts: Vec<Mount>,
    /// Image or snapshot the context was materialized from.
    pub image: String,
}

impl ExecutionContext {
    /// First 12 characters of the id, as container tooling prints it.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map_or(self.id.len(), |(idx, _)| idx);
        &self.id[..end]
    }
}

/// Exit status plus combined stdout/stderr of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

/// Container-like runtime able to run, freeze and destroy contexts.
pub trait Substrate {
    /// Materialize a fresh context from `image` (a base template or snapshot).
    fn start(&self, spec: &ContextSpec, image: &str) -> Result<ExecutionContext, SubstrateError>;

    /// Run a shell command inside `ctx`. A nonzero exit is *not* an error.
    fn exec(&self, ctx: &ExecutionContext, command: &str) -> Result<ExecOutput, SubstrateError>;

    /// Freeze `ctx` into a restorable image; `label` is unique per run.
    fn snapshot(&self, ctx: &ExecutionContext, label: &str) -> Result<String, SubstrateError>;

    /// Delete a snapshot image.
    fn remove_snapshot(&self, snapshot: &str) -> Result<(), SubstrateError>;

    /// Tear down `ctx` completely.
    fn destroy(&self, ctx: &ExecutionContext) -> Result<(), SubstrateError>;

    /// Drop leftover intermediate images. Best effort.
    fn prune(&self) -> Result<(), SubstrateError> {
        Ok(())
    }
}

impl<S: Substrate + ?Sized> Substrate for &S {
    fn start(&self, spec: &ContextSpec, image: &str) -> Result<ExecutionContext, SubstrateError> {
        (**self).start(spec, image)
    }

    fn exec(&self, ctx: &ExecutionContext, command: &str) -> Result<ExecOutput, SubstrateError> {
        (**self).exec(ctx, command)
    }

    fn snapshot(&self, ctx: &ExecutionContext, label: &str) -> Result<String, SubstrateError> {
        (**self).snapshot(ctx, label)
    }

    fn remove_snapshot(&self, snapshot: &str) -> Result<(), SubstrateError> {
        (**self).remove_snapshot(snapshot)
    }

    fn destroy(&self, ctx: &ExecutionContext) -> Result<(), SubstrateError> {
        (**self).destroy(ctx)
    }

    fn prune(&self) -> Result<(), SubstrateError> {
        (**self).prune()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_caps_at_twelve_chars() {
        let ctx = ExecutionContext {
            id: "0123456789abcdef".to_string(),
            workdir: "/app".to_string(),
            mounts: Vec::new(),
            image: "python:3.10".to_string(),
        };
        assert_eq!(ctx.short_id(), "0123456789ab");
        let short = ExecutionContext {
            id: "ctx-1".to_string(),
            ..ctx
        };
        assert_eq!(short.short_id(), "ctx-1");
    }

    #[test]
    fn errors_name_the_operation() {
        let err = SubstrateError::unreachable("commit", "connection refused");
        assert_eq!(
            err.to_string(),
            "execution substrate unreachable during commit: connection refused"
        );
    }
}
