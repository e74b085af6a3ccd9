//! Stateful sandbox engine with snapshot-based rollback.
//!
//! The engine owns exactly one live execution context and at most one
//! "last known good" snapshot. A successful mutating command is frozen into a
//! new snapshot; a failed command throws the live context away and restores a
//! fresh one from that snapshot (or from the base image before anything has
//! succeeded). Substrate failures are the only errors; ordinary command
//! failures come back as [`ExecutionRecord`]s with `success = false`. A
//! context that refuses `exec` (stopped or removed underneath us) counts as
//! a failed command and is replaced the same way.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify;
use crate::core::heuristics::Heuristics;
use crate::core::types::ExecutionRecord;
use crate::io::substrate::{ContextSpec, ExecOutput, ExecutionContext, Substrate, SubstrateError};

/// Exit status recorded when the live context refused the command.
pub const CONTEXT_LOST_EXIT_CODE: i32 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// A live context is available for the next command.
    Ready,
    Running,
    RollingBack,
    /// A substrate failure left the engine without a recoverable context.
    Faulted,
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::RollingBack => "rolling back",
            EngineState::Faulted => "faulted",
            EngineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    #[error("sandbox engine is not ready (state: {0})")]
    NotReady(EngineState),
}

/// Holds zero or one snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: Option<String>,
    taken: u32,
}

impl SnapshotStore {
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Freeze `ctx` and replace the held snapshot.
    ///
    /// The previous snapshot is evicted only after the new one exists, so a
    /// failed freeze never loses the last known good state.
    pub fn create<S: Substrate>(
        &mut self,
        substrate: &S,
        ctx: &ExecutionContext,
    ) -> Result<String, SubstrateError> {
        let label = (self.taken + 1).to_string();
        let snapshot = substrate.snapshot(ctx, &label)?;
        self.taken += 1;
        if let Some(previous) = self.current.replace(snapshot.clone()) {
            evict_best_effort(substrate, &previous);
        }
        Ok(snapshot)
    }

    /// Drop the held snapshot, if any. Failures are logged, never raised.
    pub fn evict<S: Substrate>(&mut self, substrate: &S) {
        if let Some(snapshot) = self.current.take() {
            evict_best_effort(substrate, &snapshot);
        }
    }

    /// Materialize a fresh context from the held snapshot, or from the base
    /// image (seeded) when there is none.
    pub fn restore_as_new_context<S: Substrate>(
        &self,
        substrate: &S,
        settings: &SandboxSettings,
    ) -> Result<ExecutionContext, SubstrateError> {
        match self.current.as_deref() {
            Some(snapshot) => substrate.start(&settings.context, snapshot),
            None => start_from_base(substrate, settings),
        }
    }
}

/// Start a context from the base image and run the seed command in it.
///
/// A seed that exits nonzero leaves no context behind and is reported as
/// `Rejected`: the sandbox cannot reach its starting state.
fn start_from_base<S: Substrate>(
    substrate: &S,
    settings: &SandboxSettings,
) -> Result<ExecutionContext, SubstrateError> {
    let ctx = substrate.start(&settings.context, &settings.base_image)?;
    let Some(seed) = settings.seed.as_deref() else {
        return Ok(ctx);
    };
    let seeded = substrate.exec(&ctx, seed);
    let failure = match seeded {
        Ok(output) if output.exit_code == 0 => {
            debug!(context = %ctx.short_id(), "workdir seeded");
            return Ok(ctx);
        }
        Ok(output) => SubstrateError::rejected(
            "seed",
            format!("`{seed}` exited {}: {}", output.exit_code, output.output.trim()),
        ),
        Err(err) => err,
    };
    if let Err(err) = substrate.destroy(&ctx) {
        warn!(context = %ctx.short_id(), err = %err, "failed to destroy unseeded context");
    }
    Err(failure)
}

fn evict_best_effort<S: Substrate>(substrate: &S, snapshot: &str) {
    if let Err(err) = substrate.remove_snapshot(snapshot) {
        warn!(snapshot, err = %err, "failed to evict snapshot");
    }
}

/// Where contexts come from and what they look like.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub base_image: String,
    pub context: ContextSpec,
    /// Run in every context started from `base_image`, before any command.
    /// Whatever it writes lives in the container layer, so snapshots and
    /// rollbacks cover it.
    pub seed: Option<String>,
}

/// What [`SandboxEngine::close`] left behind.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Live context preserved for inspection (keep-alive).
    pub kept_context: Option<ExecutionContext>,
}

#[derive(Debug)]
pub struct SandboxEngine<S: Substrate> {
    substrate: S,
    settings: SandboxSettings,
    heuristics: Heuristics,
    store: SnapshotStore,
    live: Option<ExecutionContext>,
    state: EngineState,
}

impl<S: Substrate> SandboxEngine<S> {
    /// Start the first context from the base image.
    #[instrument(skip_all, fields(base_image = %settings.base_image))]
    pub fn start(
        substrate: S,
        settings: SandboxSettings,
        heuristics: Heuristics,
    ) -> Result<Self, SandboxError> {
        let live = start_from_base(&substrate, &settings)?;
        info!(context = %live.short_id(), "sandbox ready");
        Ok(Self {
            substrate,
            settings,
            heuristics,
            store: SnapshotStore::default(),
            live: Some(live),
            state: EngineState::Ready,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn live_context(&self) -> Option<&ExecutionContext> {
        self.live.as_ref()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Run one command with snapshot-on-success and restore-on-failure.
    #[instrument(skip_all, fields(command = %command))]
    pub fn execute(&mut self, command: &str) -> Result<ExecutionRecord, SandboxError> {
        if self.state != EngineState::Ready {
            return Err(SandboxError::NotReady(self.state));
        }
        let Some(ctx) = self.live.clone() else {
            self.state = EngineState::Faulted;
            return Err(SandboxError::NotReady(self.state));
        };

        self.state = EngineState::Running;
        let output = match self.substrate.exec(&ctx, command) {
            Ok(output) => output,
            Err(SubstrateError::Rejected { message, .. }) => {
                warn!(context = %ctx.short_id(), message = %message, "context refused exec");
                ExecOutput {
                    exit_code: CONTEXT_LOST_EXIT_CODE,
                    output: format!("[sandbox context lost: {message}]\n"),
                }
            }
            Err(err) => return self.guard(|_| Err(err)),
        };
        let verdict = classify(command, output.exit_code, &output.output, &self.heuristics);
        debug!(
            exit_code = output.exit_code,
            success = verdict.is_success,
            mutating = verdict.is_mutating,
            "command classified"
        );

        let mut snapshot = None;
        if verdict.is_success {
            if verdict.is_mutating {
                let created = self.guard(|engine| engine.store.create(&engine.substrate, &ctx))?;
                snapshot = Some(created);
            }
        } else {
            self.state = EngineState::RollingBack;
            self.guard(Self::roll_back)?;
        }
        self.state = EngineState::Ready;

        Ok(ExecutionRecord {
            command: command.to_string(),
            exit_code: output.exit_code,
            output: output.output,
            success: verdict.is_success,
            mutating: verdict.is_mutating,
            snapshot,
        })
    }

    /// Replace the live context with a fresh one from the last good state.
    fn roll_back(&mut self) -> Result<(), SubstrateError> {
        if let Some(ctx) = &self.live {
            self.substrate.destroy(ctx)?;
        }
        self.live = None;
        let restored = self
            .store
            .restore_as_new_context(&self.substrate, &self.settings)?;
        info!(
            context = %restored.short_id(),
            from = %restored.image,
            "rolled back to last good state"
        );
        self.live = Some(restored);
        Ok(())
    }

    /// Run a substrate step; any error faults the engine.
    fn guard<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, SubstrateError>,
    ) -> Result<T, SandboxError> {
        step(self).map_err(|err| {
            warn!(err = %err, state = %self.state, "substrate failure, engine faulted");
            self.state = EngineState::Faulted;
            SandboxError::Substrate(err)
        })
    }

    /// Release the live context and the snapshot.
    ///
    /// Works from any state but `Closed`. With `keep_alive` the live context
    /// survives for inspection; the snapshot is evicted either way. Every
    /// cleanup step runs even if an earlier one fails; the first failure is
    /// returned.
    #[instrument(skip_all, fields(keep_alive = keep_alive))]
    pub fn close(&mut self, keep_alive: bool) -> Result<CloseReport, SandboxError> {
        if self.state == EngineState::Closed {
            return Err(SandboxError::NotReady(self.state));
        }
        let mut first_error = None;
        let mut report = CloseReport::default();

        if let Some(ctx) = self.live.take() {
            if keep_alive {
                info!(context = %ctx.short_id(), "keeping context alive");
                report.kept_context = Some(ctx);
            } else if let Err(err) = self.substrate.destroy(&ctx) {
                warn!(context = %ctx.short_id(), err = %err, "failed to destroy context");
                first_error.get_or_insert(err);
            }
        }
        self.store.evict(&self.substrate);
        if let Err(err) = self.substrate.prune() {
            debug!(err = %err, "prune failed");
        }
        self.state = EngineState::Closed;

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(report),
        }
    }
}
