//! Stable exit codes for envforge CLI commands.

/// The environment was configured and verified.
pub const OK: i32 = 0;
/// Invalid input/config or a fatal run error (substrate or oracle unreachable).
pub const INVALID: i32 = 1;
/// The run finished without success: the oracle gave up or the step budget ran out.
pub const INCOMPLETE: i32 = 2;
