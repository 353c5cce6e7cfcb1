//! Stable exit codes for toolrun CLI commands.

/// Command succeeded; for `exec`, the task exited zero.
pub const OK: i32 = 0;
/// Invalid arguments, config, or plan, or any other error.
pub const INVALID: i32 = 1;
/// `toolrun exec` task exited nonzero, or a `toolrun run` plan finished with
/// exhausted operations.
pub const TASK_FAILED: i32 = 2;
/// `toolrun exec` task hit its timeout.
pub const TASK_TIMEOUT: i32 = 3;
/// `toolrun run` stopped at `max_iterations`.
pub const ITERATION_LIMIT: i32 = 4;
