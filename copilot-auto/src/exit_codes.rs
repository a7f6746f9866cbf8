//! Stable exit codes for the `copilot-auto` binary.

/// The child ran and exited successfully.
pub const OK: i32 = 0;
/// Invalid config or arguments, launch failure, or any other error.
pub const ERROR: i32 = 1;
/// The child exited non-zero or was killed.
pub const CHILD_FAILED: i32 = 2;
/// The run was cancelled with Ctrl-C.
pub const INTERRUPTED: i32 = 130;
