//! Supervisor for an interactive coding-assistant CLI.
//!
//! Launches the external program, forwards its output, answers its
//! confirmation prompts, enforces iteration and wall-clock ceilings, and
//! remembers which session belongs to which repository so the next run can
//! pick it up again.
//!
//! - **[`core`]**: Pure, deterministic logic (scanning, limits, the run state
//!   machine, argument building, session ranking). No I/O.
//! - **[`io`]**: Side-effecting operations (child processes, git, the session
//!   record and session tree, config files).
//!
//! [`run`] ties the two together for the CLI.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
