//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod args;
pub mod limits;
pub mod monitor;
pub mod scanner;
pub mod session_match;
pub mod types;
