//! Side-effecting adapters: child processes, git, and files on disk.

pub mod child;
pub mod config;
pub mod git;
pub mod process;
pub mod session_store;
pub mod supervisor;
