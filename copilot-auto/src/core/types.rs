//! Shared deterministic types for the supervisor core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// How a run relates to earlier sessions of the same repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Start fresh; the session store is never read or written.
    #[default]
    None,
    /// Continue the most relevant prior session for this repository.
    Continue,
    /// Resume an explicit session (or the most relevant one when no target is given).
    Resume,
}

impl SessionMode {
    pub fn is_enabled(self) -> bool {
        self != SessionMode::None
    }
}

/// Which child output pipe a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Primary output; the only stream that is scanned and counted.
    Stdout,
    Stderr,
}

/// Fully resolved configuration for one supervised run.
///
/// Immutable for the lifetime of the run. Tool lists are ordered: their order
/// becomes the order of flags on the child's command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Executable to launch.
    pub program: String,

    /// Stop the run once this many stdout chunks were processed.
    pub max_iterations: u32,

    /// Stop the run once it has been alive this long (milliseconds).
    pub max_duration_ms: u64,

    /// Model identifier passed via `--model`. Empty means "let the program decide".
    pub model: String,

    pub allow_all_tools: bool,

    pub allow_all_paths: bool,

    pub allowed_tools: Vec<String>,

    pub denied_tools: Vec<String>,

    /// Answer confirmation prompts on the child's stdin.
    pub auto_approve: bool,

    pub session_mode: SessionMode,

    /// Explicit session id for `SessionMode::Resume`.
    pub resume_target: Option<String>,

    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            program: "copilot".to_string(),
            max_iterations: 50,
            max_duration_ms: 30 * 60 * 1000,
            model: "claude-sonnet-4.5".to_string(),
            allow_all_tools: true,
            allow_all_paths: false,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            auto_approve: true,
            session_mode: SessionMode::None,
            resume_target: None,
            env: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("program must be non-empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_duration_ms == 0 {
            return Err(anyhow!("max_duration_ms must be > 0"));
        }
        if let Some(target) = &self.resume_target
            && target.trim().is_empty()
        {
            return Err(anyhow!("resume_target must not be blank"));
        }
        Ok(())
    }
}
