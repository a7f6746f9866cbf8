//! Child command-line construction.

use crate::core::types::{RunConfig, SessionMode};

/// How the child should relate to earlier sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// No session flags.
    Fresh,
    /// `--continue`: let the program pick its most recent session.
    Latest,
    /// `--resume <id>`.
    Resume(String),
    /// Bare `--resume`: let the program ask which session to resume.
    Picker,
}

impl Continuation {
    /// Decide the continuation flags for a run.
    ///
    /// `explicit` is the configured resume target; `resolved` is the id found
    /// by the session resolver for this repository, if any.
    pub fn plan(mode: SessionMode, explicit: Option<&str>, resolved: Option<&str>) -> Self {
        match mode {
            SessionMode::None => Continuation::Fresh,
            SessionMode::Continue => match resolved {
                Some(id) => Continuation::Resume(id.to_string()),
                None => Continuation::Latest,
            },
            SessionMode::Resume => match explicit.or(resolved) {
                Some(id) => Continuation::Resume(id.to_string()),
                None => Continuation::Picker,
            },
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Continuation::Fresh => {}
            Continuation::Latest => args.push("--continue".to_string()),
            Continuation::Resume(id) => {
                args.push("--resume".to_string());
                args.push(id.clone());
            }
            Continuation::Picker => args.push("--resume".to_string()),
        }
    }
}

/// Build the full argument vector (program first) for the child.
///
/// Tool identifiers are passed through unchanged and in configured order.
/// The prompt is a single argument; no shell is involved, so it is not quoted.
pub fn build_argv(
    config: &RunConfig,
    prompt: Option<&str>,
    continuation: &Continuation,
) -> Vec<String> {
    let mut args = vec![config.program.clone()];

    if !config.model.is_empty() {
        args.push("--model".to_string());
        args.push(config.model.clone());
    }
    if config.allow_all_tools {
        args.push("--allow-all-tools".to_string());
    }
    if config.allow_all_paths {
        args.push("--allow-all-paths".to_string());
    }
    for tool in &config.allowed_tools {
        args.push("--allow-tool".to_string());
        args.push(tool.clone());
    }
    for tool in &config.denied_tools {
        args.push("--deny-tool".to_string());
        args.push(tool.clone());
    }

    continuation.push_args(&mut args);

    if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
        args.push("-p".to_string());
        args.push(prompt.to_string());
    }
    args
}
