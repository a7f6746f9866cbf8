//! Orchestration for one supervised run: resolve the session to continue,
//! build the child command line, supervise the child, persist on exit.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::args::{Continuation, build_argv};
use crate::core::limits::LimitPolicy;
use crate::core::monitor::RunReport;
use crate::core::types::{RunConfig, SessionMode};
use crate::io::child::spawn_child;
use crate::io::git::repository_root;
use crate::io::session_store::SessionStore;
use crate::io::supervisor::{CancelToken, GRACE_PERIOD, RunEvent, Supervisor};

/// Environment a run executes in.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Working directory of the child and starting point for repository lookup.
    pub workdir: PathBuf,
    pub store: SessionStore,
    pub grace_period: Duration,
}

impl RunContext {
    pub fn new(workdir: impl Into<PathBuf>, store: SessionStore) -> Self {
        Self {
            workdir: workdir.into(),
            store,
            grace_period: GRACE_PERIOD,
        }
    }

    /// Context using the default session tree of `config.program`.
    pub fn for_config(config: &RunConfig, workdir: impl Into<PathBuf>) -> Self {
        Self::new(workdir, SessionStore::for_program(&config.program))
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// The child exited unsuccessfully in direct mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExitError {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
}

impl fmt::Display for ChildExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "child exited with code {code}"),
            None => write!(f, "child was terminated by a signal"),
        }
    }
}

impl Error for ChildExitError {}

/// Run the program with an optional initial prompt and stream lifecycle
/// events to `on_event`.
///
/// The child's exit code is reported, not judged: any exit yields `Ok`.
pub fn run_interactive<F: FnMut(&RunEvent)>(
    config: &RunConfig,
    prompt: Option<&str>,
    ctx: &RunContext,
    cancel: &CancelToken,
    on_event: F,
) -> Result<RunReport> {
    supervise(config, prompt, ctx, cancel, on_event)
}

/// Run the program on a single prompt and block until it exits.
///
/// A non-zero exit is returned as [`ChildExitError`], after the session
/// record has been saved.
pub fn run_direct<F: FnMut(&RunEvent)>(
    config: &RunConfig,
    prompt: &str,
    ctx: &RunContext,
    cancel: &CancelToken,
    on_event: F,
) -> Result<RunReport> {
    if prompt.trim().is_empty() {
        bail!("direct mode requires a prompt");
    }
    let report = supervise(config, Some(prompt), ctx, cancel, on_event)?;
    if !report.success() {
        return Err(ChildExitError {
            code: report.exit_code,
        }
        .into());
    }
    Ok(report)
}

/// Decide which session flags the child gets for `repo_root`.
///
/// An explicit resume target is used as-is; otherwise the store is asked for
/// the last session of this repository.
pub fn resolve_continuation(
    config: &RunConfig,
    repo_root: &Path,
    store: &SessionStore,
) -> Continuation {
    let explicit = config.resume_target.as_deref();
    let resolved = match config.session_mode {
        SessionMode::None => None,
        SessionMode::Resume if explicit.is_some() => None,
        SessionMode::Continue | SessionMode::Resume => store.get_last_session_id(repo_root),
    };
    let continuation = Continuation::plan(config.session_mode, explicit, resolved.as_deref());
    debug!(?continuation, "continuation resolved");
    continuation
}

#[instrument(skip_all, fields(workdir = %ctx.workdir.display(), mode = ?config.session_mode))]
fn supervise<F: FnMut(&RunEvent)>(
    config: &RunConfig,
    prompt: Option<&str>,
    ctx: &RunContext,
    cancel: &CancelToken,
    mut on_event: F,
) -> Result<RunReport> {
    config.validate()?;

    let repo_root = config
        .session_mode
        .is_enabled()
        .then(|| repository_root(&ctx.workdir));
    let continuation = match &repo_root {
        Some(root) => resolve_continuation(config, root, &ctx.store),
        None => Continuation::Fresh,
    };

    let argv = build_argv(config, prompt, &continuation);
    let spawned = spawn_child(&argv, &config.env, &ctx.workdir)?;
    on_event(&RunEvent::Started { argv });

    let report = Supervisor::new(
        spawned.child,
        LimitPolicy::from_config(config),
        config.auto_approve,
    )
    .with_grace_period(ctx.grace_period)
    .run(spawned.events, cancel, &mut on_event)?;

    if let Some(root) = &repo_root {
        let resumed = match &continuation {
            Continuation::Resume(id) => Some(id.as_str()),
            _ => None,
        };
        persist_session(&ctx.store, root, report.session_id.as_deref(), resumed);
    }
    Ok(report)
}

/// Save the run's session id.
///
/// When the output never named one, the session tree is scanned; if that
/// finds nothing either, the session the run was resumed from is kept.
/// Failures are logged and swallowed.
fn persist_session(
    store: &SessionStore,
    repo_root: &Path,
    captured: Option<&str>,
    resumed: Option<&str>,
) {
    let session_id = match captured {
        Some(id) => Some(id.to_string()),
        None => {
            debug!("no session id in output, scanning session tree");
            store
                .find_recent_session(repo_root)
                .or_else(|| resumed.map(str::to_string))
        }
    };
    match store.save_state(repo_root, session_id.as_deref()) {
        Ok(record) => info!(session_id = ?record.last_session_id, "session persisted"),
        Err(err) => warn!(err = %format!("{err:#}"), "failed to persist session record"),
    }
}
