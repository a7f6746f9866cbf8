//! Session continuity: the persisted per-repository record and the scan of
//! the external session-folder tree.
//!
//! The record lives at `<repo>/.copilot-auto/session-state.json` and is
//! overwritten wholesale on every save. The session-folder tree
//! (`~/.copilot/session-state/` by default) belongs to the external program
//! and is only ever read.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::session_match::{SessionCandidate, rank_by_recency, select_session};
use crate::io::process::run_command_with_timeout;

pub const STATE_DIR: &str = ".copilot-auto";
pub const STATE_FILE: &str = "session-state.json";
/// Plan-like document looked up inside each session folder.
pub const PLAN_FILE: &str = "plan.md";

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_OUTPUT_LIMIT_BYTES: usize = 4096;

/// Persisted association between a repository and its last session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Identity key: the repository root as an absolute path string.
    pub repo_root: String,
    #[serde(default)]
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "copilotVersion")]
    pub tool_version: Option<String>,
}

impl SessionRecord {
    pub fn empty(repo_root: &Path) -> Self {
        Self {
            repo_root: root_key(repo_root),
            last_session_id: None,
            last_used_at: None,
            tool_version: None,
        }
    }
}

/// Reads and writes session records and scans the session-folder tree.
#[derive(Debug, Clone)]
pub struct SessionStore {
    /// `None` when there is no home directory to find the tree in.
    sessions_root: Option<PathBuf>,
    version_command: Vec<String>,
}

impl SessionStore {
    /// `version_command` is run (best effort) on every save to stamp the
    /// record with the external tool's version. An empty command skips it.
    pub fn new(sessions_root: impl Into<PathBuf>, version_command: Vec<String>) -> Self {
        Self {
            sessions_root: Some(sessions_root.into()),
            version_command,
        }
    }

    /// Store for `program`, scanning `~/.copilot/session-state/`.
    pub fn for_program(program: &str) -> Self {
        Self {
            sessions_root: default_sessions_root(dirs::home_dir()),
            version_command: vec![program.to_string(), "--version".to_string()],
        }
    }

    pub fn state_path(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR).join(STATE_FILE)
    }

    /// Load the record for `repo_root`.
    ///
    /// Never fails: a missing, unreadable, corrupt, or foreign record yields an
    /// empty record for `repo_root`.
    #[instrument(skip_all, fields(repo_root = %repo_root.display()))]
    pub fn load_state(&self, repo_root: &Path) -> SessionRecord {
        let path = Self::state_path(repo_root);
        match read_record(&path) {
            Ok(Some(record)) if record.repo_root == root_key(repo_root) => {
                debug!(last_session_id = ?record.last_session_id, "session record loaded");
                record
            }
            Ok(Some(record)) => {
                warn!(
                    path = %path.display(),
                    recorded_root = %record.repo_root,
                    "session record belongs to another repository root, ignoring"
                );
                SessionRecord::empty(repo_root)
            }
            Ok(None) => {
                debug!(path = %path.display(), "no session record");
                SessionRecord::empty(repo_root)
            }
            Err(err) => {
                warn!(path = %path.display(), err = %format!("{err:#}"), "unreadable session record, starting fresh");
                SessionRecord::empty(repo_root)
            }
        }
    }

    /// Overwrite the record for `repo_root` with `session_id`, stamped with
    /// the current time and the detected tool version.
    #[instrument(skip_all, fields(repo_root = %repo_root.display(), session_id = ?session_id))]
    pub fn save_state(&self, repo_root: &Path, session_id: Option<&str>) -> Result<SessionRecord> {
        let record = SessionRecord {
            repo_root: root_key(repo_root),
            last_session_id: session_id.map(str::to_string),
            last_used_at: Some(Utc::now()),
            tool_version: self.detect_version(),
        };
        write_record(&Self::state_path(repo_root), &record)?;
        info!("session record saved");
        Ok(record)
    }

    /// The session a new run for `repo_root` should continue, if any.
    ///
    /// Prefers the persisted record and only scans the session tree when the
    /// record has no id.
    pub fn get_last_session_id(&self, repo_root: &Path) -> Option<String> {
        if let Some(id) = self.load_state(repo_root).last_session_id {
            return Some(id);
        }
        self.find_recent_session(repo_root)
    }

    /// Scan the session tree for the session belonging to `repo_root`.
    ///
    /// Walks folders newest first and returns the first whose plan names the
    /// repository; otherwise the newest folder; `None` when there are none.
    #[instrument(skip_all, fields(repo_root = %repo_root.display()))]
    pub fn find_recent_session(&self, repo_root: &Path) -> Option<String> {
        let mut candidates = self.list_candidates();
        rank_by_recency(&mut candidates);
        let root = root_key(repo_root);
        let selected = select_session(&candidates, &root, |candidate| {
            self.read_plan(&candidate.id)
        });
        debug!(candidates = candidates.len(), selected = ?selected, "session scan finished");
        selected
    }

    /// Enumerate session folders. A missing or unreadable root yields none.
    pub fn list_candidates(&self) -> Vec<SessionCandidate> {
        let Some(root) = &self.sessions_root else {
            return Vec::new();
        };
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(root = %root.display(), err = %err, "session root not readable");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            candidates.push(SessionCandidate {
                id: entry.file_name().to_string_lossy().into_owned(),
                modified,
            });
        }
        candidates
    }

    fn read_plan(&self, id: &str) -> Option<String> {
        let root = self.sessions_root.as_ref()?;
        fs::read_to_string(root.join(id).join(PLAN_FILE)).ok()
    }

    fn detect_version(&self) -> Option<String> {
        let (program, args) = self.version_command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        match run_command_with_timeout(cmd, VERSION_CHECK_TIMEOUT, VERSION_OUTPUT_LIMIT_BYTES)
        {
            Ok(output) if output.succeeded() => output
                .stdout_text()
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Ok(output) => {
                warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "version check failed");
                None
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "version check failed");
                None
            }
        }
    }
}

fn default_sessions_root(home: Option<PathBuf>) -> Option<PathBuf> {
    match home {
        Some(home) => Some(home.join(".copilot").join("session-state")),
        None => {
            warn!("home directory unknown, session folders will not be scanned");
            None
        }
    }
}

fn root_key(repo_root: &Path) -> String {
    repo_root.to_string_lossy().into_owned()
}

fn read_record(path: &Path) -> Result<Option<SessionRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let record = serde_json::from_str(&contents)
        .with_context(|| format!("parse session record {}", path.display()))?;
    Ok(Some(record))
}

/// Atomically write the record to disk (temp file + rename).
fn write_record(path: &Path, record: &SessionRecord) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(record).context("serialize session record")?;
    buf.push('\n');
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("session record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp session record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session record {}", path.display()))?;
    Ok(())
}
