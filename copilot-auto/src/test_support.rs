//! Test-only fixtures: a throwaway repository root, a fake session tree, and
//! scripted stand-ins for the external program.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use filetime::FileTime;
use tempfile::TempDir;

use crate::core::types::RunConfig;
use crate::io::session_store::{PLAN_FILE, SessionStore};
use crate::run::RunContext;

/// Grace period used by fixtures so force-kill paths stay fast.
pub const TEST_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Temporary directory holding a repository root and a session tree.
pub struct Workspace {
    temp: TempDir,
    pub repo_root: PathBuf,
    /// Stand-in for `~/.copilot/session-state/`. Not created until needed.
    pub sessions_root: PathBuf,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo_root = temp.path().join("repo");
        fs::create_dir_all(&repo_root).context("create repo root")?;
        let sessions_root = temp.path().join("session-state");
        Ok(Self {
            temp,
            repo_root,
            sessions_root,
        })
    }

    /// Store over this workspace's session tree with no version check.
    pub fn store(&self) -> SessionStore {
        SessionStore::new(&self.sessions_root, Vec::new())
    }

    /// Run context rooted at the repository with a short grace period.
    pub fn context(&self) -> RunContext {
        RunContext::new(&self.repo_root, self.store()).with_grace_period(TEST_GRACE_PERIOD)
    }

    /// Create session folder `id`, optionally with a plan, last modified
    /// `age_secs` seconds ago.
    pub fn add_session(&self, id: &str, plan: Option<&str>, age_secs: u64) -> Result<PathBuf> {
        let dir = self.sessions_root.join(id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        if let Some(plan) = plan {
            fs::write(dir.join(PLAN_FILE), plan)
                .with_context(|| format!("write plan in {}", dir.display()))?;
        }
        // Writing the plan bumps the folder mtime, so set it afterwards.
        let mtime = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(age_secs));
        filetime::set_file_mtime(&dir, mtime)
            .with_context(|| format!("set mtime of {}", dir.display()))?;
        Ok(dir)
    }

    /// Write an executable shell script into the workspace.
    pub fn write_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(name);
        write_script(&path, body)?;
        Ok(path)
    }
}

/// Write `body` as a `/bin/sh` script at `path` and mark it executable.
pub fn write_script(path: &Path, body: &str) -> Result<()> {
    fs::write(path, format!("#!/bin/sh\n{body}\n"))
        .with_context(|| format!("write script {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

/// Config launching `program` with defaults otherwise. The model flag is
/// dropped so scripts see only the arguments a test cares about.
pub fn test_config(program: &Path) -> RunConfig {
    RunConfig {
        program: program.to_string_lossy().into_owned(),
        model: String::new(),
        allow_all_tools: false,
        ..RunConfig::default()
    }
}
