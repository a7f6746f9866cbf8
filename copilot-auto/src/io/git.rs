//! Git adapter used to identify the repository a run belongs to.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_TIMEOUT: Duration = Duration::from_secs(10);
const GIT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the top-level directory of the repository containing the workdir.
    #[instrument(skip_all)]
    pub fn show_toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        let top = out.trim();
        if top.is_empty() {
            return Err(anyhow!("git rev-parse --show-toplevel returned nothing"));
        }
        debug!(toplevel = %top, "repository toplevel");
        Ok(PathBuf::from(top))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.succeeded() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, GIT_TIMEOUT, GIT_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Resolve the repository root used as the session identity key.
///
/// Falls back to `workdir` itself when it is not inside a repository or git
/// is unavailable. Symlinks are not resolved.
pub fn repository_root(workdir: &Path) -> PathBuf {
    match Git::new(workdir).show_toplevel() {
        Ok(root) => root,
        Err(err) => {
            debug!(err = %err, workdir = %workdir.display(), "not a git repository, using workdir");
            workdir.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_workdir_outside_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A missing directory makes git fail regardless of any enclosing repository.
        let missing = temp.path().join("missing");
        assert_eq!(repository_root(&missing), missing);
    }

    #[test]
    fn finds_toplevel_from_a_subdirectory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let init = Command::new("git")
            .arg("init")
            .arg("-q")
            .current_dir(temp.path())
            .status();
        if !matches!(init, Ok(status) if status.success()) {
            // git is not installed; the fallback path is covered above.
            return;
        }
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let root = repository_root(&nested);
        let expected = temp.path().canonicalize().expect("canonicalize");
        assert_eq!(root.canonicalize().expect("canonicalize"), expected);
    }
}
