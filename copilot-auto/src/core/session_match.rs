//! Deterministic selection of a prior session for a repository.

use std::time::SystemTime;

/// A session folder found during one scan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCandidate {
    /// Directory name, used as the session id.
    pub id: String,
    pub modified: SystemTime,
}

/// Sort candidates newest first. Ties keep their enumeration order.
pub fn rank_by_recency(candidates: &mut [SessionCandidate]) {
    candidates.sort_by(|a, b| b.modified.cmp(&a.modified));
}

/// True if `plan` names `repo_root`, either verbatim or with `\` folded to
/// `/`, ignoring case.
pub fn plan_mentions_repo(plan: &str, repo_root: &str) -> bool {
    if repo_root.is_empty() {
        return false;
    }
    if plan.contains(repo_root) {
        return true;
    }
    let needle = normalize(repo_root);
    normalize(plan).contains(&needle)
}

fn normalize(text: &str) -> String {
    text.replace('\\', "/").to_lowercase()
}

/// Pick the session for `repo_root` from candidates ranked by recency.
///
/// The first candidate whose plan names the repository wins, even when newer
/// candidates were skipped. Without any match the newest candidate is used.
pub fn select_session<F>(
    ranked: &[SessionCandidate],
    repo_root: &str,
    mut read_plan: F,
) -> Option<String>
where
    F: FnMut(&SessionCandidate) -> Option<String>,
{
    for candidate in ranked {
        if let Some(plan) = read_plan(candidate)
            && plan_mentions_repo(&plan, repo_root)
        {
            return Some(candidate.id.clone());
        }
    }
    ranked.first().map(|candidate| candidate.id.clone())
}
