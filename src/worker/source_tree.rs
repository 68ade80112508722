//! Where a worker's repo state comes from: a file, or the git checkout it
//! runs in.

use std::path::Path;

use tokio::process::Command;

use crate::error::{Result, ShardingError};
use crate::scheduler::{RepoSnapshot, RepoState};

/// Read a repo state file. YAML or JSON.
pub fn load_repo_state(path: impl AsRef<Path>) -> Result<RepoState> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Describe the checkout at `workspace` as a single-repository state:
/// origin URL → (default branch of origin, HEAD commit).
pub async fn detect_repo_state(workspace: &Path) -> Result<RepoState> {
    let remote = git(workspace, &["remote", "show", "origin"]).await?;
    let base_ref = parse_head_branch(&remote).ok_or_else(|| {
        ShardingError::Config("unable to find HEAD branch of origin".to_string())
    })?;
    let repo_name = git(workspace, &["config", "--get", "remote.origin.url"]).await?;
    let patchset = git(workspace, &["rev-parse", "--verify", "HEAD"]).await?;

    let mut state = RepoState::new();
    state.insert(repo_name, RepoSnapshot::new(base_ref, patchset));
    Ok(state)
}

/// File if given, otherwise the git checkout, otherwise nothing.
pub async fn resolve_repo_state(path: Option<&Path>, workspace: &Path) -> Result<RepoState> {
    if let Some(path) = path {
        return load_repo_state(path);
    }
    match detect_repo_state(workspace).await {
        Ok(state) => Ok(state),
        Err(e) => {
            tracing::warn!(
                workspace = %workspace.display(),
                error = %e,
                "Could not detect repo state, joining with an empty one"
            );
            Ok(RepoState::new())
        }
    }
}

async fn git(workspace: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShardingError::Config(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn parse_head_branch(remote_show: &str) -> Option<String> {
    remote_show
        .lines()
        .find_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(|branch| branch.trim().to_string())
        .filter(|branch| !branch.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn head_branch_from_remote_show() {
        let output = "* remote origin\n  Fetch URL: git@example.com:org/repo.git\n  HEAD branch: main\n  Remote branches:\n";
        assert_eq!(parse_head_branch(output), Some("main".to_string()));
        assert_eq!(parse_head_branch("* remote origin\n"), None);
        assert_eq!(parse_head_branch("  HEAD branch: \n"), None);
    }

    #[test]
    fn load_yaml_repo_state() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "org/repo:\n  base_ref: main\n  patchset: abc\n  additional_patchsets: [def]"
        )
        .unwrap();

        let state = load_repo_state(file.path()).unwrap();
        assert_eq!(
            state["org/repo"],
            RepoSnapshot::new("main", "abc").with_additional("def")
        );
    }

    #[test]
    fn load_json_repo_state() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"org/repo": {{"base_ref": "main", "patchset": "abc"}}}}"#).unwrap();

        let state = load_repo_state(file.path()).unwrap();
        assert_eq!(state.len(), 1);
        assert!(state["org/repo"].additional_patchsets.is_empty());
    }

    #[tokio::test]
    async fn missing_checkout_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = resolve_repo_state(None, dir.path()).await.unwrap();
        assert!(state.is_empty());
    }
}
