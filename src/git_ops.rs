//! Git operations on a task's source checkout.
//!
//! Restores, diffs and patch application shell out to the `git` CLI;
//! read-only queries go through `git2`.

use crate::util::run_command_with_input;
use anyhow::{anyhow, Context, Result};
use git2::{Repository, StatusOptions};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

fn git_env() -> [(&'static str, &'static str); 2] {
    [("GIT_TERMINAL_PROMPT", "0"), ("GIT_ASKPASS", "/bin/true")]
}

fn run_git(repo_dir: &Path, args: &[&str], input: Option<&[u8]>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_dir).args(args);
    for (k, v) in git_env() {
        cmd.env(k, v);
    }
    let output = run_command_with_input(&mut cmd, input, GIT_TIMEOUT)
        .map_err(|e| anyhow!("Failed to run git command: {}", e))?;

    if output.timed_out {
        return Err(anyhow!(
            "git command timed out after {}s: git {}",
            GIT_TIMEOUT.as_secs(),
            args.join(" ")
        ));
    }

    if output.success() {
        return Ok(output.stdout);
    }

    Err(anyhow!(
        "git {} failed:\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.stdout,
        output.stderr
    ))
}

/// Discard every uncommitted change, including untracked files.
pub fn restore_clean(repo_dir: &Path) -> Result<()> {
    run_git(repo_dir, &["restore", "--source=HEAD", "--staged", "--worktree", ":/"], None)
        .with_context(|| format!("Failed to restore {}", repo_dir.display()))?;
    run_git(repo_dir, &["clean", "-fd"], None)
        .with_context(|| format!("Failed to clean {}", repo_dir.display()))?;
    Ok(())
}

/// Unstaged working-tree changes as a unified diff.
pub fn working_tree_diff(repo_dir: &Path) -> Result<String> {
    run_git(repo_dir, &["diff", "--no-color", "--no-ext-diff"], None)
        .with_context(|| format!("Failed to diff {}", repo_dir.display()))
}

/// Apply `diff` to the working tree of `repo_dir`.
pub fn apply_patch(repo_dir: &Path, diff: &[u8]) -> Result<()> {
    run_git(repo_dir, &["apply", "--whitespace=nowarn", "-"], Some(diff))
        .with_context(|| format!("Failed to apply patch in {}", repo_dir.display()))?;
    Ok(())
}

/// Resolve `rev` (e.g. `HEAD~1`) to a full commit id.
pub fn resolve_commit(repo_dir: &Path, rev: &str) -> Result<String> {
    let repo = Repository::open(repo_dir)
        .with_context(|| format!("Failed to open repository {}", repo_dir.display()))?;
    let commit = repo
        .revparse_single(rev)
        .and_then(|obj| obj.peel_to_commit())
        .with_context(|| format!("Failed to resolve {} in {}", rev, repo_dir.display()))?;
    Ok(commit.id().to_string())
}

/// True when the checkout has no modified, staged or untracked files.
pub fn is_clean(repo_dir: &Path) -> Result<bool> {
    let repo = Repository::open(repo_dir)
        .with_context(|| format!("Failed to open repository {}", repo_dir.display()))?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::PathBuf;

    pub fn git(repo: &Path, args: &[&str]) {
        let status = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// A repository with two commits touching `src/lib.c`.
    pub fn setup_repo() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();

        git(&repo, &["init", "-q"]);
        git(&repo, &["config", "user.name", "Patchbench Test"]);
        git(&repo, &["config", "user.email", "patchbench@test.local"]);
        std::fs::write(repo.join("src/lib.c"), "int f(void) { return 0; }\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "base"]);
        std::fs::write(repo.join("src/lib.c"), "int f(void) { return 1; }\n").unwrap();
        git(&repo, &["commit", "-q", "-am", "inject bug"]);

        (root, repo)
    }
}
