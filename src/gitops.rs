//! Typed wrappers over git and gh.
//!
//! Every operation takes an absolute cwd that must canonicalize to an
//! existing path before any process is spawned. Plumbing goes through the
//! shared [`ProcessRunner`]; line-level diff stats use libgit2 directly so
//! a status summary never has to parse `--numstat` output.
//!
//! The merge strategy is rebase-first: the feature branch is rebased in its
//! own worktree and the main tree is only touched once a clean `--no-ff`
//! merge is guaranteed. Any failure aborts and restores the original
//! branch, leaving `HEAD` and the working tree exactly as found.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{DiffOptions, Repository};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::process::{ExecOptions, ProcessRunner};

/// Author/token override for identity-aware commands. The token is passed
/// as `GH_TOKEN` to `gh` and `git push`; its value is never logged.
#[derive(Debug, Clone, Default)]
pub struct GitIdentity {
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub github_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitStatusSummary {
    pub dirty_file_count: usize,
    pub unpushed_commit_count: usize,
    pub has_remote_branch: bool,
    pub is_merged_into_base: bool,
    pub lines_added: i64,
    pub lines_deleted: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitSyncState {
    Dirty,
    Unpushed,
    Pushed,
    Merged,
    Clean,
}

/// Precedence: dirty → unpushed → merged → pushed → clean.
pub fn derive_git_sync_state(summary: &GitStatusSummary) -> GitSyncState {
    if summary.dirty_file_count > 0 {
        GitSyncState::Dirty
    } else if summary.unpushed_commit_count > 0 {
        GitSyncState::Unpushed
    } else if summary.is_merged_into_base {
        GitSyncState::Merged
    } else if summary.has_remote_branch {
        GitSyncState::Pushed
    } else {
        GitSyncState::Clean
    }
}

pub struct GitService {
    runner: Arc<ProcessRunner>,
}

impl GitService {
    pub fn new(runner: Arc<ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Canonicalize and verify the working directory before any git spawn.
    fn ensure_cwd(&self, cwd: &Path) -> Result<PathBuf> {
        let canonical = cwd
            .canonicalize()
            .map_err(|_| Error::Forbidden(format!("invalid working directory: {}", cwd.display())))?;
        if !canonical.is_absolute() || !canonical.is_dir() {
            return Err(Error::Forbidden(format!(
                "working directory must be an existing absolute path: {}",
                cwd.display()
            )));
        }
        Ok(canonical)
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let cwd = self.ensure_cwd(cwd)?;
        let out = self
            .runner
            .run("git", args, ExecOptions::in_dir(cwd))
            .await?;
        Ok(out.stdout)
    }

    /// Like [`Self::git`] but a non-zero exit returns `Ok(None)`.
    async fn git_optional(&self, cwd: &Path, args: &[&str]) -> Result<Option<String>> {
        let cwd = self.ensure_cwd(cwd)?;
        let out = self
            .runner
            .run("git", args, ExecOptions::in_dir(cwd).tolerant())
            .await?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    pub fn is_git_repo(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    pub async fn current_branch(&self, cwd: &Path) -> Result<String> {
        let out = self.git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn remote_url(&self, cwd: &Path) -> Result<Option<String>> {
        Ok(self
            .git_optional(cwd, &["remote", "get-url", "origin"])
            .await?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Local branches first; if none, remote-tracking branches with the
    /// `origin/` prefix stripped and deduplicated.
    pub async fn list_branches(&self, cwd: &Path) -> Result<Vec<String>> {
        let local = self
            .git(cwd, &["branch", "--format=%(refname:short)"])
            .await?;
        let local: Vec<String> = local
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if !local.is_empty() {
            return Ok(local);
        }

        let remote = self
            .git(cwd, &["branch", "-r", "--format=%(refname:short)"])
            .await?;
        let mut seen = HashSet::new();
        let mut branches = Vec::new();
        for line in remote.lines() {
            let name = line.trim();
            if name.is_empty() || name.ends_with("/HEAD") {
                continue;
            }
            let stripped = name.strip_prefix("origin/").unwrap_or(name).to_string();
            if seen.insert(stripped.clone()) {
                branches.push(stripped);
            }
        }
        Ok(branches)
    }

    /// `refs/remotes/origin/HEAD` → {main, master, develop} → first branch.
    pub async fn default_branch(&self, cwd: &Path) -> Result<Option<String>> {
        if let Some(head) = self
            .git_optional(
                cwd,
                &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            )
            .await?
        {
            let head = head.trim();
            if !head.is_empty() {
                return Ok(Some(
                    head.strip_prefix("origin/").unwrap_or(head).to_string(),
                ));
            }
        }

        let branches = self.list_branches(cwd).await?;
        for candidate in ["main", "master", "develop"] {
            if branches.iter().any(|b| b == candidate) {
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(branches.first().cloned())
    }

    /// Stage the given paths, silently skipping gitignored entries so a
    /// single ignored path cannot fail the whole batch.
    pub async fn stage_files(&self, cwd: &Path, paths: &[String]) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let canonical = self.ensure_cwd(cwd)?;

        let mut opts = ExecOptions::in_dir(&canonical).tolerant();
        opts.stdin = Some(paths.join("\n").into_bytes());
        let ignored_out = self
            .runner
            .run("git", &["check-ignore", "--stdin"], opts)
            .await?;
        let ignored: HashSet<&str> = ignored_out.stdout.lines().map(|l| l.trim()).collect();

        let stageable: Vec<String> = paths
            .iter()
            .filter(|p| !ignored.contains(p.as_str()))
            .cloned()
            .collect();
        if stageable.is_empty() {
            return Ok(0);
        }

        let mut args: Vec<String> = vec!["add".to_string(), "--".to_string()];
        args.extend(stageable.iter().cloned());
        self.runner
            .execute("git", &args, ExecOptions::in_dir(&canonical))
            .await?;
        Ok(stageable.len())
    }

    pub async fn create_worktree(
        &self,
        project_cwd: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<()> {
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let worktree_str = worktree_path
            .to_str()
            .ok_or_else(|| Error::BadRequest("worktree path is not valid UTF-8".into()))?;
        self.git(
            project_cwd,
            &["worktree", "add", "-b", branch, worktree_str, base_branch],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_worktree(&self, project_cwd: &Path, worktree_path: &Path) -> Result<()> {
        let worktree_str = worktree_path
            .to_str()
            .ok_or_else(|| Error::BadRequest("worktree path is not valid UTF-8".into()))?;
        self.git(
            project_cwd,
            &["worktree", "remove", "--force", worktree_str],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, project_cwd: &Path, branch: &str) -> Result<()> {
        self.git(project_cwd, &["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Stage everything and commit. Returns false when there was nothing to
    /// commit.
    pub async fn commit_all(
        &self,
        cwd: &Path,
        message: &str,
        identity: &GitIdentity,
    ) -> Result<bool> {
        let canonical = self.ensure_cwd(cwd)?;
        self.git(&canonical, &["add", "-A"]).await?;

        let status = self.git(&canonical, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }

        let mut args = identity_config_args(identity);
        args.extend([
            "commit".to_string(),
            "-m".to_string(),
            message.to_string(),
        ]);
        self.runner
            .execute("git", &args, ExecOptions::in_dir(&canonical))
            .await?;
        Ok(true)
    }

    pub async fn push(&self, cwd: &Path, branch: &str, identity: &GitIdentity) -> Result<()> {
        let canonical = self.ensure_cwd(cwd)?;
        let mut opts = ExecOptions::in_dir(&canonical);
        if let Some(ref token) = identity.github_token {
            opts = opts.with_env("GH_TOKEN", token);
        }
        self.runner
            .run("git", &["push", "-u", "origin", branch], opts)
            .await?;
        Ok(())
    }

    /// Push the branch and open a PR via `gh`. Returns the PR URL.
    pub async fn create_pull_request(
        &self,
        cwd: &Path,
        branch: &str,
        title: &str,
        body: &str,
        identity: &GitIdentity,
    ) -> Result<String> {
        self.push(cwd, branch, identity).await?;

        let canonical = self.ensure_cwd(cwd)?;
        let mut opts = ExecOptions::in_dir(&canonical);
        if let Some(ref token) = identity.github_token {
            opts = opts.with_env("GH_TOKEN", token);
        }
        let out = self
            .runner
            .run(
                "gh",
                &["pr", "create", "--head", branch, "--title", title, "--body", body],
                opts,
            )
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Rebase the worktree's branch onto `target`. Returns false on
    /// conflict, leaving the conflicted state in place for a resolver;
    /// callers that give up must [`Self::abort_rebase`].
    pub async fn rebase(&self, worktree: &Path, target: &str) -> Result<bool> {
        Ok(self
            .git_optional(worktree, &["rebase", target])
            .await?
            .is_some())
    }

    /// True when a rebase is parked on conflicts in this worktree.
    pub async fn rebase_in_progress(&self, worktree: &Path) -> bool {
        let git_dir = self
            .git_optional(worktree, &["rev-parse", "--git-dir"])
            .await
            .ok()
            .flatten()
            .map(|s| s.trim().to_string());
        match git_dir {
            Some(git_dir) => {
                let base = if Path::new(&git_dir).is_absolute() {
                    PathBuf::from(git_dir)
                } else {
                    worktree.join(git_dir)
                };
                base.join("rebase-merge").exists() || base.join("rebase-apply").exists()
            }
            None => false,
        }
    }

    pub async fn abort_rebase(&self, worktree: &Path) -> Result<()> {
        let _ = self.git_optional(worktree, &["rebase", "--abort"]).await?;
        Ok(())
    }

    /// Rebase-first merge of `feature_branch` into `target_branch`.
    ///
    /// 1. When a worktree is given, rebase the feature branch there first;
    ///    a conflict aborts the rebase and fails without touching target.
    /// 2. The main tree must be clean.
    /// 3. Checkout target, `merge --no-ff`.
    /// 4. Any merge failure runs `merge --abort` and restores the original
    ///    branch.
    pub async fn merge_branch(
        &self,
        project_cwd: &Path,
        feature_branch: &str,
        target_branch: &str,
        identity: &GitIdentity,
        worktree_path: Option<&Path>,
    ) -> Result<()> {
        let canonical = self.ensure_cwd(project_cwd)?;

        if let Some(worktree) = worktree_path {
            let rebased = self
                .git_optional(worktree, &["rebase", target_branch])
                .await?;
            if rebased.is_none() {
                let _ = self.git_optional(worktree, &["rebase", "--abort"]).await;
                return Err(Error::Conflict(format!(
                    "rebase of {} onto {} conflicted",
                    feature_branch, target_branch
                )));
            }
        }

        let status = self.git(&canonical, &["status", "--porcelain"]).await?;
        if !status.trim().is_empty() {
            return Err(Error::Conflict(
                "main working tree is dirty; refusing to merge".into(),
            ));
        }

        let original_branch = self.current_branch(&canonical).await?;
        self.git(&canonical, &["checkout", target_branch]).await?;

        let message = format!("Merge branch '{}' into {}", feature_branch, target_branch);
        let mut args = identity_config_args(identity);
        args.extend([
            "merge".to_string(),
            "--no-ff".to_string(),
            "-m".to_string(),
            message,
            feature_branch.to_string(),
        ]);
        let merged = self
            .runner
            .execute("git", &args, ExecOptions::in_dir(&canonical).tolerant())
            .await?;

        if !merged.success() {
            warn!(feature_branch, target_branch, "merge failed, restoring original branch");
            let _ = self.git_optional(&canonical, &["merge", "--abort"]).await;
            let _ = self
                .git_optional(&canonical, &["checkout", &original_branch])
                .await;
            return Err(Error::Conflict(format!(
                "merge of {} into {} failed: {}",
                feature_branch,
                target_branch,
                merged.stderr.trim()
            )));
        }

        debug!(feature_branch, target_branch, "merged");
        Ok(())
    }

    /// Size of the branch's change against its base: `(files, lines)`.
    /// Lines are additions plus deletions. Used for tier classification.
    pub async fn change_size(&self, cwd: &Path, base_branch: &str) -> Result<(i64, i64)> {
        let names = self
            .git_optional(
                cwd,
                &["diff", "--name-only", &format!("{}...HEAD", base_branch)],
            )
            .await?
            .unwrap_or_default();
        let files = names.lines().filter(|l| !l.trim().is_empty()).count() as i64;

        let numstat = self
            .git_optional(
                cwd,
                &["diff", "--numstat", &format!("{}...HEAD", base_branch)],
            )
            .await?
            .unwrap_or_default();
        let mut lines = 0i64;
        for row in numstat.lines() {
            let mut cols = row.split_whitespace();
            let added = cols.next().and_then(|c| c.parse::<i64>().ok()).unwrap_or(0);
            let deleted = cols.next().and_then(|c| c.parse::<i64>().ok()).unwrap_or(0);
            lines += added + deleted;
        }
        Ok((files, lines))
    }

    /// Branch health for the UI: dirt, unpushed work, remote presence,
    /// merge status, and line-level churn against the base branch.
    pub async fn status_summary(
        &self,
        worktree_cwd: &Path,
        base_branch: Option<&str>,
        project_cwd: Option<&Path>,
    ) -> Result<GitStatusSummary> {
        let worktree = self.ensure_cwd(worktree_cwd)?;
        let ref_cwd = match project_cwd {
            Some(p) => self.ensure_cwd(p)?,
            None => worktree.clone(),
        };

        let status = self.git(&worktree, &["status", "--porcelain"]).await?;
        let dirty_file_count = status.lines().filter(|l| !l.trim().is_empty()).count();

        let branch = self.current_branch(&worktree).await?;

        let has_remote_branch = self
            .git_optional(
                &ref_cwd,
                &[
                    "rev-parse",
                    "--verify",
                    "--quiet",
                    &format!("refs/remotes/origin/{}", branch),
                ],
            )
            .await?
            .is_some();

        let unpushed_commit_count = if has_remote_branch {
            self.git_optional(
                &worktree,
                &[
                    "rev-list",
                    "--count",
                    &format!("refs/remotes/origin/{}..HEAD", branch),
                ],
            )
            .await?
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(0)
        } else if let Some(base) = base_branch {
            self.git_optional(&worktree, &["rev-list", "--count", &format!("{}..HEAD", base)])
                .await?
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(0)
        } else {
            0
        };

        let (is_merged_into_base, lines_added, lines_deleted) =
            tokio::task::spawn_blocking({
                let worktree = worktree.clone();
                let base = base_branch.map(|s| s.to_string());
                move || summarize_with_git2(&worktree, base.as_deref())
            })
            .await
            .map_err(Error::internal)??;

        Ok(GitStatusSummary {
            dirty_file_count,
            unpushed_commit_count,
            has_remote_branch,
            is_merged_into_base,
            lines_added,
            lines_deleted,
        })
    }
}

fn identity_config_args(identity: &GitIdentity) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(ref name) = identity.author_name {
        args.push("-c".to_string());
        args.push(format!("user.name={}", name));
    }
    if let Some(ref email) = identity.author_email {
        args.push("-c".to_string());
        args.push(format!("user.email={}", email));
    }
    args
}

/// libgit2 half of the status summary: merged-into-base plus diff stats
/// from the merge-base tree to the working directory.
///
/// "Merged" must distinguish an actually-merged branch from one that never
/// diverged: a tip equal to the base tip has no unique commits and reports
/// false even though it is trivially an ancestor.
fn summarize_with_git2(worktree: &Path, base_branch: Option<&str>) -> Result<(bool, i64, i64)> {
    let repo = Repository::open(worktree).map_err(Error::internal)?;

    let head_commit = match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
        Some(c) => c,
        // Unborn branch: nothing merged, nothing diffed.
        None => return Ok((false, 0, 0)),
    };

    let base_commit = base_branch.and_then(|base| {
        repo.revparse_single(base)
            .or_else(|_| repo.revparse_single(&format!("origin/{}", base)))
            .ok()
            .and_then(|obj| obj.peel_to_commit().ok())
    });

    let is_merged = match &base_commit {
        Some(base) => {
            if base.id() == head_commit.id() {
                false
            } else {
                repo.merge_base(base.id(), head_commit.id())
                    .map(|mb| mb == head_commit.id())
                    .unwrap_or(false)
            }
        }
        None => false,
    };

    let diff_from_tree = match &base_commit {
        Some(base) => {
            let mb = repo
                .merge_base(base.id(), head_commit.id())
                .unwrap_or(head_commit.id());
            repo.find_commit(mb)
                .and_then(|c| c.tree())
                .map_err(Error::internal)?
        }
        None => head_commit.tree().map_err(Error::internal)?,
    };

    let mut opts = DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo
        .diff_tree_to_workdir_with_index(Some(&diff_from_tree), Some(&mut opts))
        .map_err(Error::internal)?;
    let stats = diff.stats().map_err(Error::internal)?;

    Ok((is_merged, stats.insertions() as i64, stats.deletions() as i64))
}
