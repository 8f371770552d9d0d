//! Director: integrates approved branches back into the target branch.
//!
//! A background loop reads the manifest of pipeline outcomes and, for each
//! branch in `ready`, takes the branch-lifecycle lock (`pending_merge`),
//! rebases the branch in its worktree, and merges with `--no-ff` on the
//! main repo. Rebase-first is the invariant: the main tree is never
//! touched unless a clean merge is guaranteed. Conflicts dispatch a
//! resolution agent; on exhaustion the branch drops back to `ready` and a
//! human-attention event is published.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::{Error, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::fsm::{BranchState, branch_machine_at};
use crate::gitops::{GitIdentity, GitService};
use crate::process::{ExecOptions, ProcessRunner};

// ── Manifest ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub branch: String,
    pub worktree_path: PathBuf,
    pub base_branch: String,
    pub request_id: String,
    pub state: BranchState,
    pub updated_at: DateTime<Utc>,
}

/// JSON file recording pipeline outcomes per branch; the director's work
/// queue and the branch lifecycle's persistence.
pub struct Manifest {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Manifest {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Vec<ManifestEntry> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn save(&self, entries: &[ManifestEntry]) {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_string_pretty(entries) {
            Ok(body) => {
                if let Err(err) = tokio::fs::write(&self.path, body).await {
                    warn!(path = %self.path.display(), error = %err, "manifest write failed");
                }
            }
            Err(err) => warn!(error = %err, "manifest serialize failed"),
        }
    }

    /// An approved pipeline marks its branch ready for integration.
    pub async fn record_ready(
        &self,
        branch: &str,
        worktree_path: &Path,
        base_branch: &str,
        request_id: &str,
    ) {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        entries.retain(|e| e.branch != branch);
        entries.push(ManifestEntry {
            branch: branch.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            base_branch: base_branch.to_string(),
            request_id: request_id.to_string(),
            state: BranchState::Ready,
            updated_at: Utc::now(),
        });
        self.save(&entries).await;
    }

    pub async fn ready_branches(&self) -> Vec<ManifestEntry> {
        let _guard = self.lock.lock().await;
        self.load()
            .await
            .into_iter()
            .filter(|e| e.state == BranchState::Ready)
            .collect()
    }

    pub async fn entries(&self) -> Vec<ManifestEntry> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Validated branch-lifecycle transition, persisted on success.
    pub async fn transition(&self, branch: &str, to: BranchState) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.branch == branch)
            .ok_or_else(|| Error::NotFound(format!("manifest entry for {}", branch)))?;
        let mut machine = branch_machine_at(entry.state);
        machine.transition(to)?;
        entry.state = machine.state();
        entry.updated_at = Utc::now();
        self.save(&entries).await;
        Ok(())
    }

    pub async fn remove(&self, branch: &str) {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        entries.retain(|e| e.branch != branch);
        self.save(&entries).await;
    }
}

// ── Conflict resolution ──────────────────────────────────────────────

/// Attempts to resolve an in-progress rebase conflict in a worktree.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, worktree: &Path, target_branch: &str) -> Result<bool>;
}

/// Dispatches a coding agent into the conflicted worktree.
pub struct AgentConflictResolver {
    runner: Arc<ProcessRunner>,
}

impl AgentConflictResolver {
    pub fn new(runner: Arc<ProcessRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConflictResolver for AgentConflictResolver {
    async fn resolve(&self, worktree: &Path, target_branch: &str) -> Result<bool> {
        let claude = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        let prompt = format!(
            "This worktree has a git rebase onto {} stopped on conflicts. \
             Resolve every conflicted file, `git add` the resolutions, and \
             run `git rebase --continue` until the rebase finishes.",
            target_branch
        );
        let out = self
            .runner
            .run(
                &claude,
                &["--print", "--permission-mode", "acceptEdits", "-p", &prompt],
                ExecOptions::in_dir(worktree)
                    .with_timeout(Duration::from_secs(900))
                    .tolerant(),
            )
            .await?;
        // The director re-checks the worktree's rebase state after this
        // returns; the agent's exit code is only a first signal.
        Ok(out.success())
    }
}

// ── Director ─────────────────────────────────────────────────────────

pub struct Director {
    git: Arc<GitService>,
    manifest: Arc<Manifest>,
    bus: Arc<EventBus>,
    resolver: Arc<dyn ConflictResolver>,
    config: PipelineConfig,
    project_path: PathBuf,
    identity: GitIdentity,
}

impl Director {
    pub fn new(
        git: Arc<GitService>,
        manifest: Arc<Manifest>,
        bus: Arc<EventBus>,
        resolver: Arc<dyn ConflictResolver>,
        config: PipelineConfig,
        project_path: PathBuf,
        identity: GitIdentity,
    ) -> Arc<Self> {
        Arc::new(Self {
            git,
            manifest,
            bus,
            resolver,
            config,
            project_path,
            identity,
        })
    }

    /// Background loop. `interval_seconds == 0` disables the director, so
    /// callers skip spawning this entirely.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.director.interval_seconds.max(1));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    /// One integration sweep over every ready branch.
    pub async fn run_cycle(&self) {
        for entry in self.manifest.ready_branches().await {
            if let Err(err) = self.integrate_branch(&entry).await {
                warn!(branch = %entry.branch, error = %err, "integration failed");
            }
        }
    }

    async fn integrate_branch(&self, entry: &ManifestEntry) -> Result<()> {
        let branch = &entry.branch;

        // Lifecycle lock: ready → pending_merge.
        self.manifest
            .transition(branch, BranchState::PendingMerge)
            .await?;
        self.publish(entry, "director.merge_started", serde_json::json!({}))
            .await;

        // Rebase the feature branch in its own worktree first.
        let rebased = self.rebase_with_resolution(entry).await?;
        if !rebased {
            // Exhausted: hand the branch back for human attention.
            self.manifest.transition(branch, BranchState::Ready).await?;
            self.publish(
                entry,
                "director.conflict",
                serde_json::json!({"needs_human_attention": true}),
            )
            .await;
            return Ok(());
        }

        // Clean rebase guarantees a clean merge on the main repo.
        match self
            .git
            .merge_branch(
                &self.project_path,
                branch,
                &entry.base_branch,
                &self.identity,
                None,
            )
            .await
        {
            Ok(()) => {
                self.manifest
                    .transition(branch, BranchState::MergeHistory)
                    .await?;
                self.publish(entry, "director.merged", serde_json::json!({}))
                    .await;
                self.cleanup_branch(entry, true).await;
                info!(%branch, "branch merged");
                Ok(())
            }
            Err(err) => {
                self.manifest.transition(branch, BranchState::Ready).await?;
                self.publish(
                    entry,
                    "director.merge_failed",
                    serde_json::json!({"error": err.to_string()}),
                )
                .await;
                self.cleanup_branch(entry, false).await;
                Err(err)
            }
        }
    }

    /// Rebase in the worktree, dispatching the conflict agent up to the
    /// correction budget. Returns false when the conflict survives; the
    /// worktree is left rebase-free either way.
    async fn rebase_with_resolution(&self, entry: &ManifestEntry) -> Result<bool> {
        let worktree = &entry.worktree_path;
        let max_attempts = self.config.auto_correction.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if self.git.rebase(worktree, &entry.base_branch).await? {
                return Ok(true);
            }

            // Conflict is parked in the worktree for the resolver.
            if attempt + 1 >= max_attempts {
                break;
            }
            // Self-loop: still pending_merge while retrying.
            self.manifest
                .transition(&entry.branch, BranchState::PendingMerge)
                .await?;
            self.publish(
                entry,
                "director.resolving_conflict",
                serde_json::json!({"attempt": attempt + 1}),
            )
            .await;

            let resolved = self
                .resolver
                .resolve(worktree, &entry.base_branch)
                .await
                .unwrap_or(false);
            if resolved && !self.git.rebase_in_progress(worktree).await {
                return Ok(true);
            }
            // Clear whatever the attempt left behind before retrying.
            self.git.abort_rebase(worktree).await?;
        }

        self.git.abort_rebase(worktree).await?;
        Ok(false)
    }

    async fn cleanup_branch(&self, entry: &ManifestEntry, merged: bool) {
        if !merged && self.config.cleanup.keep_on_failure {
            return;
        }
        if let Err(err) = self
            .git
            .remove_worktree(&self.project_path, &entry.worktree_path)
            .await
        {
            warn!(branch = %entry.branch, error = %err, "worktree removal failed");
        }
        if merged {
            if let Err(err) = self.git.delete_branch(&self.project_path, &entry.branch).await {
                warn!(branch = %entry.branch, error = %err, "branch deletion failed");
            }
        }
    }

    async fn publish(&self, entry: &ManifestEntry, event_type: &str, mut data: serde_json::Value) {
        if let Some(obj) = data.as_object_mut() {
            obj.insert(
                "branch".to_string(),
                serde_json::Value::String(entry.branch.clone()),
            );
        }
        let event = PipelineEvent::now(&entry.request_id, event_type, data);
        if let Err(err) = self.bus.publish(event).await {
            warn!(error = %err, "director event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DEFAULT_POOL_SIZE;
    use std::fs;
    use std::process::Command;

    struct NoopResolver;

    #[async_trait]
    impl ConflictResolver for NoopResolver {
        async fn resolve(&self, _worktree: &Path, _target: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(
            out.status.success(),
            "git {:?}: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-b", "main"]);
        run_git(dir, &["config", "user.name", "test"]);
        run_git(dir, &["config", "user.email", "test@test.com"]);
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        fs::write(dir.join(name), content).unwrap();
        run_git(dir, &["add", "-A"]);
        run_git(dir, &["commit", "-m", msg]);
    }

    fn director_over(
        project: &Path,
        manifest: Arc<Manifest>,
        bus: Arc<EventBus>,
        config: PipelineConfig,
    ) -> Arc<Director> {
        let runner = Arc::new(ProcessRunner::new(DEFAULT_POOL_SIZE));
        let git = Arc::new(GitService::new(runner));
        Director::new(
            git,
            manifest,
            bus,
            Arc::new(NoopResolver),
            config,
            project.to_path_buf(),
            GitIdentity::default(),
        )
    }

    #[tokio::test]
    async fn manifest_round_trips_and_validates_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(dir.path().join("manifest.json"));
        manifest
            .record_ready("feature/x", Path::new("/tmp/wt"), "main", "req-1")
            .await;

        let ready = manifest.ready_branches().await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].state, BranchState::Ready);

        manifest
            .transition("feature/x", BranchState::PendingMerge)
            .await
            .unwrap();
        // Self-loop is legal.
        manifest
            .transition("feature/x", BranchState::PendingMerge)
            .await
            .unwrap();
        manifest
            .transition("feature/x", BranchState::MergeHistory)
            .await
            .unwrap();
        // Terminal.
        assert!(matches!(
            manifest
                .transition("feature/x", BranchState::Ready)
                .await
                .unwrap_err(),
            Error::Transition(_)
        ));
        // No longer ready, and removable once history is no longer needed.
        assert!(manifest.ready_branches().await.is_empty());
        manifest.remove("feature/x").await;
        assert!(manifest.entries().await.is_empty());
    }

    #[tokio::test]
    async fn clean_branch_merges_into_base() {
        let project = tempfile::tempdir().unwrap();
        init_repo(project.path());
        commit_file(project.path(), "a.txt", "base\n", "init");

        // Feature worktree with its own commit.
        let worktree = project.path().join(".worktrees").join("wt-x");
        run_git(
            project.path(),
            &[
                "worktree",
                "add",
                "-b",
                "feature/x",
                worktree.to_str().unwrap(),
                "main",
            ],
        );
        run_git(&worktree, &["config", "user.name", "test"]);
        run_git(&worktree, &["config", "user.email", "test@test.com"]);
        fs::write(worktree.join("b.txt"), "feature\n").unwrap();
        run_git(&worktree, &["add", "-A"]);
        run_git(&worktree, &["commit", "-m", "feature work"]);

        let state_dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(Manifest::new(state_dir.path().join("manifest.json")));
        manifest
            .record_ready("feature/x", &worktree, "main", "req-1")
            .await;
        let bus = Arc::new(EventBus::new(state_dir.path().join("events")));

        let director = director_over(
            project.path(),
            Arc::clone(&manifest),
            Arc::clone(&bus),
            PipelineConfig::default(),
        );
        director.run_cycle().await;

        // Merged into main and recorded as history.
        assert!(project.path().join("b.txt").exists());
        let entries = manifest.entries().await;
        assert_eq!(entries[0].state, BranchState::MergeHistory);

        let events = bus.replay("req-1").await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"director.merge_started"));
        assert!(types.contains(&"director.merged"));
    }

    #[tokio::test]
    async fn conflicting_branch_returns_to_ready_with_attention_event() {
        let project = tempfile::tempdir().unwrap();
        init_repo(project.path());
        commit_file(project.path(), "a.txt", "base\n", "init");

        let worktree = project.path().join(".worktrees").join("wt-c");
        run_git(
            project.path(),
            &[
                "worktree",
                "add",
                "-b",
                "feature/conflict",
                worktree.to_str().unwrap(),
                "main",
            ],
        );
        run_git(&worktree, &["config", "user.name", "test"]);
        run_git(&worktree, &["config", "user.email", "test@test.com"]);
        fs::write(worktree.join("a.txt"), "feature version\n").unwrap();
        run_git(&worktree, &["add", "-A"]);
        run_git(&worktree, &["commit", "-m", "feature edit"]);

        // Base moves the same line: guaranteed rebase conflict.
        commit_file(project.path(), "a.txt", "main version\n", "main edit");

        let head_before = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(project.path())
            .output()
            .unwrap()
            .stdout;

        let state_dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(Manifest::new(state_dir.path().join("manifest.json")));
        manifest
            .record_ready("feature/conflict", &worktree, "main", "req-1")
            .await;
        let bus = Arc::new(EventBus::new(state_dir.path().join("events")));

        let director = director_over(
            project.path(),
            Arc::clone(&manifest),
            Arc::clone(&bus),
            PipelineConfig::default(),
        );
        director.run_cycle().await;

        // Back to ready, main repo untouched.
        let entries = manifest.entries().await;
        assert_eq!(entries[0].state, BranchState::Ready);
        let head_after = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(project.path())
            .output()
            .unwrap()
            .stdout;
        assert_eq!(head_before, head_after);

        let events = bus.replay("req-1").await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "director.conflict"));
        // keep_on_failure default keeps the worktree around.
        assert!(worktree.exists());
    }
}
