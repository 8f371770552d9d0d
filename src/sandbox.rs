//! Per-request Podman sandboxes.
//!
//! The agent SDK needs a working copy with a real `.git` directory, but
//! bind-mounting the host worktree's `.git` breaks across host OSes, so
//! the manager snapshots instead: the worktree is mounted read-only at
//! `/mnt/source`, copied into `/workspace` without `.git`, and a fresh
//! `.git` is reconstructed inside the container (shallow fetch when a
//! remote is known, local init-and-commit otherwise).
//!
//! Container names carry the request id and double as the idempotency key
//! for the startup orphan sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::gitops::GitService;
use crate::process::{ExecOptions, ProcessRunner};

const CONTAINER_PREFIX: &str = "pipeline-sandbox-";
const SANDBOX_USER: &str = "sandbox";
const SANDBOX_HOME: &str = "/home/sandbox";
const WORKSPACE: &str = "/workspace";
const SOURCE_MOUNT: &str = "/mnt/source";
const SDK_MOUNT: &str = "/opt/claude-sdk";

/// Image build recipe, embedded so a fresh host needs nothing but podman.
const CONTAINERFILE: &str = r#"FROM debian:bookworm-slim
RUN apt-get update \
    && apt-get install -y --no-install-recommends git ca-certificates nodejs npm procps \
    && rm -rf /var/lib/apt/lists/*
RUN useradd -m -s /bin/bash sandbox
WORKDIR /workspace
RUN chown sandbox:sandbox /workspace
"#;

/// Host env that must not leak into the container.
const HOST_ONLY_ENV: &[&str] = &[
    "PATH", "SHELL", "HOME", "APPDATA", "LOCALAPPDATA", "TMPDIR", "TEMP", "TMP", "USERPROFILE",
    "XDG_CONFIG_HOME", "XDG_DATA_HOME", "SSH_AUTH_SOCK",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxState {
    pub request_id: String,
    pub container_id: String,
    pub container_name: String,
    pub worktree_path: PathBuf,
    pub status: SandboxStatus,
}

pub fn container_name(request_id: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, request_id)
}

pub struct SandboxManager {
    runner: Arc<ProcessRunner>,
    git: Arc<GitService>,
    image: String,
    host_sdk_path: PathBuf,
    states: Mutex<HashMap<String, SandboxState>>,
    podman: tokio::sync::OnceCell<PathBuf>,
}

impl SandboxManager {
    pub fn new(
        runner: Arc<ProcessRunner>,
        git: Arc<GitService>,
        image: &str,
        host_sdk_path: PathBuf,
    ) -> Self {
        Self {
            runner,
            git,
            image: image.to_string(),
            host_sdk_path,
            states: Mutex::new(HashMap::new()),
            podman: tokio::sync::OnceCell::new(),
        }
    }

    /// Locate the podman binary: `$PATH` first, then platform fallbacks.
    /// Missing podman is an error here, at pipeline-run time, never at
    /// service startup.
    async fn podman(&self) -> Result<PathBuf> {
        self.podman
            .get_or_try_init(|| async {
                if let Ok(out) = self
                    .runner
                    .run("which", &["podman"], ExecOptions::default().tolerant().unpooled())
                    .await
                {
                    let found = out.stdout.trim();
                    if out.success() && !found.is_empty() {
                        return Ok(PathBuf::from(found));
                    }
                }
                for candidate in [
                    "/usr/bin/podman",
                    "/usr/local/bin/podman",
                    "/opt/homebrew/bin/podman",
                    "/opt/podman/bin/podman",
                ] {
                    if Path::new(candidate).exists() {
                        return Ok(PathBuf::from(candidate));
                    }
                }
                Err(Error::BadRequest(
                    "podman not found; sandboxed pipelines require podman on this host".into(),
                ))
            })
            .await
            .cloned()
    }

    async fn podman_run(&self, args: &[String], timeout: Duration) -> Result<String> {
        let podman = self.podman().await?;
        let out = self
            .runner
            .execute(
                &podman.to_string_lossy(),
                args,
                ExecOptions::default().with_timeout(timeout).unpooled(),
            )
            .await?;
        Ok(out.stdout)
    }

    /// Lazily build the sandbox image from the embedded Containerfile.
    pub async fn ensure_image(&self) -> Result<()> {
        let podman = self.podman().await?;
        let exists = self
            .runner
            .run(
                &podman.to_string_lossy(),
                &["image", "exists", &self.image],
                ExecOptions::default().tolerant().unpooled(),
            )
            .await?;
        if exists.success() {
            return Ok(());
        }

        info!(image = %self.image, "building sandbox image");
        let build_dir = tempfile_dir()?;
        let containerfile = build_dir.join("Containerfile");
        tokio::fs::write(&containerfile, CONTAINERFILE).await?;

        self.podman_run(
            &[
                "build".into(),
                "-t".into(),
                self.image.clone(),
                "-f".into(),
                containerfile.to_string_lossy().to_string(),
                build_dir.to_string_lossy().to_string(),
            ],
            Duration::from_secs(900),
        )
        .await?;
        let _ = tokio::fs::remove_dir_all(&build_dir).await;
        Ok(())
    }

    /// Start the per-request container and snapshot the worktree into it.
    pub async fn start_sandbox(
        &self,
        request_id: &str,
        worktree_path: &Path,
        branch: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<SandboxState> {
        self.ensure_image().await?;

        let name = container_name(request_id);
        {
            let mut states = self.states.lock().await;
            states.insert(
                request_id.to_string(),
                SandboxState {
                    request_id: request_id.to_string(),
                    container_id: String::new(),
                    container_name: name.clone(),
                    worktree_path: worktree_path.to_path_buf(),
                    status: SandboxStatus::Starting,
                },
            );
        }

        match self
            .start_inner(request_id, &name, worktree_path, branch, extra_env)
            .await
        {
            Ok(state) => {
                let mut states = self.states.lock().await;
                states.insert(request_id.to_string(), state.clone());
                Ok(state)
            }
            Err(err) => {
                {
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(request_id) {
                        state.status = SandboxStatus::Failed;
                    }
                }
                // Remove whatever half-started container exists.
                let _ = self
                    .podman_run(
                        &["rm".into(), "-f".into(), name.clone()],
                        Duration::from_secs(30),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn start_inner(
        &self,
        request_id: &str,
        name: &str,
        worktree_path: &Path,
        branch: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<SandboxState> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.to_string(),
            "-v".into(),
            format!("{}:{}:ro", worktree_path.display(), SOURCE_MOUNT),
            "-v".into(),
            format!("{}:{}:ro", self.host_sdk_path.display(), SDK_MOUNT),
            "-w".into(),
            WORKSPACE.into(),
        ];
        // Provider auth travels with the user's ~/.claude when present.
        if let Some(claude_dir) = dirs::home_dir().map(|h| h.join(".claude")) {
            if claude_dir.exists() {
                args.push("-v".into());
                args.push(format!(
                    "{}:{}/.claude:ro",
                    claude_dir.display(),
                    SANDBOX_HOME
                ));
            }
        }
        for (k, v) in extra_env {
            args.push("-e".into());
            args.push(format!("{}={}", k, v));
        }
        args.push(self.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());

        let container_id = self
            .podman_run(&args, Duration::from_secs(120))
            .await?
            .trim()
            .to_string();

        // Worktree gitdirs are not valid inside the container; everything
        // below operates on the reconstructed /workspace copy.
        self.exec_root(
            name,
            &["git", "config", "--global", "safe.directory", "*"],
        )
        .await?;

        self.exec_root(
            name,
            &[
                "sh",
                "-c",
                &format!(
                    "cp -a {}/. {}/ && rm -rf {}/.git && chown -R {}:{} {}",
                    SOURCE_MOUNT, WORKSPACE, WORKSPACE, SANDBOX_USER, SANDBOX_USER, WORKSPACE
                ),
            ],
        )
        .await?;

        self.reconstruct_git(name, worktree_path, branch).await?;

        info!(request_id, container = name, "sandbox running");
        Ok(SandboxState {
            request_id: request_id.to_string(),
            container_id,
            container_name: name.to_string(),
            worktree_path: worktree_path.to_path_buf(),
            status: SandboxStatus::Running,
        })
    }

    /// Rebuild `.git` inside `/workspace`. With a discoverable remote, a
    /// shallow fetch keeps real history; otherwise a local init with a
    /// single snapshot commit suffices for diffing.
    async fn reconstruct_git(&self, name: &str, worktree_path: &Path, branch: &str) -> Result<()> {
        let remote = self.git.remote_url(worktree_path).await.unwrap_or(None);

        let script = match remote {
            Some(url) => format!(
                "cd {ws} && git init -q && git remote add origin {url} \
                 && (git fetch -q --depth=50 origin {branch} || git fetch -q --depth=50 origin HEAD) \
                 && git checkout -q -b {branch} FETCH_HEAD && git add -A && git reset -q HEAD",
                ws = WORKSPACE,
                url = url,
                branch = branch,
            ),
            None => format!(
                "cd {ws} && git init -q && git checkout -q -b {branch} && git add -A \
                 && git -c user.name=sandbox -c user.email=sandbox@localhost \
                    commit -q -m 'sandbox snapshot'",
                ws = WORKSPACE,
                branch = branch,
            ),
        };

        self.exec_as_sandbox(name, &["sh", "-c", &script]).await?;
        Ok(())
    }

    async fn exec_root(&self, name: &str, cmd: &[&str]) -> Result<String> {
        let mut args: Vec<String> = vec!["exec".into(), name.to_string()];
        args.extend(cmd.iter().map(|s| s.to_string()));
        self.podman_run(&args, Duration::from_secs(300)).await
    }

    async fn exec_as_sandbox(&self, name: &str, cmd: &[&str]) -> Result<String> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--user".into(),
            SANDBOX_USER.into(),
            name.to_string(),
        ];
        args.extend(cmd.iter().map(|s| s.to_string()));
        self.podman_run(&args, Duration::from_secs(300)).await
    }

    /// Build the spawn-redirection hook for this request's container. The
    /// provider SDK hands it a host command; it comes back as a
    /// `podman exec` of the same command inside the sandbox.
    pub async fn spawn_fn(&self, request_id: &str) -> Result<SpawnRedirect> {
        let podman = self.podman().await?;
        let states = self.states.lock().await;
        let state = states
            .get(request_id)
            .ok_or_else(|| Error::NotFound(format!("sandbox for request {}", request_id)))?;
        if state.status != SandboxStatus::Running {
            return Err(Error::Conflict(format!(
                "sandbox for request {} is {:?}, not running",
                request_id, state.status
            )));
        }
        Ok(SpawnRedirect {
            podman,
            container_name: state.container_name.clone(),
            host_sdk_path: self.host_sdk_path.clone(),
        })
    }

    /// Remove the container; only the owning pipeline run calls this.
    pub async fn stop_sandbox(&self, request_id: &str) -> Result<()> {
        let name = {
            let mut states = self.states.lock().await;
            match states.get_mut(request_id) {
                Some(state) => {
                    state.status = SandboxStatus::Stopping;
                    state.container_name.clone()
                }
                None => container_name(request_id),
            }
        };
        let result = self
            .podman_run(&["rm".into(), "-f".into(), name], Duration::from_secs(60))
            .await;
        let mut states = self.states.lock().await;
        states.remove(request_id);
        result.map(|_| ())
    }

    pub async fn state(&self, request_id: &str) -> Option<SandboxState> {
        self.states.lock().await.get(request_id).cloned()
    }

    /// Startup sweep: remove every container left over from a previous
    /// process, matched by the name prefix.
    pub async fn kill_orphans(&self) -> Result<usize> {
        let listed = self
            .podman_run(
                &[
                    "ps".into(),
                    "-a".into(),
                    "--filter".into(),
                    format!("name={}", CONTAINER_PREFIX),
                    "--format".into(),
                    "{{.Names}}".into(),
                ],
                Duration::from_secs(30),
            )
            .await?;

        let mut removed = 0;
        for name in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self
                .podman_run(
                    &["rm".into(), "-f".into(), name.to_string()],
                    Duration::from_secs(60),
                )
                .await
            {
                Ok(_) => {
                    removed += 1;
                    info!(container = name, "removed orphaned sandbox");
                }
                Err(err) => warn!(container = name, error = %err, "failed to remove orphan"),
            }
        }
        Ok(removed)
    }
}

fn tempfile_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("foreman-image-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Closure-shaped hook conforming to the SDK's "spawn my subprocess"
/// contract: rewrites host SDK paths, filters host-only env, and wraps the
/// command in `podman exec`. Killing the returned child kills the exec'd
/// process, so caller aborts propagate into the container.
#[derive(Debug, Clone)]
pub struct SpawnRedirect {
    podman: PathBuf,
    container_name: String,
    host_sdk_path: PathBuf,
}

impl SpawnRedirect {
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Rewrite a single argument: any occurrence of the host SDK path
    /// becomes the in-container mount.
    fn rewrite_arg(&self, arg: &str) -> String {
        let host = self.host_sdk_path.to_string_lossy();
        arg.replace(host.as_ref(), SDK_MOUNT)
    }

    fn env_allowed(key: &str) -> bool {
        !HOST_ONLY_ENV.contains(&key) && !key.starts_with("NVM_")
    }

    /// Assemble the `podman exec` invocation for a host command.
    pub fn build(
        &self,
        command: &str,
        args: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> (PathBuf, Vec<String>) {
        let mut exec_args: Vec<String> = vec![
            "exec".into(),
            "-i".into(),
            "--user".into(),
            SANDBOX_USER.into(),
            "-w".into(),
            self.rewrite_arg(cwd),
        ];
        for (k, v) in env.iter().filter(|(k, _)| Self::env_allowed(k)) {
            exec_args.push("-e".into());
            exec_args.push(format!("{}={}", k, self.rewrite_arg(v)));
        }
        // Sandbox-local identity and temp dirs override whatever the host
        // SDK asked for.
        exec_args.push("-e".into());
        exec_args.push(format!("HOME={}", SANDBOX_HOME));
        exec_args.push("-e".into());
        exec_args.push("TMPDIR=/tmp".into());
        exec_args.push(self.container_name.clone());
        exec_args.push(self.rewrite_arg(command));
        exec_args.extend(args.iter().map(|a| self.rewrite_arg(a)));
        (self.podman.clone(), exec_args)
    }

    /// Spawn the redirected command with piped stdio.
    pub fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> std::io::Result<tokio::process::Child> {
        let (program, exec_args) = self.build(command, args, cwd, env);
        tokio::process::Command::new(program)
            .args(exec_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}
