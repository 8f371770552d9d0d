//! Child-process execution shared by git, gh, podman, and agent spawns.
//!
//! Stdout and stderr are drained concurrently with the exit wait so a child
//! that fills a pipe buffer after closing can never truncate output or
//! deadlock the caller. A global semaphore caps concurrent children;
//! single-shot critical operations may opt out with `skip_pool`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};

use crate::errors::{Error, ProcessExecutionError, Result};

/// Default per-call timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently running children.
pub const DEFAULT_POOL_SIZE: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Environment overlay applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    /// None means [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// When true (the default via [`ExecOptions::default`] + runner),
    /// a non-zero exit becomes `Error::Process`.
    pub accept_non_zero: bool,
    /// Bypass the global pool for critical single-shot operations that must
    /// not queue behind agent spawns.
    pub skip_pool: bool,
}

impl ExecOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.accept_non_zero = true;
        self
    }

    pub fn unpooled(mut self) -> Self {
        self.skip_pool = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Gates child-process creation process-wide.
pub struct ProcessRunner {
    pool: Arc<Semaphore>,
}

impl ProcessRunner {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Run a command to completion, capturing both streams.
    ///
    /// Returns `Error::Timeout` (with partial output) if the child outlives
    /// the configured timeout, and `Error::Process` on a non-zero exit
    /// unless `accept_non_zero` is set.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ProcessOutput> {
        let _permit = if opts.skip_pool {
            None
        } else {
            Some(
                self.pool
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(Error::internal)?,
            )
        };

        let command_string = format!("{} {}", command, args.join(" "));
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Internal(format!("Failed to spawn `{}`: {}", command_string, e))
        })?;

        if let Some(bytes) = opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await?;
            }
        }

        // Shared buffers so the timeout path can report what arrived so far.
        let stdout_buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::<u8>::new()));

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let out_task = spawn_drain(stdout_pipe, Arc::clone(&stdout_buf));
        let err_task = spawn_drain(stderr_pipe, Arc::clone(&stderr_buf));

        let waited = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            let _ = out_task.await;
            let _ = err_task.await;
            status
        })
        .await;

        let status = match waited {
            Ok(status) => status.map_err(Error::internal)?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let partial_stdout =
                    String::from_utf8_lossy(&stdout_buf.lock().await).to_string();
                let partial_stderr =
                    String::from_utf8_lossy(&stderr_buf.lock().await).to_string();
                return Err(Error::Timeout {
                    command: command_string,
                    timeout_ms: timeout.as_millis() as u64,
                    partial_stdout,
                    partial_stderr,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).to_string();
        let exit_code = status.code().unwrap_or(-1);

        if !status.success() && !opts.accept_non_zero {
            return Err(Error::Process(ProcessExecutionError {
                exit_code: status.code(),
                stdout,
                stderr,
                command: command_string,
            }));
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Convenience wrapper for `&str` argument lists.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        opts: ExecOptions,
    ) -> Result<ProcessOutput> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.execute(command, &owned, opts).await
    }
}

fn spawn_drain(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    buf: Arc<Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(DEFAULT_POOL_SIZE)
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = runner()
            .run("echo", &["hello"], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let out = runner()
            .run(
                "sh",
                &["-c", "echo out; echo err >&2"],
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_process_error() {
        let err = runner()
            .run("sh", &["-c", "echo oops >&2; exit 3"], ExecOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Process(p) => {
                assert_eq!(p.exit_code, Some(3));
                assert!(p.stderr.contains("oops"));
            }
            other => panic!("Expected Process error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tolerant_mode_returns_non_zero_output() {
        let out = runner()
            .run("sh", &["-c", "exit 5"], ExecOptions::default().tolerant())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 5);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_child() {
        let mut opts = ExecOptions::default();
        opts.stdin = Some(b"from stdin".to_vec());
        let out = runner().run("cat", &[], opts).await.unwrap();
        assert_eq!(out.stdout, "from stdin");
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_partial_output() {
        let opts = ExecOptions::default().with_timeout(Duration::from_millis(200));
        let err = runner()
            .run("sh", &["-c", "echo early; sleep 30"], opts)
            .await
            .unwrap_err();
        match err {
            Error::Timeout {
                partial_stdout,
                timeout_ms,
                ..
            } => {
                assert_eq!(timeout_ms, 200);
                assert!(partial_stdout.contains("early"));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        // 1 MiB is far beyond the OS pipe buffer; this hangs forever if
        // streams are read serially after exit.
        let out = runner()
            .run(
                "sh",
                &["-c", "head -c 1048576 /dev/zero | tr '\\0' 'x'"],
                ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 1_048_576);
    }

    #[tokio::test]
    async fn env_overlay_is_visible_to_child() {
        let out = runner()
            .run(
                "sh",
                &["-c", "echo $FOREMAN_TEST_VAR"],
                ExecOptions::default().with_env("FOREMAN_TEST_VAR", "42"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn pool_queues_rather_than_failing() {
        let runner = Arc::new(ProcessRunner::new(2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                r.run("sh", &["-c", "sleep 0.05; echo done"], ExecOptions::default())
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
    }
}
