//! Provider adapters for the Claude, Codex, and Gemini CLIs.
//!
//! Each provider independently implements the same capability set: build
//! the subprocess command, start it (optionally redirected into a
//! sandbox), surface its message stream, accept control responses on
//! stdin, and die on kill. There is no shared base class; the trait is the
//! whole contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::debug;

use super::message::{self, CliMessage, ControlResponse};
use crate::errors::{Error, Result};
use crate::sandbox::SpawnRedirect;

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: String,
    pub session_id: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub images: Vec<String>,
    pub env: HashMap<String, String>,
    /// When set, the subprocess runs inside the request's sandbox via
    /// `podman exec` instead of on the host.
    pub redirect: Option<SpawnRedirect>,
}

impl StartOptions {
    pub fn new(prompt: &str, cwd: PathBuf) -> Self {
        Self {
            prompt: prompt.to_string(),
            cwd,
            model: None,
            permission_mode: "default".to_string(),
            session_id: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            images: Vec::new(),
            env: HashMap::new(),
            redirect: None,
        }
    }
}

#[async_trait]
pub trait AgentProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// The executable and argument list for this run.
    fn build_command(&self, opts: &StartOptions) -> (String, Vec<String>);

    /// Spawn the provider subprocess and hand back its stream.
    async fn start(&self, opts: StartOptions) -> Result<AgentProcess> {
        let (command, args) = self.build_command(&opts);
        debug!(provider = self.name(), %command, "starting agent process");

        let child = match &opts.redirect {
            Some(redirect) => redirect
                .spawn(
                    &command,
                    &args,
                    &opts.cwd.to_string_lossy(),
                    &opts.env,
                )
                .map_err(|e| Error::Internal(format!("sandbox spawn failed: {}", e)))?,
            None => {
                let mut cmd = tokio::process::Command::new(&command);
                cmd.args(&args)
                    .current_dir(&opts.cwd)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                for (k, v) in &opts.env {
                    cmd.env(k, v);
                }
                cmd.spawn().map_err(|e| {
                    Error::Internal(format!("failed to spawn {}: {}", command, e))
                })?
            }
        };

        AgentProcess::from_child(self.name(), child)
    }
}

/// Resolve a provider by its wire name.
pub fn provider_for(name: &str) -> Result<std::sync::Arc<dyn AgentProvider>> {
    match name {
        "claude" => Ok(std::sync::Arc::new(ClaudeProvider)),
        "codex" => Ok(std::sync::Arc::new(CodexProvider)),
        "gemini" => Ok(std::sync::Arc::new(GeminiProvider)),
        other => Err(Error::BadRequest(format!("unknown provider: {}", other))),
    }
}

// ── Claude ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ClaudeProvider;

impl ClaudeProvider {
    fn binary() -> String {
        std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string())
    }
}

#[async_trait]
impl AgentProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(&self, opts: &StartOptions) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            opts.permission_mode.clone(),
        ];
        if let Some(ref model) = opts.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref session) = opts.session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        if !opts.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(opts.allowed_tools.join(","));
        }
        if !opts.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(opts.disallowed_tools.join(","));
        }
        for image in &opts.images {
            args.push("--image".to_string());
            args.push(image.clone());
        }
        args.push("-p".to_string());
        args.push(opts.prompt.clone());
        (Self::binary(), args)
    }
}

// ── Codex ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CodexProvider;

#[async_trait]
impl AgentProvider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(&self, opts: &StartOptions) -> (String, Vec<String>) {
        let binary = std::env::var("CODEX_CMD").unwrap_or_else(|_| "codex".to_string());
        let mut args = vec!["exec".to_string(), "--json".to_string()];
        if let Some(ref model) = opts.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref session) = opts.session_id {
            args.push("resume".to_string());
            args.push(session.clone());
        }
        args.push(opts.prompt.clone());
        (binary, args)
    }
}

// ── Gemini ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GeminiProvider;

#[async_trait]
impl AgentProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn build_command(&self, opts: &StartOptions) -> (String, Vec<String>) {
        let binary = std::env::var("GEMINI_CMD").unwrap_or_else(|_| "gemini".to_string());
        let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
        if let Some(ref model) = opts.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--prompt".to_string());
        args.push(opts.prompt.clone());
        (binary, args)
    }
}

// ── Process wrapper ──────────────────────────────────────────────────

/// An owned provider subprocess with "advance until next event" semantics.
/// Lifetime equals the thread's active run.
pub struct AgentProcess {
    provider: &'static str,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stdin: Option<ChildStdin>,
    stderr_task: Option<tokio::task::JoinHandle<String>>,
}

impl AgentProcess {
    fn from_child(provider: &'static str, mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("agent process has no stdout".into()))?;
        let stdin = child.stdin.take();
        // Drain stderr concurrently so a chatty provider can't deadlock on
        // a full pipe; keep the tail for diagnostics.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail: Vec<String> = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    tail.push(line);
                    if tail.len() > 50 {
                        tail.remove(0);
                    }
                }
                tail.join("\n")
            })
        });
        Ok(Self {
            provider,
            child,
            lines: BufReader::new(stdout).lines(),
            stdin,
            stderr_task,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Next parsed message, skipping non-JSON noise. None means the stream
    /// ended.
    pub async fn next_message(&mut self) -> Result<Option<CliMessage>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(msg) = message::parse_line(&line) {
                        return Ok(Some(msg));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(Error::Internal(format!("agent stream error: {}", e))),
            }
        }
    }

    /// Answer a control request over the provider's stdin.
    pub async fn send_control_response(&mut self, response: &ControlResponse) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Internal("agent stdin is closed".into()))?;
        let mut wire = response.to_wire();
        wire.push('\n');
        stdin.write_all(wire.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Wait for exit; returns `(exit_code, stderr_tail)`.
    pub async fn wait(&mut self) -> (i32, String) {
        let code = self
            .child
            .wait()
            .await
            .ok()
            .and_then(|s| s.code())
            .unwrap_or(-1);
        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        (code, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_command_includes_mode_model_and_resume() {
        let mut opts = StartOptions::new("fix the bug", PathBuf::from("/work"));
        opts.model = Some("opus".into());
        opts.permission_mode = "acceptEdits".into();
        opts.session_id = Some("sess-1".into());
        opts.allowed_tools = vec!["Bash".into(), "Read".into()];

        let (_, args) = ClaudeProvider.build_command(&opts);
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--permission-mode acceptEdits"));
        assert!(joined.contains("--model opus"));
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--allowedTools Bash,Read"));
        assert!(joined.ends_with("-p fix the bug"));
    }

    #[test]
    fn claude_command_without_session_has_no_resume() {
        let opts = StartOptions::new("hello", PathBuf::from("/work"));
        let (_, args) = ClaudeProvider.build_command(&opts);
        assert!(!args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--model".to_string()));
    }

    #[test]
    fn codex_and_gemini_build_their_own_shapes() {
        let opts = StartOptions::new("task", PathBuf::from("/work"));
        let (_, codex_args) = CodexProvider.build_command(&opts);
        assert_eq!(codex_args[0], "exec");
        assert!(codex_args.contains(&"--json".to_string()));

        let (_, gemini_args) = GeminiProvider.build_command(&opts);
        assert!(gemini_args.contains(&"--prompt".to_string()));
    }

    #[test]
    fn provider_lookup_rejects_unknown() {
        assert!(provider_for("claude").is_ok());
        assert!(provider_for("codex").is_ok());
        assert!(provider_for("gemini").is_ok());
        assert!(matches!(
            provider_for("gpt-shell").unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn agent_process_streams_parsed_messages() {
        // A stand-in provider: shell emitting two stream-json lines.
        let mut child = tokio::process::Command::new("sh")
            .args([
                "-c",
                r#"echo '{"type":"system","subtype":"init","session_id":"s1"}'; echo noise; echo '{"type":"result","subtype":"success"}'"#,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        child.stdin.take();
        let mut process = AgentProcess::from_child("claude", child).unwrap();

        match process.next_message().await.unwrap().unwrap() {
            CliMessage::System { session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some("s1"))
            }
            other => panic!("Expected System, got {:?}", other),
        }
        assert!(matches!(
            process.next_message().await.unwrap().unwrap(),
            CliMessage::Result { .. }
        ));
        assert!(process.next_message().await.unwrap().is_none());
        let (code, _) = process.wait().await;
        assert_eq!(code, 0);
    }
}
