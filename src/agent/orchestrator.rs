//! Owns agent subprocesses: start, stop, resume, and the per-project
//! follow-up policy.
//!
//! Per thread there is at most one live agent process; across threads
//! runs are independent. The run loop bridges provider messages through
//! the [`MessageHandler`] into the store and WS broker, relays held
//! control-request answers back over stdin, and on terminal transition
//! drains the thread's follow-up queue.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::{HandlerOutcome, MessageHandler, ThreadRunState};
use super::provider::{StartOptions, provider_for};
use crate::errors::{Error, Result};
use crate::gitops::{GitService, derive_git_sync_state};
use crate::sandbox::SpawnRedirect;
use crate::store::{DbHandle, FollowUpMode, Role, ThreadStage, ThreadStatus};
use crate::ws::{WsBroker, WsEvent, WsEventType};

/// Everything needed to launch (or relaunch) an agent on a thread.
#[derive(Debug, Clone)]
pub struct StartAgentParams {
    pub thread_id: i64,
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: String,
    pub images: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub provider: String,
    pub user_id: Option<String>,
    pub redirect: Option<SpawnRedirect>,
}

impl StartAgentParams {
    pub fn new(thread_id: i64, prompt: &str, cwd: PathBuf, provider: &str) -> Self {
        Self {
            thread_id,
            prompt: prompt.to_string(),
            cwd,
            model: None,
            permission_mode: "default".to_string(),
            images: Vec::new(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            provider: provider.to_string(),
            user_id: None,
            redirect: None,
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    manually_stopped: Arc<AtomicBool>,
    /// User replies routed to a held control request inside the run loop.
    reply_tx: mpsc::Sender<String>,
    join: tokio::task::JoinHandle<()>,
}

pub struct AgentOrchestrator {
    db: DbHandle,
    broker: WsBroker,
    handler: Arc<MessageHandler>,
    git: Arc<GitService>,
    active: Mutex<HashMap<i64, ActiveRun>>,
    queues: Mutex<HashMap<i64, VecDeque<String>>>,
}

impl AgentOrchestrator {
    pub fn new(db: DbHandle, broker: WsBroker, git: Arc<GitService>) -> Arc<Self> {
        let handler = Arc::new(MessageHandler::new(db.clone(), broker.clone()));
        Arc::new(Self {
            db,
            broker,
            handler,
            git,
            active: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub async fn is_running(&self, thread_id: i64) -> bool {
        let active = self.active.lock().await;
        active
            .get(&thread_id)
            .map(|run| !run.join.is_finished())
            .unwrap_or(false)
    }

    /// Start a fresh agent on the thread. An existing live process is
    /// stopped first.
    pub async fn start_agent(self: &Arc<Self>, params: StartAgentParams) -> Result<()> {
        let thread_id = params.thread_id;

        if self.is_running(thread_id).await {
            self.kill_run(thread_id, true).await;
        }

        let thread = self
            .db
            .call(move |db| db.get_thread(thread_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("thread {}", thread_id)))?;

        // One active agent per (project, branch).
        if let Some(ref branch) = thread.branch {
            let project_id = thread.project_id;
            let branch = branch.clone();
            if let Some(holder) = self
                .db
                .call(move |db| db.find_active_thread_for_branch(project_id, &branch))
                .await?
                && holder.id != thread_id
            {
                return Err(Error::Conflict(format!(
                    "thread {} is already active on branch {}",
                    holder.id,
                    thread.branch.as_deref().unwrap_or_default()
                )));
            }
        }

        // Resume with an approved plan must not re-enter planning.
        let mut permission_mode = params.permission_mode.clone();
        if thread.session_id.is_some() && permission_mode == "plan" {
            permission_mode = "acceptEdits".to_string();
            let mode = permission_mode.clone();
            self.db
                .call(move |db| db.set_thread_permission_mode(thread_id, &mode))
                .await?;
            self.emit(
                params.user_id.as_deref(),
                thread_id,
                WsEventType::AgentStatus,
                serde_json::json!({"permissionMode": "acceptEdits", "downgradedFrom": "plan"}),
            );
        }

        {
            let prompt = params.prompt.clone();
            let images = params.images.clone();
            let model = params.model.clone();
            let mode = permission_mode.clone();
            self.db
                .call(move |db| {
                    db.insert_message(
                        thread_id,
                        Role::User,
                        &prompt,
                        &images,
                        model.as_deref(),
                        Some(&mode),
                    )?;
                    db.reset_result(thread_id)?;
                    db.update_thread_status(thread_id, ThreadStatus::Running, None)
                })
                .await?;
        }

        // Picking a thread back up moves it into in_progress.
        if matches!(thread.stage, ThreadStage::Backlog | ThreadStage::Review) {
            self.db
                .call(move |db| db.update_thread_stage(thread_id, ThreadStage::InProgress))
                .await?;
        }

        let provider = provider_for(&params.provider)?;
        let mut opts = StartOptions::new(&params.prompt, params.cwd.clone());
        opts.model = params.model.clone();
        opts.permission_mode = permission_mode;
        opts.session_id = thread.session_id.clone();
        opts.allowed_tools = params.allowed_tools.clone();
        opts.disallowed_tools = params.disallowed_tools.clone();
        opts.images = params.images.clone();
        opts.redirect = params.redirect.clone();

        let cancel = CancellationToken::new();
        let manually_stopped = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = mpsc::channel::<String>(8);

        let orchestrator = Arc::clone(self);
        let run_cancel = cancel.clone();
        let run_stopped = Arc::clone(&manually_stopped);
        let template = params.clone();
        let had_session = thread.session_id.is_some();
        let join = tokio::spawn(async move {
            orchestrator
                .run_loop(provider, opts, template, had_session, run_cancel, run_stopped, reply_rx)
                .await;
        });

        let mut active = self.active.lock().await;
        active.insert(
            thread_id,
            ActiveRun {
                cancel,
                manually_stopped,
                reply_tx,
                join,
            },
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        self: Arc<Self>,
        provider: Arc<dyn super::provider::AgentProvider>,
        opts: StartOptions,
        template: StartAgentParams,
        had_session: bool,
        cancel: CancellationToken,
        manually_stopped: Arc<AtomicBool>,
        mut reply_rx: mpsc::Receiver<String>,
    ) {
        let thread_id = template.thread_id;
        let user_id = template.user_id.clone();

        let mut process = match provider.start(opts).await {
            Ok(process) => process,
            Err(err) => {
                error!(thread_id, error = %err, "failed to start agent process");
                self.fail_thread(thread_id, user_id.as_deref(), &err.to_string())
                    .await;
                return;
            }
        };

        info!(thread_id, provider = process.provider(), "agent process started");
        let mut state = ThreadRunState::new(thread_id, user_id.clone());
        let mut final_status: Option<ThreadStatus> = None;
        let mut replies_closed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    process.kill().await;
                    break;
                }

                reply = reply_rx.recv(), if !replies_closed => {
                    match reply {
                        Some(reply) => match self.handler.answer_held(&mut state, &reply).await {
                            Ok(Some(response)) => {
                                if let Err(err) = process.send_control_response(&response).await {
                                    warn!(thread_id, error = %err, "failed to send control response");
                                }
                            }
                            Ok(None) => {
                                warn!(thread_id, "follow-up reply with no held request");
                            }
                            Err(err) => warn!(thread_id, error = %err, "answer_held failed"),
                        },
                        // Sender dropped: the run entry is being torn down
                        // and cancellation is on its way.
                        None => replies_closed = true,
                    }
                }

                next = process.next_message() => {
                    match next {
                        Ok(Some(msg)) => match self.handler.handle(&mut state, msg).await {
                            Ok(HandlerOutcome::Respond(response)) => {
                                if let Err(err) = process.send_control_response(&response).await {
                                    warn!(thread_id, error = %err, "failed to send control response");
                                }
                            }
                            Ok(HandlerOutcome::Finished(status)) => {
                                final_status = Some(status);
                            }
                            Ok(HandlerOutcome::Continue | HandlerOutcome::Held) => {}
                            Err(err) => {
                                warn!(thread_id, error = %err, "handler error, continuing stream");
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            warn!(thread_id, error = %err, "agent stream failed");
                            break;
                        }
                    }
                }
            }
        }

        let (exit_code, stderr_tail) = process.wait().await;

        if manually_stopped.load(Ordering::SeqCst) {
            // stop_agent already set the terminal status.
        } else if final_status.is_none() {
            // Died without a result. A rejected resume is recovered by
            // clearing the session so the next attempt starts fresh.
            if had_session && looks_like_resume_failure(&stderr_tail) {
                info!(thread_id, "provider rejected the stored session, clearing it");
                let _ = self
                    .db
                    .call(move |db| db.set_thread_session(thread_id, None))
                    .await;
                self.emit(
                    user_id.as_deref(),
                    thread_id,
                    WsEventType::AgentError,
                    serde_json::json!({"code": "session-cleared", "exitCode": exit_code}),
                );
                self.fail_thread(thread_id, user_id.as_deref(), "resume failed; session cleared")
                    .await;
            } else {
                self.fail_thread(
                    thread_id,
                    user_id.as_deref(),
                    &format!("agent exited with code {} before a result", exit_code),
                )
                .await;
            }
        }

        // The run may have changed the tree; tell subscribed UIs.
        self.emit_git_status(thread_id, user_id.as_deref()).await;

        // Queue policy: a terminal run picks up the oldest queued message.
        let finished_terminally = final_status.map(|s| s.is_terminal()).unwrap_or(true)
            && !manually_stopped.load(Ordering::SeqCst);
        if finished_terminally {
            self.drain_queue_into_new_run(template).await;
        }
    }

    async fn emit_git_status(&self, thread_id: i64, user_id: Option<&str>) {
        let Ok(Some(thread)) = self.db.call(move |db| db.get_thread(thread_id)).await else {
            return;
        };
        let Some(worktree) = thread.worktree_path.as_deref().map(std::path::PathBuf::from)
        else {
            return;
        };
        match self
            .git
            .status_summary(&worktree, thread.base_branch.as_deref(), None)
            .await
        {
            Ok(summary) => {
                let sync_state = derive_git_sync_state(&summary);
                self.emit(
                    user_id,
                    thread_id,
                    WsEventType::GitStatus,
                    serde_json::json!({"summary": summary, "syncState": sync_state}),
                );
            }
            Err(err) => warn!(thread_id, error = %err, "git status refresh failed"),
        }
    }

    async fn drain_queue_into_new_run(self: &Arc<Self>, template: StartAgentParams) {
        let thread_id = template.thread_id;
        let next = {
            let mut queues = self.queues.lock().await;
            queues.get_mut(&thread_id).and_then(|q| q.pop_front())
        };
        let Some(next_prompt) = next else { return };

        self.emit_queue_update(template.user_id.as_deref(), thread_id).await;

        let mut params = template;
        params.prompt = next_prompt;
        params.images = Vec::new();
        let orchestrator = Arc::clone(self);
        // Start from a fresh task: the current run task is finishing.
        follow_up::spawn_start_agent(orchestrator, params, thread_id);
    }

    /// User sent another message while the thread may be busy.
    ///
    /// - Held control request → the reply answers it.
    /// - Running + `interrupt` → stop and restart with the new prompt.
    /// - Running + `queue` → enqueue.
    /// - Otherwise → fresh run (resuming the provider session if any).
    pub async fn send_follow_up(self: &Arc<Self>, params: StartAgentParams) -> Result<()> {
        let thread_id = params.thread_id;
        let thread = self
            .db
            .call(move |db| db.get_thread(thread_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("thread {}", thread_id)))?;
        let project_id = thread.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

        if self.is_running(thread_id).await {
            if thread.status == ThreadStatus::Waiting {
                // Answer the held request; the reply is also transcript.
                let prompt = params.prompt.clone();
                self.db
                    .call(move |db| {
                        db.insert_message(thread_id, Role::User, &prompt, &[], None, None)
                    })
                    .await?;
                let active = self.active.lock().await;
                if let Some(run) = active.get(&thread_id) {
                    run.reply_tx
                        .send(params.prompt.clone())
                        .await
                        .map_err(|_| Error::Internal("agent run loop is gone".into()))?;
                }
                return Ok(());
            }

            return match project.follow_up_mode {
                FollowUpMode::Interrupt => {
                    self.kill_run(thread_id, true).await;
                    self.db
                        .call(move |db| {
                            db.update_thread_status(thread_id, ThreadStatus::Interrupted, None)
                        })
                        .await?;
                    self.start_agent(params).await
                }
                FollowUpMode::Queue => {
                    {
                        let mut queues = self.queues.lock().await;
                        queues
                            .entry(thread_id)
                            .or_default()
                            .push_back(params.prompt.clone());
                    }
                    self.emit_queue_update(params.user_id.as_deref(), thread_id).await;
                    Ok(())
                }
            };
        }

        // Idle / waiting-without-process: a fresh run resumes the session.
        self.start_agent(params).await
    }

    /// Kill the process and mark the thread stopped.
    pub async fn stop_agent(&self, thread_id: i64) -> Result<()> {
        if !self.is_running(thread_id).await {
            return Err(Error::NotFound(format!("running agent for thread {}", thread_id)));
        }
        self.kill_run(thread_id, true).await;

        let thread = self
            .db
            .call(move |db| db.update_thread_status(thread_id, ThreadStatus::Stopped, None))
            .await?;

        // Queue mode drains on stop: queued follow-ups die with the run.
        let project_id = thread.project_id;
        let project = self.db.call(move |db| db.get_project(project_id)).await?;
        if project.map(|p| p.follow_up_mode) == Some(FollowUpMode::Queue) {
            let mut queues = self.queues.lock().await;
            queues.remove(&thread_id);
            drop(queues);
            self.emit_queue_update(None, thread_id).await;
        }

        self.emit(
            None,
            thread_id,
            WsEventType::AgentStatus,
            serde_json::json!({"status": "stopped"}),
        );
        Ok(())
    }

    async fn kill_run(&self, thread_id: i64, manual: bool) {
        let run = {
            let mut active = self.active.lock().await;
            active.remove(&thread_id)
        };
        if let Some(run) = run {
            if manual {
                run.manually_stopped.store(true, Ordering::SeqCst);
            }
            run.cancel.cancel();
            let _ = run.join.await;
        }
    }

    pub async fn cleanup_thread_state(&self, thread_id: i64) {
        self.kill_run(thread_id, true).await;
        let mut queues = self.queues.lock().await;
        queues.remove(&thread_id);
    }

    pub async fn stop_all(&self) {
        let thread_ids: Vec<i64> = {
            let active = self.active.lock().await;
            active.keys().copied().collect()
        };
        for thread_id in thread_ids {
            self.kill_run(thread_id, true).await;
        }
    }

    pub async fn queued_count(&self, thread_id: i64) -> usize {
        let queues = self.queues.lock().await;
        queues.get(&thread_id).map(|q| q.len()).unwrap_or(0)
    }

    async fn emit_queue_update(&self, user_id: Option<&str>, thread_id: i64) {
        let (count, next) = {
            let queues = self.queues.lock().await;
            let queue = queues.get(&thread_id);
            (
                queue.map(|q| q.len()).unwrap_or(0),
                queue.and_then(|q| q.front().cloned()),
            )
        };
        self.emit(
            user_id,
            thread_id,
            WsEventType::ThreadQueueUpdate,
            serde_json::json!({"queuedCount": count, "nextMessage": next}),
        );
    }

    async fn fail_thread(&self, thread_id: i64, user_id: Option<&str>, message: &str) {
        let _ = self
            .db
            .call(move |db| db.update_thread_status(thread_id, ThreadStatus::Failed, None))
            .await;
        self.emit(
            user_id,
            thread_id,
            WsEventType::AgentError,
            serde_json::json!({"message": message}),
        );
    }

    fn emit(
        &self,
        user_id: Option<&str>,
        thread_id: i64,
        event_type: WsEventType,
        data: serde_json::Value,
    ) {
        self.broker
            .emit_scoped(user_id, &WsEvent::for_thread(event_type, thread_id, data));
    }
}

/// Isolated in its own module so the compiler doesn't try (and fail) to
/// resolve `start_agent`'s auto-trait status through a cycle formed by
/// this indirectly-recursive spawn.
mod follow_up {
    use std::sync::Arc;

    use tracing::error;

    use super::{AgentOrchestrator, StartAgentParams};

    pub(super) fn spawn_start_agent(
        orchestrator: Arc<AgentOrchestrator>,
        params: StartAgentParams,
        thread_id: i64,
    ) {
        tokio::spawn(async move {
            if let Err(err) = orchestrator.start_agent(params).await {
                error!(thread_id, error = %err, "failed to start queued follow-up");
            }
        });
    }
}

fn looks_like_resume_failure(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no conversation found")
        || lowered.contains("session not found")
        || lowered.contains("unknown session")
        || lowered.contains("failed to resume")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewThread, Store};
    use std::os::unix::fs::PermissionsExt;

    async fn fixture(mode: FollowUpMode) -> (Arc<AgentOrchestrator>, DbHandle, i64) {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let project = {
            let mode = mode;
            db.call(move |s| s.create_project("p", "/tmp/p", mode))
                .await
                .unwrap()
        };
        let thread = db
            .call(move |s| s.create_thread(&NewThread::basic(project.id, "t", "claude")))
            .await
            .unwrap();
        let git = Arc::new(GitService::new(Arc::new(
            crate::process::ProcessRunner::new(crate::process::DEFAULT_POOL_SIZE),
        )));
        let orchestrator = AgentOrchestrator::new(db.clone(), WsBroker::new(), git);
        (orchestrator, db, thread.id)
    }

    fn write_agent_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_until_done(
        orchestrator: &Arc<AgentOrchestrator>,
        thread_id: i64,
    ) {
        for _ in 0..100 {
            if !orchestrator.is_running(thread_id).await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("agent did not finish in time");
    }

    // One test owns the CLAUDE_CMD override end to end; splitting these
    // scenarios across parallel tests would race on the env var.
    #[tokio::test]
    async fn agent_lifecycle_against_scripted_provider() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_agent_script(
            dir.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-9","tools":[]}'
echo '{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"working"}]}}'
echo '{"type":"result","subtype":"success","total_cost_usd":0.05}'"#,
        );
        // SAFETY: test-only env mutation, no parallel reader in this test
        // binary (the other orchestrator tests spawn no processes).
        unsafe { std::env::set_var("CLAUDE_CMD", &script) };

        let (orchestrator, db, thread_id) = fixture(FollowUpMode::Queue).await;
        orchestrator
            .start_agent(StartAgentParams::new(
                thread_id,
                "do the thing",
                dir.path().to_path_buf(),
                "claude",
            ))
            .await
            .unwrap();

        wait_until_done(&orchestrator, thread_id).await;
        // The run task updates the DB before the join handle finishes;
        // poll briefly for the terminal status.
        let mut thread = None;
        for _ in 0..50 {
            let t = db
                .call(move |s| s.get_thread(thread_id))
                .await
                .unwrap()
                .unwrap();
            if t.status == ThreadStatus::Completed {
                thread = Some(t);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let thread = thread.expect("thread should complete");
        assert_eq!(thread.session_id.as_deref(), Some("sess-9"));
        assert!(thread.result_recorded);
        assert!((thread.cost_usd - 0.05).abs() < 1e-9);
        // User prompt + assistant message.
        let messages = db.call(move |s| s.list_messages(thread_id)).await.unwrap();
        assert!(messages.iter().any(|m| m.role == Role::User && m.content == "do the thing"));
        assert!(messages.iter().any(|m| m.role == Role::Assistant && m.content == "working"));

        // Second act: a long-running agent is stopped by the user.
        let sleeper = write_agent_script(
            dir.path(),
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-9"}'
sleep 60"#,
        );
        unsafe { std::env::set_var("CLAUDE_CMD", &sleeper) };

        orchestrator
            .start_agent(StartAgentParams::new(
                thread_id,
                "spin",
                dir.path().to_path_buf(),
                "claude",
            ))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(orchestrator.is_running(thread_id).await);

        orchestrator.stop_agent(thread_id).await.unwrap();
        assert!(!orchestrator.is_running(thread_id).await);
        let thread = db
            .call(move |s| s.get_thread(thread_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.status, ThreadStatus::Stopped);

        unsafe { std::env::remove_var("CLAUDE_CMD") };
    }

    #[tokio::test]
    async fn stop_without_running_agent_is_not_found() {
        let (orchestrator, _db, thread_id) = fixture(FollowUpMode::Queue).await;
        assert!(matches!(
            orchestrator.stop_agent(thread_id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn queue_counts_are_tracked_per_thread() {
        let (orchestrator, _db, thread_id) = fixture(FollowUpMode::Queue).await;
        assert_eq!(orchestrator.queued_count(thread_id).await, 0);
        {
            let mut queues = orchestrator.queues.lock().await;
            queues
                .entry(thread_id)
                .or_default()
                .push_back("queued".into());
        }
        assert_eq!(orchestrator.queued_count(thread_id).await, 1);
        orchestrator.cleanup_thread_state(thread_id).await;
        assert_eq!(orchestrator.queued_count(thread_id).await, 0);
    }

    #[test]
    fn resume_failure_detection_matches_known_shapes() {
        assert!(looks_like_resume_failure("Error: No conversation found with session ID"));
        assert!(looks_like_resume_failure("SESSION NOT FOUND"));
        assert!(!looks_like_resume_failure("network unreachable"));
        assert!(!looks_like_resume_failure(""));
    }
}
