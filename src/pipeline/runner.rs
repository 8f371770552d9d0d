//! Per-request pipeline lifecycle.
//!
//! A request is admitted through the idempotency guard (with stale-entry
//! self-healing), classified into a tier by change size, and run as a
//! saga: start sandbox → run the tier's agents → integrate. A failing
//! agent flips the state machine into `correcting`, runs the correction
//! agent, and retries up to the configured attempt budget. Every
//! lifecycle step is published to the event bus; webhook consumers and
//! SSE streams both ride that log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AgentSpec, PipelineConfig};
use crate::errors::{Error, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::fsm::{PipelineStatus, StateMachine, pipeline_machine};
use crate::gitops::GitService;
use crate::guard::IdempotencyGuard;
use crate::saga::Saga;
use crate::sandbox::SandboxManager;

use super::director::Manifest;

/// How long terminal request state stays queryable.
const TERMINAL_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub request_id: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub base_branch: String,
    pub metadata: Value,
    /// Per-request override; the runner's project config applies when None.
    pub config: Option<PipelineConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub request_id: String,
    pub branch: String,
    pub status: PipelineStatus,
    pub tier: Option<String>,
    pub agents: Vec<String>,
    pub agents_completed: u32,
    pub correction_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted { request_id: String },
    AlreadyRunning { request_id: String },
}

struct RunState {
    request: PipelineRequest,
    machine: StateMachine<PipelineStatus>,
    tier: Option<String>,
    agents: Vec<String>,
    agents_completed: u32,
    correction_attempts: u32,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            request_id: self.request.request_id.clone(),
            branch: self.request.branch.clone(),
            status: self.machine.state(),
            tier: self.tier.clone(),
            agents: self.agents.clone(),
            agents_completed: self.agents_completed,
            correction_attempts: self.correction_attempts,
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Executes pipeline agents for a request. The production implementation
/// runs them inside the request's Podman sandbox; tests substitute a
/// double, mirroring the executor seam the thread runtime uses.
#[async_trait]
pub trait AgentExec: Send + Sync {
    /// `(files_changed, lines_changed)` of the branch against its base.
    async fn measure_change(&self, request: &PipelineRequest) -> Result<(i64, i64)>;

    /// Acquire per-request resources (the sandbox container).
    async fn prepare(&self, request: &PipelineRequest) -> Result<()>;

    /// Run one agent to terminal. `Ok(false)` is a quality failure worth
    /// correcting; `Err` is an infrastructure failure that kills the run.
    async fn run_agent(
        &self,
        request: &PipelineRequest,
        agent: &str,
        spec: &AgentSpec,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Release per-request resources.
    async fn cleanup(&self, request: &PipelineRequest) -> Result<()>;
}

pub struct PipelineRunner {
    guard: Arc<IdempotencyGuard>,
    bus: Arc<EventBus>,
    exec: Arc<dyn AgentExec>,
    manifest: Arc<Manifest>,
    config: PipelineConfig,
    states: Mutex<HashMap<String, RunState>>,
}

impl PipelineRunner {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        bus: Arc<EventBus>,
        exec: Arc<dyn AgentExec>,
        manifest: Arc<Manifest>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            guard,
            bus,
            exec,
            manifest,
            config,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub async fn status(&self, request_id: &str) -> Option<PipelineSnapshot> {
        let states = self.states.lock().await;
        states.get(request_id).map(|s| s.snapshot())
    }

    pub async fn list(&self) -> Vec<PipelineSnapshot> {
        let states = self.states.lock().await;
        let mut all: Vec<PipelineSnapshot> = states.values().map(|s| s.snapshot()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn is_running(&self, request_id: &str) -> bool {
        let states = self.states.lock().await;
        states
            .get(request_id)
            .map(|s| !s.machine.state().is_terminal())
            .unwrap_or(false)
    }

    /// Admit a request, enforcing at most one active pipeline per branch.
    ///
    /// A duplicate whose incumbent has no live runner state is stale (a
    /// crash left the reservation behind); the guard self-heals by moving
    /// the reservation to the new request.
    pub async fn submit(self: &Arc<Self>, request: PipelineRequest) -> Result<SubmitOutcome> {
        self.sweep_terminal().await;

        let branch = request.branch.clone();
        let request_id = request.request_id.clone();

        let decision = self.guard.check(&branch);
        if decision.is_duplicate {
            let existing = decision
                .existing_request_id
                .expect("duplicate decision carries the incumbent");
            let live = self.is_running(&existing).await || self.status(&existing).await.is_some();
            if live {
                return Ok(SubmitOutcome::AlreadyRunning {
                    request_id: existing,
                });
            }
            info!(%branch, stale = %existing, "healing stale idempotency reservation");
            if !self.guard.replace_stale(&branch, &existing, &request_id) {
                // Raced with another healer; surface whoever won.
                let winner = self
                    .guard
                    .check(&branch)
                    .existing_request_id
                    .unwrap_or(existing);
                return Ok(SubmitOutcome::AlreadyRunning { request_id: winner });
            }
        } else if !self.guard.register(&branch, &request_id) {
            let winner = self
                .guard
                .check(&branch)
                .existing_request_id
                .unwrap_or_default();
            return Ok(SubmitOutcome::AlreadyRunning { request_id: winner });
        }

        let cancel = CancellationToken::new();
        {
            let mut states = self.states.lock().await;
            states.insert(
                request_id.clone(),
                RunState {
                    request: request.clone(),
                    machine: pipeline_machine(),
                    tier: None,
                    agents: Vec::new(),
                    agents_completed: 0,
                    correction_attempts: 0,
                    cancel: cancel.clone(),
                    created_at: Utc::now(),
                    finished_at: None,
                },
            );
        }
        self.publish(&request_id, "pipeline.accepted", serde_json::json!({
            "branch": request.branch,
            "base_branch": request.base_branch,
        }))
        .await;

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run_to_completion(request, cancel).await;
        });

        Ok(SubmitOutcome::Accepted { request_id })
    }

    /// Cancel a running pipeline. `NotFound` when nothing is running.
    pub async fn stop(&self, request_id: &str) -> Result<()> {
        let cancel = {
            let states = self.states.lock().await;
            match states.get(request_id) {
                Some(state) if !state.machine.state().is_terminal() => state.cancel.clone(),
                _ => {
                    return Err(Error::NotFound(format!("running pipeline {}", request_id)));
                }
            }
        };
        cancel.cancel();
        self.publish(request_id, "pipeline.stopped", serde_json::json!({}))
            .await;
        Ok(())
    }

    /// Drop a terminal request's state immediately (admin/test hook).
    pub async fn purge(&self, request_id: &str) -> bool {
        let mut states = self.states.lock().await;
        match states.get(request_id) {
            Some(state) if state.machine.state().is_terminal() => {
                states.remove(request_id);
                true
            }
            _ => false,
        }
    }

    async fn sweep_terminal(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(TERMINAL_RETENTION).unwrap_or(chrono::Duration::hours(1));
        let mut states = self.states.lock().await;
        states.retain(|_, state| {
            !(state.machine.state().is_terminal()
                && state.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
    }

    async fn run_to_completion(self: Arc<Self>, request: PipelineRequest, cancel: CancellationToken) {
        let request_id = request.request_id.clone();

        self.transition(&request_id, PipelineStatus::Running).await;
        self.publish(&request_id, "pipeline.started", serde_json::json!({}))
            .await;

        // Tier classification from the branch's change size.
        let config = request.config.clone().unwrap_or_else(|| self.config.clone());

        let (files, lines) = match self.exec.measure_change(&request).await {
            Ok(size) => size,
            Err(err) => {
                error!(%request_id, error = %err, "change measurement failed");
                self.finish(&request, PipelineStatus::Error, &err.to_string()).await;
                return;
            }
        };
        let tier = config.classify_tier(files, lines);
        let agents = config.tier_agents(&tier);
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&request_id) {
                state.tier = Some(tier.clone());
                state.agents = agents.clone();
            }
        }
        self.publish(
            &request_id,
            "pipeline.tier_classified",
            serde_json::json!({"tier": tier, "files": files, "lines": lines, "agents": agents}),
        )
        .await;

        // Saga: sandbox acquisition unwinds on any later failure.
        let prepare_runner = Arc::clone(&self);
        let prepare_request = request.clone();
        let cleanup_runner = Arc::clone(&self);
        let cleanup_request = request.clone();
        let agents_runner = Arc::clone(&self);
        let agents_request = request.clone();
        let agents_cancel = cancel.clone();
        let agents_config = config.clone();

        let saga = Saga::new(format!("pipeline-{}", request_id))
            .step_compensated(
                "start_sandbox",
                move || {
                    Box::pin(async move {
                        prepare_runner.exec.prepare(&prepare_request).await?;
                        prepare_runner
                            .publish(
                                &prepare_request.request_id,
                                "pipeline.containers.ready",
                                serde_json::json!({}),
                            )
                            .await;
                        Ok(())
                    })
                },
                move || {
                    Box::pin(async move {
                        cleanup_runner.exec.cleanup(&cleanup_request).await
                    })
                },
            )
            .step("run_agents", move || {
                Box::pin(async move {
                    agents_runner
                        .run_agents(&agents_request, &agents_config, agents, &agents_cancel)
                        .await
                })
            });

        match saga.run().await {
            Ok(()) => {
                // Normal-path resource release; failures already cleaned up
                // through the compensation.
                if let Err(err) = self.exec.cleanup(&request).await {
                    warn!(%request_id, error = %err, "sandbox cleanup failed");
                }
                self.manifest
                    .record_ready(&request.branch, &request.worktree_path, &request.base_branch, &request_id)
                    .await;
                self.finish(&request, PipelineStatus::Approved, "all agents passed")
                    .await;
            }
            Err(failure) => {
                let status = if cancel.is_cancelled() {
                    PipelineStatus::Error
                } else {
                    PipelineStatus::Failed
                };
                self.finish(&request, status, &failure.error.to_string()).await;
            }
        }
    }

    async fn run_agents(
        self: &Arc<Self>,
        request: &PipelineRequest,
        config: &PipelineConfig,
        agents: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request_id = &request.request_id;
        let correction = &config.auto_correction;

        for agent in &agents {
            let spec = config.agents.get(agent).cloned().unwrap_or_default();
            self.publish(request_id, "pipeline.agent.started", serde_json::json!({"agent": agent}))
                .await;

            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Internal("pipeline cancelled".into()));
                }

                let passed = self.exec.run_agent(request, agent, &spec, cancel).await?;
                if passed {
                    self.publish(
                        request_id,
                        "pipeline.agent.completed",
                        serde_json::json!({"agent": agent}),
                    )
                    .await;
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(request_id) {
                        state.agents_completed += 1;
                    }
                    break;
                }

                self.publish(
                    request_id,
                    "pipeline.agent.failed",
                    serde_json::json!({"agent": agent}),
                )
                .await;

                let attempts_so_far = {
                    let states = self.states.lock().await;
                    states
                        .get(request_id)
                        .map(|s| s.correction_attempts)
                        .unwrap_or(0)
                };
                if !correction.enabled || attempts_so_far >= correction.max_attempts {
                    return Err(Error::Internal(format!(
                        "agent {} failed after {} correction attempts",
                        agent, attempts_so_far
                    )));
                }

                self.transition(request_id, PipelineStatus::Correcting).await;
                {
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(request_id) {
                        state.correction_attempts += 1;
                    }
                }
                self.publish(
                    request_id,
                    "pipeline.correcting",
                    serde_json::json!({"agent": agent, "attempt": attempts_so_far + 1}),
                )
                .await;

                let corrector_spec = config
                    .agents
                    .get(&correction.agent)
                    .cloned()
                    .unwrap_or_default();
                let corrected = self
                    .exec
                    .run_agent(request, &correction.agent, &corrector_spec, cancel)
                    .await?;
                self.transition(request_id, PipelineStatus::Running).await;
                if !corrected {
                    return Err(Error::Internal(format!(
                        "correction agent {} itself failed",
                        correction.agent
                    )));
                }
                // Retry the same agent against the corrected tree.
            }
        }
        Ok(())
    }

    async fn finish(&self, request: &PipelineRequest, status: PipelineStatus, detail: &str) {
        let request_id = &request.request_id;
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(request_id) {
                // Cancellation can land mid-correction; step back to
                // running before taking the terminal edge.
                if state.machine.state() == PipelineStatus::Correcting {
                    let _ = state.machine.try_transition(PipelineStatus::Running);
                }
                if !state.machine.try_transition(status) {
                    warn!(
                        %request_id,
                        from = %state.machine.state(),
                        to = %status,
                        "terminal transition rejected"
                    );
                }
                state.finished_at = Some(Utc::now());
            }
        }

        let event = match status {
            PipelineStatus::Approved => "pipeline.completed",
            _ => "pipeline.failed",
        };
        self.publish(
            request_id,
            event,
            serde_json::json!({"status": status.as_str(), "detail": detail}),
        )
        .await;

        self.guard.release(&request.branch);
    }

    async fn transition(&self, request_id: &str, to: PipelineStatus) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(request_id)
            && let Err(err) = state.machine.transition(to)
        {
            warn!(%request_id, error = %err, "pipeline transition rejected");
        }
    }

    async fn publish(&self, request_id: &str, event_type: &str, data: Value) {
        let event = PipelineEvent::now(request_id, event_type, data);
        if let Err(err) = self.bus.publish(event).await {
            warn!(%request_id, %event_type, error = %err, "event publish failed");
        }
    }
}

// ── Sandbox-backed executor ──────────────────────────────────────────

/// Production executor: agents run inside the request's Podman sandbox
/// via the spawn-redirection hook, and their stream lines are mirrored to
/// the bus as `pipeline.cli_message` for UI consumers.
pub struct SandboxAgentExec {
    sandbox: Arc<SandboxManager>,
    git: Arc<GitService>,
    bus: Arc<EventBus>,
    env: HashMap<String, String>,
}

impl SandboxAgentExec {
    pub fn new(
        sandbox: Arc<SandboxManager>,
        git: Arc<GitService>,
        bus: Arc<EventBus>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            sandbox,
            git,
            bus,
            env,
        }
    }

    fn agent_prompt(agent: &str, spec: &AgentSpec) -> String {
        if !spec.prompt.is_empty() {
            return spec.prompt.clone();
        }
        format!(
            "You are the {} quality agent. Review the working tree, fix what \
             your specialty covers, and exit non-conversationally when done.",
            agent
        )
    }
}

#[async_trait]
impl AgentExec for SandboxAgentExec {
    async fn measure_change(&self, request: &PipelineRequest) -> Result<(i64, i64)> {
        self.git
            .change_size(&request.worktree_path, &request.base_branch)
            .await
    }

    async fn prepare(&self, request: &PipelineRequest) -> Result<()> {
        self.sandbox
            .start_sandbox(
                &request.request_id,
                &request.worktree_path,
                &request.branch,
                &self.env,
            )
            .await?;
        Ok(())
    }

    async fn run_agent(
        &self,
        request: &PipelineRequest,
        agent: &str,
        spec: &AgentSpec,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        use crate::agent::message::{CliMessage, parse_line};
        use crate::agent::provider::{AgentProvider, ClaudeProvider, StartOptions};

        let redirect = self.sandbox.spawn_fn(&request.request_id).await?;
        let mut opts = StartOptions::new(
            &Self::agent_prompt(agent, spec),
            PathBuf::from("/workspace"),
        );
        opts.model = spec.model.clone();
        opts.permission_mode = "acceptEdits".to_string();

        let (command, args) = ClaudeProvider.build_command(&opts);
        let mut child = redirect
            .spawn(&command, &args, "/workspace", &self.env)
            .map_err(|e| Error::Internal(format!("sandbox agent spawn failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("sandbox agent has no stdout".into()))?;
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        let mut passed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(Error::Internal("pipeline cancelled".into()));
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let event = PipelineEvent::now(
                            &request.request_id,
                            "pipeline.cli_message",
                            serde_json::json!({"agent": agent, "line": line}),
                        );
                        let _ = self.bus.publish(event).await;
                        if let Some(CliMessage::Result { subtype, is_error, .. }) = parse_line(&line) {
                            passed = subtype == "success" && !is_error;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(Error::Internal(format!("agent stream error: {}", e))),
                }
            }
        }

        let status = child.wait().await.map_err(Error::internal)?;
        Ok(passed && status.success())
    }

    async fn cleanup(&self, request: &PipelineRequest) -> Result<()> {
        self.sandbox.stop_sandbox(&request.request_id).await
    }
}
