//! Route handlers and the domain-error → status-code mapping.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::agent::{AgentOrchestrator, StartAgentParams};
use crate::automation;
use crate::config::PipelineConfig;
use crate::errors::Error;
use crate::events::EventBus;
use crate::gitops::{GitIdentity, GitService, derive_git_sync_state};
use crate::pipeline::{PipelineRequest, PipelineRunner, SubmitOutcome};
use crate::store::{DbHandle, FollowUpMode, NewThread, ThreadMode};
use crate::ws::WsBroker;

// ── Shared application state ─────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub broker: WsBroker,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub pipeline: Arc<PipelineRunner>,
    pub bus: Arc<EventBus>,
    pub git: Arc<GitService>,
    pub project_path: PathBuf,
}

pub type SharedState = Arc<AppState>;

// ── Error mapping ────────────────────────────────────────────────────

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Process(_) | Error::Transition(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(kind = self.0.kind(), error = %self.0, "internal error surfaced to client");
        }
        (
            status,
            Json(serde_json::json!({"error": self.0.to_string(), "kind": self.0.kind()})),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ── Request payloads ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RunPipelineRequest {
    pub branch: String,
    pub worktree_path: String,
    pub base_branch: Option<String>,
    pub config: Option<PipelineConfig>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub path: String,
    pub follow_up_mode: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateThreadRequest {
    pub title: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub mode: Option<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_path: Option<String>,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateAutomationRequest {
    pub name: String,
    pub prompt: String,
    pub cron_expression: String,
    pub max_runs: Option<i64>,
}

#[derive(Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

// ── Router ───────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        // Pipeline surface
        .route("/pipeline/run", post(run_pipeline))
        .route("/pipeline/list", get(list_pipelines))
        .route("/pipeline/{id}", get(get_pipeline))
        .route("/pipeline/{id}/events", get(pipeline_events))
        .route("/pipeline/{id}/stop", post(stop_pipeline))
        // Thread service
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).delete(delete_project))
        .route("/api/projects/{id}/follow-up", post(set_follow_up_mode))
        .route("/api/projects/{id}/threads", get(list_threads).post(create_thread))
        .route(
            "/api/projects/{id}/automations",
            get(list_automations).post(create_automation),
        )
        .route(
            "/api/projects/{id}/commands",
            get(list_commands).post(create_command),
        )
        .route("/api/commands/{id}", axum::routing::delete(delete_command))
        .route("/api/commands/{id}/run", post(run_command))
        .route("/api/automations/{id}/enabled", post(set_automation_enabled))
        .route("/api/automations/{id}/runs", get(list_automation_runs))
        .route("/api/threads/{id}", get(get_thread).delete(delete_thread))
        .route("/api/threads/{id}/messages", post(send_message))
        .route("/api/threads/{id}/stop", post(stop_thread))
        .route("/api/threads/{id}/archive", post(archive_thread))
        .route("/api/threads/{id}/pin", post(pin_thread))
        .route("/api/threads/{id}/stages", get(thread_stage_history))
        .route("/api/threads/{id}/worktree", post(create_thread_worktree))
        .route("/api/threads/{id}/git-status", get(thread_git_status))
        .route("/api/threads/{id}/git/commit", post(commit_thread))
        .route("/api/threads/{id}/git/push", post(push_thread))
        .route("/api/threads/{id}/git/pr", post(open_thread_pr))
        .route("/health", get(health_check))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Pipeline handlers ────────────────────────────────────────────────

async fn run_pipeline(
    State(state): State<SharedState>,
    Json(body): Json<RunPipelineRequest>,
) -> ApiResult<Response> {
    let worktree = PathBuf::from(&body.worktree_path);
    if !worktree.is_absolute() || !worktree.is_dir() {
        return Err(Error::BadRequest(format!(
            "worktree_path must be an existing absolute directory: {}",
            body.worktree_path
        ))
        .into());
    }
    if !state.git.is_git_repo(&worktree) {
        return Err(Error::BadRequest(format!(
            "worktree_path is not a git repository: {}",
            body.worktree_path
        ))
        .into());
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let request = PipelineRequest {
        request_id: request_id.clone(),
        branch: body.branch,
        worktree_path: worktree,
        base_branch: body.base_branch.unwrap_or_else(|| "main".to_string()),
        metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
        config: body.config,
    };

    match state.pipeline.submit(request).await? {
        SubmitOutcome::Accepted { request_id } => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "request_id": request_id,
                "status": "accepted",
                "events_url": format!("/pipeline/{}/events", request_id),
            })),
        )
            .into_response()),
        SubmitOutcome::AlreadyRunning { request_id } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "request_id": request_id,
                "status": "already_running",
                "events_url": format!("/pipeline/{}/events", request_id),
            })),
        )
            .into_response()),
    }
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.pipeline.status(&id).await {
        Some(snapshot) => Ok(Json(snapshot).into_response()),
        None => Err(Error::NotFound(format!("pipeline {}", id)).into()),
    }
}

async fn list_pipelines(State(state): State<SharedState>) -> ApiResult<Response> {
    Ok(Json(state.pipeline.list().await).into_response())
}

async fn stop_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.pipeline.stop(&id).await?;
    Ok(Json(serde_json::json!({"request_id": id, "status": "stopping"})).into_response())
}

/// SSE: flush the persisted history, stream live events, and terminate
/// shortly after the pipeline reaches a terminal state. Client disconnect
/// tears down the pump task, which drops the bus subscription.
async fn pipeline_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl futures::Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    let (historical, mut live) = state.bus.subscribe(&id).await?;
    let runner = Arc::clone(&state.pipeline);
    let request_id = id.clone();

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        for event in historical {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let mut poll = tokio::time::interval(Duration::from_secs(1));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                received = live.recv() => match received {
                    Ok(event) if event.request_id == request_id => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = poll.tick() => {
                    let terminal = runner
                        .status(&request_id)
                        .await
                        .map(|s| s.status.is_terminal())
                        // Unknown request: purged or never existed; there
                        // is only history to serve.
                        .unwrap_or(true);
                    if terminal {
                        // Grace window for final events already in flight.
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        while let Ok(event) = live.try_recv() {
                            if event.request_id == request_id
                                && tx.send(event).await.is_err()
                            {
                                return;
                            }
                        }
                        return;
                    }
                }
            }
        }
    });

    let stream = futures::StreamExt::map(ReceiverStream::new(rx), |event| {
        let sse = SseEvent::default().event(event.event_type.clone());
        Ok(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(_) => SseEvent::default().comment("serialization failure"),
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Project handlers ─────────────────────────────────────────────────

async fn list_projects(State(state): State<SharedState>) -> ApiResult<Response> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects).into_response())
}

async fn create_project(
    State(state): State<SharedState>,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<Response> {
    let path = PathBuf::from(&body.path);
    if !path.is_absolute() || !path.is_dir() {
        return Err(Error::BadRequest(format!(
            "project path must be an existing absolute directory: {}",
            body.path
        ))
        .into());
    }
    let mode = match body.follow_up_mode.as_deref() {
        Some(raw) => FollowUpMode::from_str(raw).map_err(Error::BadRequest)?,
        None => FollowUpMode::Queue,
    };
    let project = state
        .db
        .call(move |db| db.create_project(&body.name, &body.path, mode))
        .await?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let project = state
        .db
        .call(move |db| db.get_project(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", id)))?;
    Ok(Json(project).into_response())
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let deleted = state.db.call(move |db| db.delete_project(id)).await?;
    if !deleted {
        return Err(Error::NotFound(format!("project {}", id)).into());
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct FollowUpModeRequest {
    pub mode: String,
}

async fn set_follow_up_mode(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<FollowUpModeRequest>,
) -> ApiResult<Response> {
    let mode = FollowUpMode::from_str(&body.mode).map_err(Error::BadRequest)?;
    state
        .db
        .call(move |db| db.set_follow_up_mode(id, mode))
        .await?;
    Ok(Json(serde_json::json!({"project_id": id, "follow_up_mode": mode})).into_response())
}

// ── Thread handlers ──────────────────────────────────────────────────

async fn list_threads(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Response> {
    let threads = state
        .db
        .call(move |db| db.list_threads(project_id))
        .await?;
    Ok(Json(threads).into_response())
}

async fn create_thread(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(body): Json<CreateThreadRequest>,
) -> ApiResult<Response> {
    // 404 before insert so a bad project id doesn't surface as a
    // foreign-key conflict.
    state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

    let mode = match body.mode.as_deref() {
        Some(raw) => ThreadMode::from_str(raw).map_err(Error::BadRequest)?,
        None => ThreadMode::Local,
    };
    let new = NewThread {
        project_id,
        title: body.title,
        mode,
        provider: body.provider.unwrap_or_else(|| "claude".to_string()),
        model: body.model,
        permission_mode: body.permission_mode.unwrap_or_else(|| "default".to_string()),
        branch: body.branch,
        base_branch: body.base_branch,
        worktree_path: body.worktree_path,
        automation_id: None,
        external_request_id: None,
    };
    let thread = state.db.call(move |db| db.create_thread(&new)).await?;
    Ok((StatusCode::CREATED, Json(thread)).into_response())
}

async fn get_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let (thread, messages) = state
        .db
        .call(move |db| {
            let thread = db
                .get_thread(id)?
                .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
            let messages = db.list_messages(id)?;
            let mut with_calls = Vec::with_capacity(messages.len());
            for message in messages {
                let tool_calls = db.list_tool_calls(message.id)?;
                with_calls.push(serde_json::json!({
                    "message": message,
                    "tool_calls": tool_calls,
                }));
            }
            Ok((thread, with_calls))
        })
        .await?;
    Ok(Json(serde_json::json!({"thread": thread, "messages": messages})).into_response())
}

async fn delete_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    state.orchestrator.cleanup_thread_state(id).await;
    let deleted = state.db.call(move |db| db.delete_thread(id)).await?;
    if !deleted {
        return Err(Error::NotFound(format!("thread {}", id)).into());
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn archive_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    state
        .db
        .call(move |db| {
            db.get_thread(id)?
                .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
            db.set_thread_archived(id, true)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// A user message: first message starts the agent, later ones follow the
/// project's follow-up policy.
async fn send_message(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(user): Query<UserQuery>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    if body.content.trim().is_empty() {
        return Err(Error::BadRequest("message content is empty".into()).into());
    }
    let thread = state
        .db
        .call(move |db| db.get_thread(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
    let project_id = thread.project_id;
    let project = state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

    let cwd = thread
        .worktree_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&project.path));

    let mut params = StartAgentParams::new(id, &body.content, cwd, &thread.provider);
    params.model = body.model.or(thread.model.clone());
    params.permission_mode = body
        .permission_mode
        .unwrap_or_else(|| thread.permission_mode.clone());
    params.images = body.images;
    params.user_id = user.user;

    state.orchestrator.send_follow_up(params).await?;
    Ok(Json(serde_json::json!({
        "thread_id": id,
        "queued": state.orchestrator.queued_count(id).await,
    }))
    .into_response())
}

async fn stop_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    state.orchestrator.stop_agent(id).await?;
    Ok(Json(serde_json::json!({"thread_id": id, "status": "stopped"})).into_response())
}

async fn thread_git_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let thread = state
        .db
        .call(move |db| db.get_thread(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
    let worktree = thread
        .worktree_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.project_path.clone());

    let summary = state
        .git
        .status_summary(
            &worktree,
            thread.base_branch.as_deref(),
            Some(&state.project_path),
        )
        .await?;
    let sync_state = derive_git_sync_state(&summary);
    Ok(Json(serde_json::json!({"summary": summary, "sync_state": sync_state})).into_response())
}

// ── Thread git lifecycle ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PinRequest {
    pub pinned: bool,
}

async fn pin_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<PinRequest>,
) -> ApiResult<Response> {
    let pinned = body.pinned;
    state
        .db
        .call(move |db| {
            db.get_thread(id)?
                .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
            db.set_thread_pinned(id, pinned)
        })
        .await?;
    Ok(Json(serde_json::json!({"thread_id": id, "pinned": pinned})).into_response())
}

async fn thread_stage_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let history = state
        .db
        .call(move |db| {
            db.get_thread(id)?
                .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
            db.list_stage_history(id)
        })
        .await?;
    Ok(Json(history).into_response())
}

/// Give a worktree-mode thread its own branch and working copy.
async fn create_thread_worktree(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let thread = state
        .db
        .call(move |db| db.get_thread(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
    if thread.mode != ThreadMode::Worktree {
        return Err(Error::BadRequest("thread is not in worktree mode".into()).into());
    }
    if thread.worktree_path.is_some() {
        return Err(Error::Conflict("thread already has a worktree".into()).into());
    }
    let project_id = thread.project_id;
    let project = state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
    let project_path = PathBuf::from(&project.path);

    let base_branch = match thread.base_branch.clone() {
        Some(base) => base,
        None => state
            .git
            .default_branch(&project_path)
            .await?
            .ok_or_else(|| Error::BadRequest("repository has no branches yet".into()))?,
    };
    let branch = thread
        .branch
        .clone()
        .unwrap_or_else(|| format!("foreman/thread-{}", id));
    let worktree_path = project_path.join(".worktrees").join(format!("thread-{}", id));

    state
        .git
        .create_worktree(&project_path, &worktree_path, &branch, &base_branch)
        .await?;

    let worktree_str = worktree_path.to_string_lossy().to_string();
    {
        let branch = branch.clone();
        let base_branch = base_branch.clone();
        let worktree_str = worktree_str.clone();
        state
            .db
            .call(move |db| {
                db.set_thread_branch(id, Some(&branch), Some(&base_branch), Some(&worktree_str))
            })
            .await?;
    }
    Ok(Json(serde_json::json!({
        "thread_id": id,
        "branch": branch,
        "base_branch": base_branch,
        "worktree_path": worktree_str,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct CommitRequest {
    pub message: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

#[derive(Deserialize)]
pub struct PushRequest {
    pub github_token: Option<String>,
}

#[derive(Deserialize)]
pub struct OpenPrRequest {
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub github_token: Option<String>,
}

/// The thread's working copy (worktree if any, else the project root).
async fn thread_working_copy(state: &SharedState, id: i64) -> ApiResult<(PathBuf, Option<String>)> {
    let thread = state
        .db
        .call(move |db| db.get_thread(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
    let cwd = match thread.worktree_path.as_deref() {
        Some(worktree) => PathBuf::from(worktree),
        None => {
            let project_id = thread.project_id;
            let project = state
                .db
                .call(move |db| db.get_project(project_id))
                .await?
                .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
            PathBuf::from(project.path)
        }
    };
    Ok((cwd, thread.branch))
}

async fn commit_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<CommitRequest>,
) -> ApiResult<Response> {
    if body.message.trim().is_empty() {
        return Err(Error::BadRequest("commit message is empty".into()).into());
    }
    let (cwd, _) = thread_working_copy(&state, id).await?;
    let identity = GitIdentity {
        author_name: body.author_name,
        author_email: body.author_email,
        github_token: None,
    };
    let committed = state.git.commit_all(&cwd, &body.message, &identity).await?;
    Ok(Json(serde_json::json!({"thread_id": id, "committed": committed})).into_response())
}

async fn push_thread(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<PushRequest>,
) -> ApiResult<Response> {
    let (cwd, branch) = thread_working_copy(&state, id).await?;
    let branch = match branch {
        Some(branch) => branch,
        None => state.git.current_branch(&cwd).await?,
    };
    let identity = GitIdentity {
        author_name: None,
        author_email: None,
        github_token: body.github_token,
    };
    state.git.push(&cwd, &branch, &identity).await?;
    Ok(Json(serde_json::json!({"thread_id": id, "pushed": branch})).into_response())
}

async fn open_thread_pr(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<OpenPrRequest>,
) -> ApiResult<Response> {
    let (cwd, branch) = thread_working_copy(&state, id).await?;
    let branch = match branch {
        Some(branch) => branch,
        None => state.git.current_branch(&cwd).await?,
    };
    let identity = GitIdentity {
        author_name: None,
        author_email: None,
        github_token: body.github_token,
    };
    let pr_url = state
        .git
        .create_pull_request(&cwd, &branch, &body.title, &body.body, &identity)
        .await?;
    Ok(Json(serde_json::json!({"thread_id": id, "pr_url": pr_url})).into_response())
}

// ── Startup command handlers ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCommandRequest {
    pub command: String,
}

async fn list_commands(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Response> {
    let commands = state
        .db
        .call(move |db| db.list_startup_commands(project_id))
        .await?;
    Ok(Json(commands).into_response())
}

async fn create_command(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(body): Json<CreateCommandRequest>,
) -> ApiResult<Response> {
    if body.command.trim().is_empty() {
        return Err(Error::BadRequest("command is empty".into()).into());
    }
    state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
    let created = state
        .db
        .call(move |db| db.create_startup_command(project_id, &body.command))
        .await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn delete_command(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let deleted = state
        .db
        .call(move |db| db.delete_startup_command(id))
        .await?;
    if !deleted {
        return Err(Error::NotFound(format!("command {}", id)).into());
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Fire-and-forget: the command streams to the UI over `command:output`
/// lines and a final `command:status`.
async fn run_command(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(user): Query<UserQuery>,
) -> ApiResult<Response> {
    let command = state
        .db
        .call(move |db| db.get_startup_command(id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("command {}", id)))?;
    let project_id = command.project_id;
    let project = state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

    let broker = state.broker.clone();
    let user_id = user.user;
    tokio::spawn(async move {
        stream_command(broker, user_id, command.id, &command.command, &project.path).await;
    });
    Ok(Json(serde_json::json!({"command_id": id, "status": "started"})).into_response())
}

async fn stream_command(
    broker: crate::ws::WsBroker,
    user_id: Option<String>,
    command_id: i64,
    command: &str,
    cwd: &str,
) {
    use crate::ws::{WsEvent, WsEventType};
    use tokio::io::AsyncBufReadExt;

    let emit = |event_type, data| {
        broker.emit_scoped(user_id.as_deref(), &WsEvent::new(event_type, None, data));
    };

    let mut child = match tokio::process::Command::new("sh")
        .args(["-c", command])
        .current_dir(cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            emit(
                WsEventType::CommandStatus,
                serde_json::json!({"commandId": command_id, "status": "failed", "error": err.to_string()}),
            );
            return;
        }
    };

    emit(
        WsEventType::CommandStatus,
        serde_json::json!({"commandId": command_id, "status": "running"}),
    );

    // Both pipes drain concurrently with the wait, same as the process
    // runner, but line-by-line so the UI streams.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let broker_out = broker.clone();
    let user_out = user_id.clone();
    let out_task = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            broker_out.emit_scoped(
                user_out.as_deref(),
                &WsEvent::new(
                    WsEventType::CommandOutput,
                    None,
                    serde_json::json!({"commandId": command_id, "stream": "stdout", "line": line}),
                ),
            );
        }
    });
    let broker_err = broker.clone();
    let user_err = user_id.clone();
    let err_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            broker_err.emit_scoped(
                user_err.as_deref(),
                &WsEvent::new(
                    WsEventType::CommandOutput,
                    None,
                    serde_json::json!({"commandId": command_id, "stream": "stderr", "line": line}),
                ),
            );
        }
    });

    let status = child.wait().await;
    let _ = out_task.await;
    let _ = err_task.await;
    let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
    emit(
        WsEventType::CommandStatus,
        serde_json::json!({
            "commandId": command_id,
            "status": if exit_code == 0 { "completed" } else { "failed" },
            "exitCode": exit_code,
        }),
    );
}

// ── Automation handlers ──────────────────────────────────────────────

async fn list_automations(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
) -> ApiResult<Response> {
    let automations = state
        .db
        .call(move |db| {
            Ok(db
                .list_enabled_automations()?
                .into_iter()
                .filter(|a| a.project_id == project_id)
                .collect::<Vec<_>>())
        })
        .await?;
    Ok(Json(automations).into_response())
}

#[derive(Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

async fn set_automation_enabled(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(body): Json<SetEnabledRequest>,
) -> ApiResult<Response> {
    let enabled = body.enabled;
    state
        .db
        .call(move |db| {
            db.get_automation(id)?
                .ok_or_else(|| Error::NotFound(format!("automation {}", id)))?;
            db.set_automation_enabled(id, enabled)
        })
        .await?;
    Ok(Json(serde_json::json!({"id": id, "enabled": enabled})).into_response())
}

async fn list_automation_runs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let runs = state
        .db
        .call(move |db| {
            db.get_automation(id)?
                .ok_or_else(|| Error::NotFound(format!("automation {}", id)))?;
            db.list_automation_runs(id)
        })
        .await?;
    Ok(Json(runs).into_response())
}

async fn create_automation(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Json(body): Json<CreateAutomationRequest>,
) -> ApiResult<Response> {
    automation::validate_cron(&body.cron_expression)?;
    state
        .db
        .call(move |db| db.get_project(project_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

    let created = state
        .db
        .call(move |db| {
            db.create_automation(
                project_id,
                &body.name,
                &body.prompt,
                &body.cron_expression,
                body.max_runs.unwrap_or(20),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}
