//! Server assembly: construct the process-wide services, wire the
//! router, and run with graceful shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState, UserQuery};
use crate::agent::AgentOrchestrator;
use crate::automation::AutomationScheduler;
use crate::config::PipelineConfig;
use crate::events::adapters::DeliveryService;
use crate::events::{DeadLetterQueue, EventBus};
use crate::gitops::{GitIdentity, GitService};
use crate::guard::IdempotencyGuard;
use crate::pipeline::director::AgentConflictResolver;
use crate::pipeline::runner::SandboxAgentExec;
use crate::pipeline::{Director, Manifest, PipelineRunner};
use crate::process::{DEFAULT_POOL_SIZE, ProcessRunner};
use crate::sandbox::SandboxManager;
use crate::store::{DbHandle, Store};
use crate::ws::WsBroker;

const SANDBOX_IMAGE: &str = "foreman-sandbox:latest";

pub struct ServerConfig {
    pub port: u16,
    pub project_path: PathBuf,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3002,
            project_path: PathBuf::from("."),
            db_path: PathBuf::from(".foreman/threads.db"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(user): Query<UserQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| async move {
        broker.run_connection(socket, user.user).await;
    })
}

/// Host path of the agent SDK mounted into sandboxes.
fn host_sdk_path() -> PathBuf {
    if let Ok(path) = std::env::var("FOREMAN_SDK_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".local/share/claude-sdk")
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let project_path = config
        .project_path
        .canonicalize()
        .with_context(|| format!("invalid project path {}", config.project_path.display()))?;
    let pipeline_config = PipelineConfig::load(&project_path);
    info!(
        project = %project_path.display(),
        configured_log_level = %pipeline_config.logging.level,
        "loaded pipeline config"
    );

    let store = Store::open(&config.db_path).context("failed to open thread store")?;
    let db = DbHandle::new(store);
    let broker = WsBroker::new();
    let runner = Arc::new(ProcessRunner::new(DEFAULT_POOL_SIZE));
    let git = Arc::new(GitService::new(Arc::clone(&runner)));

    // Delivery plumbing: bus → adapters, failures → DLQ with backoff.
    let bus = Arc::new(EventBus::new(project_path.join(&pipeline_config.events.dir)));
    let dlq = Arc::new(DeadLetterQueue::new(
        project_path.join(&pipeline_config.resilience.dlq.path),
        pipeline_config.resilience.dlq.clone(),
    ));
    let delivery = Arc::new(DeliveryService::new(
        &pipeline_config.adapters,
        Arc::clone(&dlq),
        Duration::from_millis(pipeline_config.resilience.dlq.base_delay_ms),
    ));
    tokio::spawn(Arc::clone(&delivery).run(Arc::clone(&bus)));

    // Sandbox + pipeline pathway.
    let sandbox = Arc::new(SandboxManager::new(
        Arc::clone(&runner),
        Arc::clone(&git),
        SANDBOX_IMAGE,
        host_sdk_path(),
    ));
    // Leftover containers from a previous process die at startup; a host
    // without podman just skips the sweep.
    match sandbox.kill_orphans().await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "removed orphaned sandbox containers"),
        Err(err) => warn!(error = %err, "orphan sweep skipped"),
    }

    let mut agent_env = HashMap::new();
    for key in ["ANTHROPIC_API_KEY", "GITHUB_TOKEN", "CLAUDE_CODE_OAUTH_TOKEN"] {
        if let Ok(value) = std::env::var(key) {
            agent_env.insert(key.to_string(), value);
        }
    }
    let exec = Arc::new(SandboxAgentExec::new(
        Arc::clone(&sandbox),
        Arc::clone(&git),
        Arc::clone(&bus),
        agent_env,
    ));
    let manifest = Arc::new(Manifest::new(project_path.join(".pipeline/manifest.json")));
    let pipeline = PipelineRunner::new(
        Arc::new(IdempotencyGuard::new()),
        Arc::clone(&bus),
        exec,
        Arc::clone(&manifest),
        pipeline_config.clone(),
    );

    let orchestrator = AgentOrchestrator::new(db.clone(), broker.clone(), Arc::clone(&git));

    let shutdown = CancellationToken::new();

    if pipeline_config.director.interval_seconds > 0 {
        let director = Director::new(
            Arc::clone(&git),
            Arc::clone(&manifest),
            Arc::clone(&bus),
            Arc::new(AgentConflictResolver::new(Arc::clone(&runner))),
            pipeline_config.clone(),
            project_path.clone(),
            GitIdentity::default(),
        );
        tokio::spawn(director.run(shutdown.clone()));
        info!(
            interval = pipeline_config.director.interval_seconds,
            "director loop enabled"
        );
    }

    let scheduler = AutomationScheduler::new(db.clone(), Arc::clone(&orchestrator), broker.clone());
    tokio::spawn(scheduler.run(shutdown.clone()));

    let state = Arc::new(AppState {
        db,
        broker,
        orchestrator: Arc::clone(&orchestrator),
        pipeline,
        bus,
        git,
        project_path,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "foreman listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown.cancel();
    orchestrator.stop_all().await;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let broker = WsBroker::new();
        let runner = Arc::new(ProcessRunner::new(DEFAULT_POOL_SIZE));
        let git = Arc::new(GitService::new(Arc::clone(&runner)));
        let tmp = std::env::temp_dir().join(format!("foreman-test-{}", uuid::Uuid::new_v4()));
        let bus = Arc::new(EventBus::new(tmp.join("events")));
        let sandbox = Arc::new(SandboxManager::new(
            Arc::clone(&runner),
            Arc::clone(&git),
            SANDBOX_IMAGE,
            tmp.join("sdk"),
        ));
        let exec = Arc::new(SandboxAgentExec::new(
            sandbox,
            Arc::clone(&git),
            Arc::clone(&bus),
            HashMap::new(),
        ));
        let pipeline = PipelineRunner::new(
            Arc::new(IdempotencyGuard::new()),
            Arc::clone(&bus),
            exec,
            Arc::new(Manifest::new(tmp.join("manifest.json"))),
            PipelineConfig::default(),
        );
        let orchestrator = AgentOrchestrator::new(db.clone(), broker.clone(), Arc::clone(&git));
        Arc::new(AppState {
            db,
            broker,
            orchestrator,
            pipeline,
            bus,
            git,
            project_path: std::env::temp_dir(),
        })
    }

    fn test_router() -> Router {
        build_router(test_state())
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = test_router();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_pipeline_is_404_with_kind() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/pipeline/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn run_pipeline_validates_worktree() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pipeline/run")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "branch": "feature/x",
                            "worktree_path": "/definitely/not/here"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_pipeline_rejects_non_git_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/pipeline/run")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "branch": "feature/x",
                            "worktree_path": dir.path().to_str().unwrap(),
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].as_str().unwrap().contains("git repository"));
    }

    #[tokio::test]
    async fn project_crud_via_router() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state();

        let resp = build_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "name": "demo",
                            "path": dir.path().to_str().unwrap(),
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let project: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(project["name"], "demo");

        // Duplicate name conflicts.
        let resp = build_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "name": "demo",
                            "path": dir.path().to_str().unwrap(),
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn thread_creation_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state();
        let project = state
            .db
            .call({
                let path = dir.path().to_str().unwrap().to_string();
                move |db| {
                    db.create_project("p", &path, crate::store::FollowUpMode::Queue)
                }
            })
            .await
            .unwrap();

        let resp = build_router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/projects/{}/threads", project.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"title": "Fix login"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = build_router(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/projects/{}/threads", project.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let threads: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(threads.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn automation_requires_valid_cron() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state();
        let project = state
            .db
            .call({
                let path = dir.path().to_str().unwrap().to_string();
                move |db| {
                    db.create_project("p", &path, crate::store::FollowUpMode::Queue)
                }
            })
            .await
            .unwrap();

        let resp = build_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/projects/{}/automations", project.id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "name": "bad",
                            "prompt": "x",
                            "cron_expression": "not cron",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3002);
        assert_eq!(config.db_path, PathBuf::from(".foreman/threads.db"));
        assert!(!config.dev_mode);
    }
}
