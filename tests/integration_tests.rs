//! Cross-module scenarios: DLQ retry behavior, config fallback, state
//! machine cycles, pipeline idempotency, and event replay ordering.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use foreman::config::{AgentSpec, DlqConfig, PipelineConfig};
use foreman::errors::Error;
use foreman::events::{DeadLetterQueue, EventBus, PipelineEvent};
use foreman::fsm::{BranchState, PipelineStatus, branch_machine, pipeline_machine};
use foreman::guard::IdempotencyGuard;
use foreman::pipeline::runner::AgentExec;
use foreman::pipeline::{Manifest, PipelineRequest, PipelineRunner, SubmitOutcome};

fn sample_event(request_id: &str) -> PipelineEvent {
    PipelineEvent::now(request_id, "pipeline.completed", serde_json::json!({"ok": true}))
}

// ── S1: DLQ backoff ──────────────────────────────────────────────────

#[tokio::test]
async fn dlq_backoff_then_delivery_on_third_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = DeadLetterQueue::new(
        dir.path().to_path_buf(),
        DlqConfig {
            enabled: true,
            path: PathBuf::new(),
            max_retries: 5,
            base_delay_ms: 100,
            backoff_factor: 2.0,
        },
    );

    let enqueued_at = Utc::now();
    dlq.enqueue("hook", sample_event("req-1"), "connection refused")
        .await
        .unwrap();

    // First retry fails: retry_count=1, next_retry_at at least
    // base_delay past enqueue.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stats = dlq
        .process_retries("hook", |_| async { Err(Error::Internal("down".into())) })
        .await
        .unwrap();
    assert_eq!((stats.delivered, stats.failed, stats.exhausted), (0, 1, 0));

    let entry = &dlq.pending("hook").await.unwrap()[0];
    assert_eq!(entry.retry_count, 1);
    assert!(entry.next_retry_at >= enqueued_at + chrono::Duration::milliseconds(100));
    assert!(entry.last_error.is_some());

    // Second attempt fails, third succeeds and removes the file.
    let attempts = Arc::new(AtomicU32::new(1));
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let attempts = Arc::clone(&attempts);
        let stats = dlq
            .process_retries("hook", move |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Internal("still down".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        if stats.delivered == 1 {
            assert_eq!((stats.failed, stats.exhausted), (0, 0));
        }
    }
    assert!(dlq.pending("hook").await.unwrap().is_empty());
    assert!(!dir.path().join("hook/req-1.jsonl").exists());
}

// ── S2: DLQ exhaustion ───────────────────────────────────────────────

#[tokio::test]
async fn dlq_exhausted_entry_never_reaches_deliver() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = DeadLetterQueue::new(
        dir.path().to_path_buf(),
        DlqConfig {
            enabled: true,
            path: PathBuf::new(),
            max_retries: 2,
            base_delay_ms: 1,
            backoff_factor: 2.0,
        },
    );

    // Pre-seed a file that already burned its retries.
    let entry = serde_json::json!({
        "event": sample_event("req-1"),
        "error": "down",
        "enqueued_at": Utc::now() - chrono::Duration::seconds(60),
        "retry_count": 2,
        "next_retry_at": Utc::now() - chrono::Duration::seconds(1),
        "last_error": "down",
    });
    std::fs::create_dir_all(dir.path().join("hook")).unwrap();
    std::fs::write(dir.path().join("hook/req-1.jsonl"), entry.to_string()).unwrap();

    let called = Arc::new(AtomicU32::new(0));
    let called_in = Arc::clone(&called);
    let stats = dlq
        .process_retries("hook", move |_| {
            called_in.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!((stats.delivered, stats.failed, stats.exhausted), (0, 0, 1));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("hook/req-1.jsonl").exists());
}

// ── S3: pipeline state machine ───────────────────────────────────────

#[test]
fn pipeline_machine_full_cycle_and_rejections() {
    let mut m = pipeline_machine();
    m.transition(PipelineStatus::Running).unwrap();
    m.transition(PipelineStatus::Correcting).unwrap();
    m.transition(PipelineStatus::Running).unwrap();
    m.transition(PipelineStatus::Approved).unwrap();

    let mut skip = pipeline_machine();
    let err = skip.transition(PipelineStatus::Approved).unwrap_err();
    assert!(matches!(err, Error::Transition(_)));

    for terminal in [
        PipelineStatus::Approved,
        PipelineStatus::Failed,
        PipelineStatus::Error,
    ] {
        let mut m = pipeline_machine();
        m.transition(PipelineStatus::Running).unwrap();
        m.transition(terminal).unwrap();
        for target in [
            PipelineStatus::Accepted,
            PipelineStatus::Running,
            PipelineStatus::Correcting,
            PipelineStatus::Approved,
            PipelineStatus::Failed,
            PipelineStatus::Error,
        ] {
            assert!(m.transition(target).is_err());
        }
    }
}

// ── S4: config fallback ──────────────────────────────────────────────

#[test]
fn invalid_config_reverts_and_env_substitution_applies() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline_dir = dir.path().join(".pipeline");
    std::fs::create_dir_all(&pipeline_dir).unwrap();
    std::fs::write(
        pipeline_dir.join("config.yaml"),
        "tiers:\n  small:\n    max_files: 0\n    max_lines: -1\n    agents: []\n",
    )
    .unwrap();

    let config = PipelineConfig::load(dir.path());
    assert_eq!(config.tiers["small"].max_files, 3);
    assert_eq!(config.tiers["small"].max_lines, 50);
    assert_eq!(config.tiers["small"].agents, vec!["tests", "style"]);

    // ${UNSET} substitutes to empty before validation.
    // SAFETY: test-only env mutation.
    unsafe { std::env::remove_var("FOREMAN_ITEST_UNSET") };
    std::fs::write(
        pipeline_dir.join("config.yaml"),
        "branch:\n  pipeline_prefix: \"${FOREMAN_ITEST_UNSET}prefix/\"\n",
    )
    .unwrap();
    let config = PipelineConfig::load(dir.path());
    assert_eq!(config.branch.pipeline_prefix, "prefix/");
}

// ── S5: pipeline idempotency ─────────────────────────────────────────

struct InstantPass;

#[async_trait]
impl AgentExec for InstantPass {
    async fn measure_change(&self, _r: &PipelineRequest) -> foreman::errors::Result<(i64, i64)> {
        Ok((1, 1))
    }
    async fn prepare(&self, _r: &PipelineRequest) -> foreman::errors::Result<()> {
        Ok(())
    }
    async fn run_agent(
        &self,
        _r: &PipelineRequest,
        _a: &str,
        _s: &AgentSpec,
        _c: &CancellationToken,
    ) -> foreman::errors::Result<bool> {
        Ok(true)
    }
    async fn cleanup(&self, _r: &PipelineRequest) -> foreman::errors::Result<()> {
        Ok(())
    }
}

struct BlockUntilCancelled;

#[async_trait]
impl AgentExec for BlockUntilCancelled {
    async fn measure_change(&self, _r: &PipelineRequest) -> foreman::errors::Result<(i64, i64)> {
        Ok((1, 1))
    }
    async fn prepare(&self, _r: &PipelineRequest) -> foreman::errors::Result<()> {
        Ok(())
    }
    async fn run_agent(
        &self,
        _r: &PipelineRequest,
        _a: &str,
        _s: &AgentSpec,
        cancel: &CancellationToken,
    ) -> foreman::errors::Result<bool> {
        cancel.cancelled().await;
        Err(Error::Internal("cancelled".into()))
    }
    async fn cleanup(&self, _r: &PipelineRequest) -> foreman::errors::Result<()> {
        Ok(())
    }
}

fn pipeline_request(id: &str, branch: &str) -> PipelineRequest {
    PipelineRequest {
        request_id: id.into(),
        branch: branch.into(),
        worktree_path: PathBuf::from("/tmp/wt"),
        base_branch: "main".into(),
        metadata: serde_json::json!({}),
        config: None,
    }
}

async fn wait_terminal(runner: &Arc<PipelineRunner>, id: &str) {
    for _ in 0..200 {
        if let Some(s) = runner.status(id).await
            && s.status.is_terminal()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pipeline {} never terminated", id);
}

#[tokio::test]
async fn concurrent_runs_on_one_branch_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let runner = PipelineRunner::new(
        Arc::new(IdempotencyGuard::new()),
        Arc::new(EventBus::new(dir.path().join("events"))),
        Arc::new(BlockUntilCancelled),
        Arc::new(Manifest::new(dir.path().join("manifest.json"))),
        PipelineConfig::default(),
    );

    let first = runner
        .submit(pipeline_request("req-1", "feature/x"))
        .await
        .unwrap();
    assert!(matches!(first, SubmitOutcome::Accepted { .. }));

    // Concurrent duplicates all get the incumbent's id.
    let mut handles = Vec::new();
    for i in 2..8 {
        let runner = Arc::clone(&runner);
        handles.push(tokio::spawn(async move {
            runner
                .submit(pipeline_request(&format!("req-{}", i), "feature/x"))
                .await
        }));
    }
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            SubmitOutcome::AlreadyRunning { request_id } => assert_eq!(request_id, "req-1"),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    runner.stop("req-1").await.unwrap();
    wait_terminal(&runner, "req-1").await;

    // After terminal state is purged, a fresh run is admitted.
    assert!(runner.purge("req-1").await);
    let fresh = runner
        .submit(pipeline_request("req-9", "feature/x"))
        .await
        .unwrap();
    assert_eq!(
        fresh,
        SubmitOutcome::Accepted { request_id: "req-9".into() }
    );
}

#[tokio::test]
async fn stale_reservation_self_heals_on_submit() {
    let dir = tempfile::tempdir().unwrap();
    let guard = Arc::new(IdempotencyGuard::new());
    guard.register("feature/x", "req-from-before-the-crash");

    let runner = PipelineRunner::new(
        Arc::clone(&guard),
        Arc::new(EventBus::new(dir.path().join("events"))),
        Arc::new(InstantPass),
        Arc::new(Manifest::new(dir.path().join("manifest.json"))),
        PipelineConfig::default(),
    );

    let outcome = runner
        .submit(pipeline_request("req-new", "feature/x"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Accepted { request_id: "req-new".into() }
    );
    wait_terminal(&runner, "req-new").await;
}

// ── S6: branch lifecycle ─────────────────────────────────────────────

#[test]
fn branch_lifecycle_paths() {
    let mut m = branch_machine();
    m.transition(BranchState::Ready).unwrap();
    m.transition(BranchState::PendingMerge).unwrap();
    // Rebase self-loop.
    m.transition(BranchState::PendingMerge).unwrap();
    m.transition(BranchState::MergeHistory).unwrap();
    assert!(m.transition(BranchState::Ready).is_err());

    let mut removed = branch_machine();
    removed.transition(BranchState::Removed).unwrap();
    assert!(removed.transition(BranchState::Ready).is_err());
}

// ── Event replay ordering ────────────────────────────────────────────

#[tokio::test]
async fn late_subscriber_observes_exact_append_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new(dir.path().to_path_buf()));

    for i in 0..5 {
        bus.publish(PipelineEvent::now(
            "req-1",
            &format!("event.{}", i),
            serde_json::json!({"i": i}),
        ))
        .await
        .unwrap();
    }

    let (historical, mut live) = bus.subscribe("req-1").await.unwrap();
    for i in 5..8 {
        bus.publish(PipelineEvent::now(
            "req-1",
            &format!("event.{}", i),
            serde_json::json!({"i": i}),
        ))
        .await
        .unwrap();
    }

    let mut observed: Vec<String> = historical.into_iter().map(|e| e.event_type).collect();
    while observed.len() < 8 {
        let event = live.recv().await.unwrap();
        if event.request_id == "req-1" {
            observed.push(event.event_type);
        }
    }

    let expected: Vec<String> = (0..8).map(|i| format!("event.{}", i)).collect();
    assert_eq!(observed, expected);

    // And the on-disk order matches too.
    let replayed = bus.replay("req-1").await.unwrap();
    let file_order: Vec<String> = replayed.into_iter().map(|e| e.event_type).collect();
    assert_eq!(file_order, expected);
}
