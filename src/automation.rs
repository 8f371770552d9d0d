//! Scheduled automations: cron-expression prompts per project.
//!
//! A 30 s tick evaluates every enabled automation's cron expression
//! against its last run. A due automation gets a fresh thread and an
//! agent run with the stored prompt; run history is capped per
//! automation. Completion is observed by polling the thread to terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentOrchestrator, StartAgentParams};
use crate::errors::{Error, Result};
use crate::store::{Automation, DbHandle, NewThread, ThreadMode};
use crate::ws::{WsBroker, WsEvent, WsEventType};

const TICK: Duration = Duration::from_secs(30);

/// How long a watcher will wait for an automation thread to finish.
const RUN_DEADLINE: Duration = Duration::from_secs(3600);

/// Validate a cron expression at automation-creation time.
pub fn validate_cron(expression: &str) -> Result<()> {
    Cron::from_str(expression)
        .map(|_| ())
        .map_err(|e| Error::BadRequest(format!("invalid cron expression '{}': {}", expression, e)))
}

/// Whether the automation's schedule has fired between its last run (or
/// creation) and `now`.
pub fn is_due(automation: &Automation, now: DateTime<Utc>) -> bool {
    let cron = match Cron::from_str(&automation.cron_expression) {
        Ok(cron) => cron,
        Err(_) => return false,
    };
    let anchor = automation
        .last_run_at
        .as_deref()
        .or(Some(automation.created_at.as_str()))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let Some(anchor) = anchor else { return false };
    match cron.find_next_occurrence(&anchor, false) {
        Ok(next) => next <= now,
        Err(_) => false,
    }
}

pub struct AutomationScheduler {
    db: DbHandle,
    orchestrator: Arc<AgentOrchestrator>,
    broker: WsBroker,
}

impl AutomationScheduler {
    pub fn new(db: DbHandle, orchestrator: Arc<AgentOrchestrator>, broker: WsBroker) -> Arc<Self> {
        Arc::new(Self {
            db,
            orchestrator,
            broker,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.run_due(Utc::now()).await {
                        warn!(error = %err, "automation sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: trigger every enabled automation whose schedule fired.
    pub async fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize> {
        let automations = self.db.call(|db| db.list_enabled_automations()).await?;
        let mut triggered = 0;
        for automation in automations {
            if !is_due(&automation, now) {
                continue;
            }
            if let Err(err) = self.trigger(&automation).await {
                warn!(automation = automation.id, error = %err, "automation trigger failed");
                continue;
            }
            triggered += 1;
        }
        Ok(triggered)
    }

    /// Create the run's thread and launch the agent.
    pub async fn trigger(self: &Arc<Self>, automation: &Automation) -> Result<()> {
        let project_id = automation.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;

        let automation_id = automation.id;
        let title = format!("{} @ {}", automation.name, Utc::now().format("%Y-%m-%d %H:%M"));
        let thread = {
            let title = title.clone();
            self.db
                .call(move |db| {
                    let mut new = NewThread::basic(project_id, &title, "claude");
                    new.mode = ThreadMode::Local;
                    new.automation_id = Some(automation_id);
                    db.create_thread(&new)
                })
                .await?
        };
        let thread_id = thread.id;

        let max_runs = automation.max_runs;
        let run_id = self
            .db
            .call(move |db| {
                let run_id = db.insert_automation_run(automation_id, thread_id)?;
                db.set_automation_last_run(automation_id)?;
                db.prune_automation_runs(automation_id, max_runs)?;
                Ok(run_id)
            })
            .await?;

        info!(automation = automation_id, thread_id, "automation run starting");
        self.broker.emit(&WsEvent::for_thread(
            WsEventType::AutomationRunStarted,
            thread_id,
            serde_json::json!({"automationId": automation_id, "runId": run_id}),
        ));

        self.orchestrator
            .start_agent(StartAgentParams::new(
                thread_id,
                &automation.prompt,
                PathBuf::from(&project.path),
                "claude",
            ))
            .await?;

        // Watch for terminal status in the background.
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.watch_run(automation_id, run_id, thread_id).await;
        });
        Ok(())
    }

    async fn watch_run(&self, automation_id: i64, run_id: i64, thread_id: i64) {
        let started = tokio::time::Instant::now();
        let status = loop {
            if started.elapsed() > RUN_DEADLINE {
                break "failed";
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            let thread = self
                .db
                .call(move |db| db.get_thread(thread_id))
                .await
                .ok()
                .flatten();
            match thread {
                Some(t) if t.status.is_terminal() => {
                    break if t.status == crate::store::ThreadStatus::Completed {
                        "completed"
                    } else {
                        "failed"
                    };
                }
                Some(_) => continue,
                None => break "failed",
            }
        };

        if let Err(err) = self
            .db
            .call(move |db| db.complete_automation_run(run_id, status))
            .await
        {
            warn!(run_id, error = %err, "failed to record automation run outcome");
        }
        self.broker.emit(&WsEvent::for_thread(
            WsEventType::AutomationRunCompleted,
            thread_id,
            serde_json::json!({"automationId": automation_id, "runId": run_id, "status": status}),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automation(cron: &str, last_run_at: Option<&str>, created_at: &str) -> Automation {
        Automation {
            id: 1,
            project_id: 1,
            name: "nightly".into(),
            prompt: "run the suite".into(),
            cron_expression: cron.into(),
            enabled: true,
            max_runs: 20,
            last_run_at: last_run_at.map(|s| s.to_string()),
            created_at: created_at.into(),
        }
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn cron_validation_accepts_and_rejects() {
        assert!(validate_cron("0 2 * * *").is_ok());
        assert!(validate_cron("*/5 * * * *").is_ok());
        assert!(matches!(
            validate_cron("not a cron").unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[test]
    fn due_when_schedule_fired_since_last_run() {
        // Daily at 02:00, last ran yesterday 02:00, now past today 02:00.
        let a = automation(
            "0 2 * * *",
            Some("2026-03-01T02:00:00+00:00"),
            "2026-01-01T00:00:00+00:00",
        );
        assert!(is_due(&a, at("2026-03-02T02:00:05+00:00")));
        assert!(!is_due(&a, at("2026-03-01T23:59:00+00:00")));
    }

    #[test]
    fn never_run_automation_anchors_on_creation() {
        let a = automation("0 2 * * *", None, "2026-03-01T00:00:00+00:00");
        assert!(is_due(&a, at("2026-03-01T02:00:01+00:00")));
        assert!(!is_due(&a, at("2026-03-01T01:59:00+00:00")));
    }

    #[test]
    fn invalid_expression_is_never_due() {
        let a = automation("banana", None, "2026-03-01T00:00:00+00:00");
        assert!(!is_due(&a, at("2026-03-02T00:00:00+00:00")));
    }
}
