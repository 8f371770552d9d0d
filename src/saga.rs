//! Linear saga with per-step compensation.
//!
//! Pipeline wire-up (create branch → create worktree → start sandbox →
//! spawn agent) acquires real resources at each step; when a later step
//! fails, every completed step's compensation runs in reverse order.
//! Compensations are best-effort: a failing compensation is logged and the
//! unwind continues.

use futures::future::BoxFuture;
use tracing::{error, info};

use crate::errors::{Error, Result};

type StepFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct SagaStep {
    name: String,
    action: StepFn,
    compensation: Option<StepFn>,
}

pub struct Saga {
    label: String,
    steps: Vec<SagaStep>,
}

/// Outcome of a failed saga: the failing step and its error, after unwind.
#[derive(Debug)]
pub struct SagaFailure {
    pub failed_step: String,
    pub error: Error,
    pub compensated: Vec<String>,
}

impl Saga {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step with no compensation.
    pub fn step<F>(self, name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.push(name.into(), Box::new(action), None)
    }

    /// Append a step whose compensation runs if a later step fails.
    pub fn step_compensated<F, C>(
        self,
        name: impl Into<String>,
        action: F,
        compensation: C,
    ) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        C: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.push(name.into(), Box::new(action), Some(Box::new(compensation)))
    }

    fn push(mut self, name: String, action: StepFn, compensation: Option<StepFn>) -> Self {
        self.steps.push(SagaStep {
            name,
            action,
            compensation,
        });
        self
    }

    /// Execute all steps in order. On the first failure, run the
    /// compensations of already-completed steps in reverse, then return the
    /// failure.
    pub async fn run(self) -> std::result::Result<(), SagaFailure> {
        let label = self.label;
        let mut completed: Vec<(String, Option<StepFn>)> = Vec::new();

        for step in self.steps {
            info!(saga = %label, step = %step.name, "saga step");
            match (step.action)().await {
                Ok(()) => completed.push((step.name, step.compensation)),
                Err(error) => {
                    error!(saga = %label, step = %step.name, error = %error, "saga step failed, unwinding");
                    let mut compensated = Vec::new();
                    for (name, compensation) in completed.into_iter().rev() {
                        let Some(compensation) = compensation else {
                            continue;
                        };
                        match compensation().await {
                            Ok(()) => compensated.push(name),
                            Err(comp_err) => {
                                // Best-effort: record and keep unwinding.
                                error!(
                                    saga = %label,
                                    step = %name,
                                    error = %comp_err,
                                    "compensation failed"
                                );
                                compensated.push(name);
                            }
                        }
                    }
                    return Err(SagaFailure {
                        failed_step: step.name,
                        error,
                        compensated,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(j: &Arc<Mutex<Vec<String>>>, entry: &str) {
        j.lock().unwrap().push(entry.to_string());
    }

    #[tokio::test]
    async fn all_steps_run_in_order_on_success() {
        let j = journal();
        let (j1, j2) = (Arc::clone(&j), Arc::clone(&j));
        let saga = Saga::new("test")
            .step("first", move || {
                Box::pin(async move {
                    record(&j1, "first");
                    Ok(())
                })
            })
            .step("second", move || {
                Box::pin(async move {
                    record(&j2, "second");
                    Ok(())
                })
            });
        saga.run().await.unwrap();
        assert_eq!(*j.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_unwinds_completed_steps_in_reverse() {
        let j = journal();
        let (a, ac, b, bc, f) = (
            Arc::clone(&j),
            Arc::clone(&j),
            Arc::clone(&j),
            Arc::clone(&j),
            Arc::clone(&j),
        );
        let saga = Saga::new("test")
            .step_compensated(
                "branch",
                move || {
                    Box::pin(async move {
                        record(&a, "branch");
                        Ok(())
                    })
                },
                move || {
                    Box::pin(async move {
                        record(&ac, "undo branch");
                        Ok(())
                    })
                },
            )
            .step_compensated(
                "worktree",
                move || {
                    Box::pin(async move {
                        record(&b, "worktree");
                        Ok(())
                    })
                },
                move || {
                    Box::pin(async move {
                        record(&bc, "undo worktree");
                        Ok(())
                    })
                },
            )
            .step("sandbox", move || {
                Box::pin(async move {
                    record(&f, "sandbox");
                    Err(Error::Internal("podman missing".into()))
                })
            });

        let failure = saga.run().await.unwrap_err();
        assert_eq!(failure.failed_step, "sandbox");
        assert_eq!(failure.compensated, vec!["worktree", "branch"]);
        assert_eq!(
            *j.lock().unwrap(),
            vec!["branch", "worktree", "sandbox", "undo worktree", "undo branch"]
        );
    }

    #[tokio::test]
    async fn failing_compensation_does_not_stop_the_unwind() {
        let j = journal();
        let (a, b, bc) = (Arc::clone(&j), Arc::clone(&j), Arc::clone(&j));
        let ac = Arc::clone(&j);
        let saga = Saga::new("test")
            .step_compensated(
                "a",
                move || {
                    Box::pin(async move {
                        record(&a, "a");
                        Ok(())
                    })
                },
                move || {
                    Box::pin(async move {
                        record(&ac, "undo a");
                        Ok(())
                    })
                },
            )
            .step_compensated(
                "b",
                move || {
                    Box::pin(async move {
                        record(&b, "b");
                        Ok(())
                    })
                },
                move || {
                    Box::pin(async move {
                        record(&bc, "undo b (fails)");
                        Err(Error::Internal("cleanup error".into()))
                    })
                },
            )
            .step("c", || {
                Box::pin(async { Err(Error::Internal("boom".into())) })
            });

        let failure = saga.run().await.unwrap_err();
        // Both compensations are attempted despite b's failing.
        assert_eq!(failure.compensated, vec!["b", "a"]);
        assert_eq!(
            *j.lock().unwrap(),
            vec!["a", "b", "undo b (fails)", "undo a"]
        );
    }

    #[tokio::test]
    async fn steps_after_the_failure_never_run() {
        let j = journal();
        let later = Arc::clone(&j);
        let saga = Saga::new("test")
            .step("fails", || {
                Box::pin(async { Err(Error::Internal("x".into())) })
            })
            .step("never", move || {
                Box::pin(async move {
                    record(&later, "never");
                    Ok(())
                })
            });
        let failure = saga.run().await.unwrap_err();
        assert_eq!(failure.failed_step, "fails");
        assert!(j.lock().unwrap().is_empty());
    }
}
