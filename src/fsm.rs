//! Table-driven state machines for pipeline status and branch lifecycle.
//!
//! A machine is a map from state to its valid successors plus a current
//! state. Invalid transitions surface as `Error::Transition` carrying
//! `(from, to, label)`; they are domain errors, not panics.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result, TransitionError};

pub struct StateMachine<S> {
    transitions: HashMap<S, Vec<S>>,
    state: S,
    label: &'static str,
}

impl<S: Copy + Eq + Hash + Display> StateMachine<S> {
    pub fn new(transitions: HashMap<S, Vec<S>>, initial: S, label: &'static str) -> Self {
        Self {
            transitions,
            state: initial,
            label,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// True iff `to` is listed as a successor of the current state.
    pub fn can_transition(&self, to: S) -> bool {
        self.transitions
            .get(&self.state)
            .map(|succ| succ.contains(&to))
            .unwrap_or(false)
    }

    /// Move to `to`, or fail with a `TransitionError` naming both states.
    pub fn transition(&mut self, to: S) -> Result<()> {
        if !self.can_transition(to) {
            return Err(Error::Transition(TransitionError {
                from: self.state.to_string(),
                to: to.to_string(),
                label: self.label.to_string(),
            }));
        }
        self.state = to;
        Ok(())
    }

    /// Like [`Self::transition`] but returns whether the move happened
    /// instead of an error. Used where an invalid move is expected flow.
    pub fn try_transition(&mut self, to: S) -> bool {
        if self.can_transition(to) {
            self.state = to;
            true
        } else {
            false
        }
    }
}

// ── Pipeline status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Accepted,
    Running,
    Correcting,
    Approved,
    Failed,
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Correcting => "correcting",
            Self::Approved => "approved",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Failed | Self::Error)
    }
}

impl Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `accepted → running → (correcting ↔ running) → approved | failed | error`
pub fn pipeline_machine() -> StateMachine<PipelineStatus> {
    use PipelineStatus::*;
    let transitions = HashMap::from([
        (Accepted, vec![Running]),
        (Running, vec![Correcting, Approved, Failed, Error]),
        (Correcting, vec![Running]),
        (Approved, vec![]),
        (Failed, vec![]),
        (Error, vec![]),
    ]);
    StateMachine::new(transitions, Accepted, "pipeline")
}

// ── Branch lifecycle ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Running,
    Ready,
    PendingMerge,
    MergeHistory,
    Removed,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready => "ready",
            Self::PendingMerge => "pending_merge",
            Self::MergeHistory => "merge_history",
            Self::Removed => "removed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MergeHistory | Self::Removed)
    }
}

impl Display for BranchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Branch lifecycle; `pending_merge → pending_merge` is the rebase self-loop.
pub fn branch_machine() -> StateMachine<BranchState> {
    branch_machine_at(BranchState::Running)
}

/// Branch machine resumed at a persisted state (director reload).
pub fn branch_machine_at(initial: BranchState) -> StateMachine<BranchState> {
    use BranchState::*;
    let transitions = HashMap::from([
        (Running, vec![Ready, Removed]),
        (Ready, vec![PendingMerge]),
        (PendingMerge, vec![MergeHistory, Ready, PendingMerge]),
        (MergeHistory, vec![]),
        (Removed, vec![]),
    ]);
    StateMachine::new(transitions, initial, "branch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_happy_path_with_correction_cycle() {
        let mut m = pipeline_machine();
        assert_eq!(m.state(), PipelineStatus::Accepted);
        m.transition(PipelineStatus::Running).unwrap();
        m.transition(PipelineStatus::Correcting).unwrap();
        m.transition(PipelineStatus::Running).unwrap();
        m.transition(PipelineStatus::Approved).unwrap();
        assert!(m.state().is_terminal());
    }

    #[test]
    fn pipeline_cannot_skip_running() {
        let mut m = pipeline_machine();
        let err = m.transition(PipelineStatus::Approved).unwrap_err();
        match err {
            Error::Transition(t) => {
                assert_eq!(t.from, "accepted");
                assert_eq!(t.to, "approved");
                assert_eq!(t.label, "pipeline");
            }
            other => panic!("Expected Transition, got {:?}", other),
        }
        // State unchanged after a rejected transition.
        assert_eq!(m.state(), PipelineStatus::Accepted);
    }

    #[test]
    fn pipeline_terminal_states_reject_everything() {
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
                assert!(!m.can_transition(target));
                assert!(m.transition(target).is_err());
            }
        }
    }

    #[test]
    fn can_transition_is_the_truth_value_of_membership() {
        let m = pipeline_machine();
        assert!(m.can_transition(PipelineStatus::Running));
        assert!(!m.can_transition(PipelineStatus::Correcting));
        assert!(!m.can_transition(PipelineStatus::Failed));
    }

    #[test]
    fn machines_carry_their_labels() {
        assert_eq!(pipeline_machine().label(), "pipeline");
        assert_eq!(branch_machine().label(), "branch");
    }

    #[test]
    fn try_transition_reports_without_erroring() {
        let mut m = pipeline_machine();
        assert!(!m.try_transition(PipelineStatus::Approved));
        assert!(m.try_transition(PipelineStatus::Running));
        assert_eq!(m.state(), PipelineStatus::Running);
    }

    #[test]
    fn branch_lifecycle_to_merge_history() {
        let mut m = branch_machine();
        m.transition(BranchState::Ready).unwrap();
        m.transition(BranchState::PendingMerge).unwrap();
        m.transition(BranchState::MergeHistory).unwrap();
        assert!(m.state().is_terminal());
        assert!(m.transition(BranchState::Ready).is_err());
    }

    #[test]
    fn branch_pending_merge_self_loop_is_valid() {
        let mut m = branch_machine();
        m.transition(BranchState::Ready).unwrap();
        m.transition(BranchState::PendingMerge).unwrap();
        // Rebase retry keeps the branch in pending_merge.
        m.transition(BranchState::PendingMerge).unwrap();
        // Conflict exhaustion hands it back for human attention.
        m.transition(BranchState::Ready).unwrap();
        assert_eq!(m.state(), BranchState::Ready);
    }

    #[test]
    fn branch_removed_is_terminal() {
        let mut m = branch_machine();
        m.transition(BranchState::Removed).unwrap();
        assert!(m.transition(BranchState::Ready).is_err());
    }
}
