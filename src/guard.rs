//! Branch idempotency guard.
//!
//! A process-wide registry mapping branch name to the request currently
//! working on it. At most one active pipeline per branch; duplicate
//! submissions get the incumbent's request id back. Entries can go stale
//! after a crash, so callers that see a duplicate must cross-check the
//! live runner set and `release` when the incumbent is gone.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub is_duplicate: bool,
    pub existing_request_id: Option<String>,
}

#[derive(Default)]
pub struct IdempotencyGuard {
    // Single writer: every mutation goes through this lock.
    reservations: Mutex<HashMap<String, String>>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, branch: &str) -> GuardDecision {
        let map = self.reservations.lock().unwrap();
        match map.get(branch) {
            Some(request_id) => GuardDecision {
                is_duplicate: true,
                existing_request_id: Some(request_id.clone()),
            },
            None => GuardDecision {
                is_duplicate: false,
                existing_request_id: None,
            },
        }
    }

    /// Reserve `branch` for `request_id`. Returns false if another request
    /// already holds the reservation.
    pub fn register(&self, branch: &str, request_id: &str) -> bool {
        let mut map = self.reservations.lock().unwrap();
        if map.contains_key(branch) {
            return false;
        }
        map.insert(branch.to_string(), request_id.to_string());
        true
    }

    pub fn release(&self, branch: &str) -> Option<String> {
        self.reservations.lock().unwrap().remove(branch)
    }

    /// Atomically replace a stale reservation discovered by the caller's
    /// liveness cross-check. Succeeds only if the current holder still is
    /// `stale_request_id`, so two healers cannot both win.
    pub fn replace_stale(&self, branch: &str, stale_request_id: &str, request_id: &str) -> bool {
        let mut map = self.reservations.lock().unwrap();
        match map.get(branch) {
            Some(current) if current == stale_request_id => {
                map.insert(branch.to_string(), request_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Vec<(String, String)> {
        let map = self.reservations.lock().unwrap();
        map.iter().map(|(b, r)| (b.clone(), r.clone())).collect()
    }
}
