//! In-process pub/sub with append-only JSONL persistence per request.
//!
//! Every published event lands in `<dir>/<request_id>.jsonl` before it is
//! broadcast, and both happen under the request's write lock so a late
//! subscriber's `historical + live` view equals the append order exactly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEvent {
    pub event_type: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl PipelineEvent {
    pub fn now(request_id: &str, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

pub struct EventBus {
    dir: PathBuf,
    tx: broadcast::Sender<PipelineEvent>,
    /// Per-request write serialization; also guards snapshot+subscribe.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventBus {
    pub fn new(dir: PathBuf) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            dir,
            tx,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn file_lock(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(request_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn file_path(&self, request_id: &str) -> PathBuf {
        // Request ids are opaque but locally generated; strip separators
        // anyway so an id can never escape the events directory.
        let safe: String = request_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }

    /// Append to the request's JSONL file, then broadcast live.
    pub async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let lock = self.file_lock(&event.request_id).await;
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;
        let line = serde_json::to_string(&event)?;
        let path = self.file_path(&event.request_id);
        let mut contents = line;
        contents.push('\n');
        append(&path, &contents).await?;

        // Send errors just mean nobody is listening right now.
        let _ = self.tx.send(event);
        Ok(())
    }

    /// Replay the persisted events for a request in file order.
    pub async fn replay(&self, request_id: &str) -> Result<Vec<PipelineEvent>> {
        let lock = self.file_lock(request_id).await;
        let _guard = lock.lock().await;
        self.read_file(request_id).await
    }

    /// Historical snapshot plus a live receiver, atomically with respect to
    /// publishes for this request: nothing is lost or duplicated between
    /// the snapshot and the subscription.
    pub async fn subscribe(
        &self,
        request_id: &str,
    ) -> Result<(Vec<PipelineEvent>, broadcast::Receiver<PipelineEvent>)> {
        let lock = self.file_lock(request_id).await;
        let _guard = lock.lock().await;
        let historical = self.read_file(request_id).await?;
        let rx = self.tx.subscribe();
        Ok((historical, rx))
    }

    /// Live-only receiver for consumers that span requests (adapters, WS).
    pub fn subscribe_all(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    async fn read_file(&self, request_id: &str) -> Result<Vec<PipelineEvent>> {
        let path = self.file_path(request_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PipelineEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(request_id, error = %e, "skipping corrupt event line"),
            }
        }
        Ok(events)
    }

    /// Remove the persisted log for a request (terminal-state retention).
    pub async fn purge(&self, request_id: &str) -> Result<()> {
        let lock = self.file_lock(request_id).await;
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.file_path(request_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

async fn append(path: &PathBuf, contents: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(dir: &std::path::Path) -> EventBus {
        EventBus::new(dir.to_path_buf())
    }

    fn event(request_id: &str, event_type: &str) -> PipelineEvent {
        PipelineEvent::now(request_id, event_type, serde_json::json!({"k": event_type}))
    }

    #[tokio::test]
    async fn publish_appends_jsonl_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        for t in ["accepted", "started", "completed"] {
            bus.publish(event("req-1", t)).await.unwrap();
        }

        let raw = std::fs::read_to_string(dir.path().join("req-1.jsonl")).unwrap();
        let types: Vec<String> = raw
            .lines()
            .map(|l| {
                serde_json::from_str::<PipelineEvent>(l)
                    .unwrap()
                    .event_type
            })
            .collect();
        assert_eq!(types, vec!["accepted", "started", "completed"]);
    }

    #[tokio::test]
    async fn replay_returns_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.publish(event("req-2", "a")).await.unwrap();
        bus.publish(event("req-2", "b")).await.unwrap();
        bus.publish(event("req-other", "x")).await.unwrap();

        let events = bus.replay("req-2").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "a");
        assert_eq!(events[1].event_type, "b");
    }

    #[tokio::test]
    async fn replay_of_unknown_request_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(bus(dir.path()).replay("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_sees_history_then_live() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.publish(event("req-3", "one")).await.unwrap();
        bus.publish(event("req-3", "two")).await.unwrap();

        let (historical, mut rx) = bus.subscribe("req-3").await.unwrap();
        assert_eq!(historical.len(), 2);

        bus.publish(event("req-3", "three")).await.unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.event_type, "three");

        let observed: Vec<String> = historical
            .into_iter()
            .map(|e| e.event_type)
            .chain(std::iter::once(live.event_type))
            .collect();
        assert_eq!(observed, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.publish(event("req-4", "good")).await.unwrap();
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("req-4.jsonl"))
            .unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);
        bus.publish(event("req-4", "after")).await.unwrap();

        let events = bus.replay("req-4").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "after");
    }

    #[tokio::test]
    async fn purge_removes_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.publish(event("req-5", "x")).await.unwrap();
        bus.purge("req-5").await.unwrap();
        assert!(!dir.path().join("req-5.jsonl").exists());
        // Purging again is fine.
        bus.purge("req-5").await.unwrap();
    }

    #[tokio::test]
    async fn request_id_cannot_escape_events_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        bus.publish(event("../escape", "x")).await.unwrap();
        assert!(dir.path().join(".._escape.jsonl").exists());
    }
}
