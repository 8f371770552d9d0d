//! File-backed dead-letter queue for outbound deliveries.
//!
//! Layout: `<base>/<adapter>/<request_id>.jsonl`, one JSON object per file,
//! atomically replaced on every update (write to a temp file, then rename).
//! The file exists iff the entry is unresolved; delivery or exhaustion
//! deletes it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::bus::PipelineEvent;
use crate::config::DlqConfig;
use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub event: PipelineEvent,
    pub error: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub delivered: u32,
    pub failed: u32,
    pub exhausted: u32,
}

pub struct DeadLetterQueue {
    config: DlqConfig,
    base: PathBuf,
}

impl DeadLetterQueue {
    pub fn new(base: PathBuf, config: DlqConfig) -> Self {
        Self { config, base }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn adapter_dir(&self, adapter: &str) -> PathBuf {
        self.base.join(adapter)
    }

    fn entry_path(&self, adapter: &str, request_id: &str) -> PathBuf {
        self.adapter_dir(adapter).join(format!("{}.jsonl", request_id))
    }

    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let millis = self.config.base_delay_ms as f64
            * self.config.backoff_factor.powi(retry_count as i32);
        Duration::milliseconds(millis as i64)
    }

    /// Record a first delivery failure. No-op when the DLQ is disabled.
    pub async fn enqueue(
        &self,
        adapter: &str,
        event: PipelineEvent,
        error: &str,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Utc::now();
        let entry = DlqEntry {
            event,
            error: error.to_string(),
            enqueued_at: now,
            retry_count: 0,
            next_retry_at: now + Duration::milliseconds(self.config.base_delay_ms as i64),
            last_error: None,
        };
        let request_id = entry.event.request_id.clone();
        self.write_entry(adapter, &request_id, &entry).await?;
        info!(adapter, %request_id, "dead-lettered event");
        Ok(())
    }

    /// All unresolved entries for an adapter, in directory order.
    pub async fn pending(&self, adapter: &str) -> Result<Vec<DlqEntry>> {
        let mut entries = Vec::new();
        for path in self.entry_files(adapter).await? {
            if let Some(entry) = read_entry(&path).await {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Retry every due entry, one file at a time.
    ///
    /// An entry that has already burned `max_retries` attempts is deleted
    /// without invoking `deliver` again. A successful delivery deletes the
    /// file; a failure bumps the retry count and pushes `next_retry_at`
    /// out by `base_delay × backoff_factor ^ retry_count`.
    pub async fn process_retries<F, Fut>(&self, adapter: &str, mut deliver: F) -> Result<RetryStats>
    where
        F: FnMut(PipelineEvent) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut stats = RetryStats::default();
        if !self.config.enabled {
            return Ok(stats);
        }

        let now = Utc::now();
        for path in self.entry_files(adapter).await? {
            let Some(mut entry) = read_entry(&path).await else {
                continue;
            };
            if entry.next_retry_at > now {
                continue;
            }

            if entry.retry_count >= self.config.max_retries {
                tokio::fs::remove_file(&path).await.ok();
                stats.exhausted += 1;
                warn!(
                    adapter,
                    request_id = %entry.event.request_id,
                    retries = entry.retry_count,
                    "dead-letter entry exhausted"
                );
                continue;
            }

            match deliver(entry.event.clone()).await {
                Ok(()) => {
                    tokio::fs::remove_file(&path).await.ok();
                    stats.delivered += 1;
                }
                Err(err) => {
                    entry.retry_count += 1;
                    entry.next_retry_at = Utc::now() + self.backoff_delay(entry.retry_count);
                    entry.last_error = Some(err.to_string());
                    let request_id = entry.event.request_id.clone();
                    self.write_entry(adapter, &request_id, &entry).await?;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn entry_files(&self, adapter: &str) -> Result<Vec<PathBuf>> {
        let dir = self.adapter_dir(adapter);
        let mut files = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn write_entry(&self, adapter: &str, request_id: &str, entry: &DlqEntry) -> Result<()> {
        let dir = self.adapter_dir(adapter);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.entry_path(adapter, request_id);
        let tmp = path.with_extension("jsonl.tmp");
        let mut body = serde_json::to_string(entry)?;
        body.push('\n');
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Files hold a single object, but tolerate stray blank lines by taking
/// the last parseable line.
async fn read_entry(path: &Path) -> Option<DlqEntry> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.lines()
        .rev()
        .find_map(|line| serde_json::from_str::<DlqEntry>(line).ok())
}
