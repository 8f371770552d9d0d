//! SQLite store for projects, threads, messages, tool calls, stage
//! history, and automations.
//!
//! Access is serialized through [`DbHandle`]: a `Mutex<Store>` driven from
//! `spawn_blocking` closures, so rusqlite never blocks the async runtime
//! and every write observes a consistent view.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::{Error, Result};

fn db_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(e.to_string())
        }
        _ => Error::Internal(e.to_string()),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    path TEXT NOT NULL UNIQUE,
                    follow_up_mode TEXT NOT NULL DEFAULT 'queue',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS threads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    mode TEXT NOT NULL DEFAULT 'local',
                    status TEXT NOT NULL DEFAULT 'idle',
                    stage TEXT NOT NULL DEFAULT 'backlog',
                    provider TEXT NOT NULL,
                    model TEXT,
                    permission_mode TEXT NOT NULL DEFAULT 'default',
                    branch TEXT,
                    base_branch TEXT,
                    worktree_path TEXT,
                    session_id TEXT,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    pinned INTEGER NOT NULL DEFAULT 0,
                    archived INTEGER NOT NULL DEFAULT 0,
                    waiting_reason TEXT,
                    automation_id INTEGER,
                    external_request_id TEXT,
                    result_recorded INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    images TEXT NOT NULL DEFAULT '[]',
                    model TEXT,
                    permission_mode TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tool_calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    tool_use_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    input TEXT NOT NULL,
                    output TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stage_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                    from_stage TEXT NOT NULL,
                    to_stage TEXT NOT NULL,
                    changed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS startup_commands (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    command TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS automations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    cron_expression TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    max_runs INTEGER NOT NULL DEFAULT 20,
                    last_run_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS automation_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    automation_id INTEGER NOT NULL REFERENCES automations(id) ON DELETE CASCADE,
                    thread_id INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_threads_project ON threads(project_id);
                CREATE INDEX IF NOT EXISTS idx_threads_branch ON threads(project_id, branch);
                CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
                CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls(message_id);
                CREATE INDEX IF NOT EXISTS idx_tool_calls_dedup ON tool_calls(message_id, name, input);
                CREATE INDEX IF NOT EXISTS idx_stage_history_thread ON stage_history(thread_id);
                ",
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        path: &str,
        follow_up_mode: FollowUpMode,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, path, follow_up_mode, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, path, follow_up_mode.as_str(), now()],
            )
            .map_err(|e| match db_err(e) {
                Error::Conflict(_) => Error::Conflict(format!(
                    "project with name '{}' or path '{}' already exists",
                    name, path
                )),
                other => other,
            })?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .ok_or_else(|| Error::Internal("project vanished after insert".into()))
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, path, follow_up_mode, created_at FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, path, follow_up_mode, created_at FROM projects ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_project).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn set_follow_up_mode(&self, id: i64, mode: FollowUpMode) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE projects SET follow_up_mode = ?2 WHERE id = ?1",
                params![id, mode.as_str()],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    // ── Threads ──────────────────────────────────────────────────────

    pub fn create_thread(&self, new: &NewThread) -> Result<Thread> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO threads (project_id, title, mode, provider, model, permission_mode,
                     branch, base_branch, worktree_path, automation_id, external_request_id,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    new.project_id,
                    new.title,
                    new.mode.as_str(),
                    new.provider,
                    new.model,
                    new.permission_mode,
                    new.branch,
                    new.base_branch,
                    new.worktree_path,
                    new.automation_id,
                    new.external_request_id,
                    ts,
                ],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_thread(id)?
            .ok_or_else(|| Error::Internal("thread vanished after insert".into()))
    }

    pub fn get_thread(&self, id: i64) -> Result<Option<Thread>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM threads WHERE id = ?1", THREAD_COLUMNS),
                params![id],
                row_to_thread,
            )
            .optional()
            .map_err(db_err)
    }

    /// Archived threads drop out of the listing; `archived` is terminal
    /// w.r.t. the UI.
    pub fn list_threads(&self, project_id: i64) -> Result<Vec<Thread>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM threads
                 WHERE project_id = ?1 AND archived = 0
                 ORDER BY pinned DESC, updated_at DESC",
                THREAD_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![project_id], row_to_thread)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    /// The thread holding the `(project, branch)` activity slot, if any.
    /// At most one thread per branch may be running or waiting.
    pub fn find_active_thread_for_branch(
        &self,
        project_id: i64,
        branch: &str,
    ) -> Result<Option<Thread>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM threads
                     WHERE project_id = ?1 AND branch = ?2
                       AND status IN ('running', 'waiting')
                     LIMIT 1",
                    THREAD_COLUMNS
                ),
                params![project_id, branch],
                row_to_thread,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn update_thread_status(
        &self,
        id: i64,
        status: ThreadStatus,
        waiting_reason: Option<WaitingReason>,
    ) -> Result<Thread> {
        let ts = now();
        let completed_at: Option<String> = if status.is_terminal() {
            Some(ts.clone())
        } else {
            None
        };
        let n = self
            .conn
            .execute(
                "UPDATE threads
                 SET status = ?2, waiting_reason = ?3, completed_at = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    waiting_reason.map(|w| w.as_str()),
                    completed_at,
                    ts
                ],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("thread {}", id)));
        }
        self.get_thread(id)?
            .ok_or_else(|| Error::NotFound(format!("thread {}", id)))
    }

    /// Move the thread's stage, appending a stage-history row. Returns the
    /// entry, or None when the stage is unchanged.
    pub fn update_thread_stage(
        &self,
        id: i64,
        to: ThreadStage,
    ) -> Result<Option<StageHistoryEntry>> {
        let thread = self
            .get_thread(id)?
            .ok_or_else(|| Error::NotFound(format!("thread {}", id)))?;
        if thread.stage == to {
            return Ok(None);
        }
        let ts = now();
        self.conn
            .execute(
                "UPDATE threads SET stage = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, to.as_str(), ts],
            )
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO stage_history (thread_id, from_stage, to_stage, changed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, thread.stage.as_str(), to.as_str(), ts],
            )
            .map_err(db_err)?;
        let entry_id = self.conn.last_insert_rowid();
        Ok(Some(StageHistoryEntry {
            id: entry_id,
            thread_id: id,
            from_stage: thread.stage,
            to_stage: to,
            changed_at: ts,
        }))
    }

    pub fn list_stage_history(&self, thread_id: i64) -> Result<Vec<StageHistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, thread_id, from_stage, to_stage, changed_at
                 FROM stage_history WHERE thread_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![thread_id], |row| {
                Ok(StageHistoryEntry {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    from_stage: parse_col(row.get::<_, String>(2)?, ThreadStage::from_str)?,
                    to_stage: parse_col(row.get::<_, String>(3)?, ThreadStage::from_str)?,
                    changed_at: row.get(4)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn set_thread_session(&self, id: i64, session_id: Option<&str>) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE threads SET session_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, session_id, now()],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("thread {}", id)));
        }
        Ok(())
    }

    pub fn set_thread_permission_mode(&self, id: i64, mode: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET permission_mode = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, mode, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn add_thread_cost(&self, id: i64, delta_usd: f64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET cost_usd = cost_usd + ?2, updated_at = ?3 WHERE id = ?1",
                params![id, delta_usd, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_thread_branch(
        &self,
        id: i64,
        branch: Option<&str>,
        base_branch: Option<&str>,
        worktree_path: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET branch = ?2, base_branch = ?3, worktree_path = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id, branch, base_branch, worktree_path, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_thread_archived(&self, id: i64, archived: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET archived = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, archived as i64, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_thread_pinned(&self, id: i64, pinned: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET pinned = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, pinned as i64, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_thread(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM threads WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// First-seen-wins result recording. Returns true when this call is the
    /// one that recorded the result; later calls for the same run see false.
    pub fn record_result_once(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE threads SET result_recorded = 1, updated_at = ?2
                 WHERE id = ?1 AND result_recorded = 0",
                params![id, now()],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Re-arm result recording for a fresh agent run.
    pub fn reset_result(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE threads SET result_recorded = 0, updated_at = ?2 WHERE id = ?1",
                params![id, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub fn insert_message(
        &self,
        thread_id: i64,
        role: Role,
        content: &str,
        images: &[String],
        model: Option<&str>,
        permission_mode: Option<&str>,
    ) -> Result<Message> {
        let images_json = serde_json::to_string(images)?;
        self.conn
            .execute(
                "INSERT INTO messages (thread_id, role, content, images, model, permission_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![thread_id, role.as_str(), content, images_json, model, permission_mode, now()],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?
            .ok_or_else(|| Error::Internal("message vanished after insert".into()))
    }

    pub fn update_message_content(&self, id: i64, content: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE messages SET content = ?2 WHERE id = ?1",
                params![id, content],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(
                "SELECT id, thread_id, role, content, images, model, permission_mode, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_messages(&self, thread_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, thread_id, role, content, images, model, permission_mode, created_at
                 FROM messages WHERE thread_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![thread_id], row_to_message)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    // ── Tool calls ───────────────────────────────────────────────────

    pub fn insert_tool_call(
        &self,
        message_id: i64,
        tool_use_id: &str,
        name: &str,
        input: &str,
    ) -> Result<ToolCall> {
        self.conn
            .execute(
                "INSERT INTO tool_calls (message_id, tool_use_id, name, input, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![message_id, tool_use_id, name, input, now()],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, message_id, tool_use_id, name, input, output, created_at
                 FROM tool_calls WHERE id = ?1",
                params![id],
                row_to_tool_call,
            )
            .map_err(db_err)
    }

    /// Resume dedup: a tool call with the same parent message, name, and
    /// input has already been processed.
    pub fn find_tool_call(
        &self,
        message_id: i64,
        name: &str,
        input: &str,
    ) -> Result<Option<ToolCall>> {
        self.conn
            .query_row(
                "SELECT id, message_id, tool_use_id, name, input, output, created_at
                 FROM tool_calls WHERE message_id = ?1 AND name = ?2 AND input = ?3
                 LIMIT 1",
                params![message_id, name, input],
                row_to_tool_call,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn find_tool_call_by_use_id(
        &self,
        thread_id: i64,
        tool_use_id: &str,
    ) -> Result<Option<ToolCall>> {
        self.conn
            .query_row(
                "SELECT t.id, t.message_id, t.tool_use_id, t.name, t.input, t.output, t.created_at
                 FROM tool_calls t JOIN messages m ON m.id = t.message_id
                 WHERE m.thread_id = ?1 AND t.tool_use_id = ?2
                 ORDER BY t.id DESC LIMIT 1",
                params![thread_id, tool_use_id],
                row_to_tool_call,
            )
            .optional()
            .map_err(db_err)
    }

    /// Write a tool call's output at most once. Returns false if an output
    /// was already present.
    pub fn set_tool_call_output(&self, id: i64, output: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE tool_calls SET output = ?2 WHERE id = ?1 AND output IS NULL",
                params![id, output],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn list_tool_calls(&self, message_id: i64) -> Result<Vec<ToolCall>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, message_id, tool_use_id, name, input, output, created_at
                 FROM tool_calls WHERE message_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![message_id], row_to_tool_call)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    // ── Startup commands ─────────────────────────────────────────────

    pub fn create_startup_command(&self, project_id: i64, command: &str) -> Result<StartupCommand> {
        self.conn
            .execute(
                "INSERT INTO startup_commands (project_id, command, created_at) VALUES (?1, ?2, ?3)",
                params![project_id, command, now()],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_startup_command(id)?
            .ok_or_else(|| Error::Internal("startup command vanished after insert".into()))
    }

    pub fn get_startup_command(&self, id: i64) -> Result<Option<StartupCommand>> {
        self.conn
            .query_row(
                "SELECT id, project_id, command, created_at FROM startup_commands WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StartupCommand {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        command: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_startup_commands(&self, project_id: i64) -> Result<Vec<StartupCommand>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, command, created_at FROM startup_commands
                 WHERE project_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(StartupCommand {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    command: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn delete_startup_command(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM startup_commands WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(n > 0)
    }

    // ── Automations ──────────────────────────────────────────────────

    pub fn create_automation(
        &self,
        project_id: i64,
        name: &str,
        prompt: &str,
        cron_expression: &str,
        max_runs: i64,
    ) -> Result<Automation> {
        self.conn
            .execute(
                "INSERT INTO automations (project_id, name, prompt, cron_expression, max_runs, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![project_id, name, prompt, cron_expression, max_runs, now()],
            )
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        self.get_automation(id)?
            .ok_or_else(|| Error::Internal("automation vanished after insert".into()))
    }

    pub fn get_automation(&self, id: i64) -> Result<Option<Automation>> {
        self.conn
            .query_row(
                "SELECT id, project_id, name, prompt, cron_expression, enabled, max_runs, last_run_at, created_at
                 FROM automations WHERE id = ?1",
                params![id],
                row_to_automation,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_enabled_automations(&self) -> Result<Vec<Automation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, name, prompt, cron_expression, enabled, max_runs, last_run_at, created_at
                 FROM automations WHERE enabled = 1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_automation).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn set_automation_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE automations SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_automation_last_run(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE automations SET last_run_at = ?2 WHERE id = ?1",
                params![id, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_automation_run(&self, automation_id: i64, thread_id: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO automation_runs (automation_id, thread_id, started_at)
                 VALUES (?1, ?2, ?3)",
                params![automation_id, thread_id, now()],
            )
            .map_err(db_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn complete_automation_run(&self, run_id: i64, status: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE automation_runs SET status = ?2, completed_at = ?3 WHERE id = ?1",
                params![run_id, status, now()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn list_automation_runs(&self, automation_id: i64) -> Result<Vec<AutomationRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, automation_id, thread_id, status, started_at, completed_at
                 FROM automation_runs WHERE automation_id = ?1 ORDER BY id DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![automation_id], |row| {
                Ok(AutomationRun {
                    id: row.get(0)?,
                    automation_id: row.get(1)?,
                    thread_id: row.get(2)?,
                    status: row.get(3)?,
                    started_at: row.get(4)?,
                    completed_at: row.get(5)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    /// Drop run history beyond `max_runs`, oldest first.
    pub fn prune_automation_runs(&self, automation_id: i64, max_runs: i64) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "DELETE FROM automation_runs WHERE automation_id = ?1 AND id NOT IN (
                     SELECT id FROM automation_runs WHERE automation_id = ?1
                     ORDER BY id DESC LIMIT ?2
                 )",
                params![automation_id, max_runs],
            )
            .map_err(db_err)?;
        Ok(n)
    }
}

const THREAD_COLUMNS: &str = "id, project_id, title, mode, status, stage, provider, model, \
     permission_mode, branch, base_branch, worktree_path, session_id, cost_usd, pinned, \
     archived, waiting_reason, automation_id, external_request_id, result_recorded, \
     created_at, updated_at, completed_at";

fn parse_col<T>(
    raw: String,
    parse: impl Fn(&str) -> std::result::Result<T, String>,
) -> std::result::Result<T, rusqlite::Error> {
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> std::result::Result<Project, rusqlite::Error> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        follow_up_mode: parse_col(row.get::<_, String>(3)?, FollowUpMode::from_str)?,
        created_at: row.get(4)?,
    })
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> std::result::Result<Thread, rusqlite::Error> {
    let waiting_reason: Option<String> = row.get(16)?;
    Ok(Thread {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        mode: parse_col(row.get::<_, String>(3)?, ThreadMode::from_str)?,
        status: parse_col(row.get::<_, String>(4)?, ThreadStatus::from_str)?,
        stage: parse_col(row.get::<_, String>(5)?, ThreadStage::from_str)?,
        provider: row.get(6)?,
        model: row.get(7)?,
        permission_mode: row.get(8)?,
        branch: row.get(9)?,
        base_branch: row.get(10)?,
        worktree_path: row.get(11)?,
        session_id: row.get(12)?,
        cost_usd: row.get(13)?,
        pinned: row.get::<_, i64>(14)? != 0,
        archived: row.get::<_, i64>(15)? != 0,
        waiting_reason: waiting_reason
            .map(|w| parse_col(w, WaitingReason::from_str))
            .transpose()?,
        automation_id: row.get(17)?,
        external_request_id: row.get(18)?,
        result_recorded: row.get::<_, i64>(19)? != 0,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
        completed_at: row.get(22)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> std::result::Result<Message, rusqlite::Error> {
    let images_json: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: parse_col(row.get::<_, String>(2)?, Role::from_str)?,
        content: row.get(3)?,
        images: serde_json::from_str(&images_json).unwrap_or_default(),
        model: row.get(5)?,
        permission_mode: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_tool_call(row: &rusqlite::Row<'_>) -> std::result::Result<ToolCall, rusqlite::Error> {
    Ok(ToolCall {
        id: row.get(0)?,
        message_id: row.get(1)?,
        tool_use_id: row.get(2)?,
        name: row.get(3)?,
        input: row.get(4)?,
        output: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_automation(row: &rusqlite::Row<'_>) -> std::result::Result<Automation, rusqlite::Error> {
    Ok(Automation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        prompt: row.get(3)?,
        cron_expression: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        max_runs: row.get(6)?,
        last_run_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Async handle over the store. All DB work funnels through one mutex on a
/// blocking thread, which is the persistence layer's serialization.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|_| Error::Internal("store lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(Error::internal)?
    }
}
