//! Normalizes the provider message stream into the persistent transcript.
//!
//! The handler is a fold over [`CliMessage`]: it owns the per-run
//! bookkeeping (cli message id → DB row, tool-use block dedup, held
//! control requests) and writes through the store while mirroring every
//! step to the WebSocket broker. Streaming providers re-emit cumulative
//! assistant messages and resumes re-stream already-persisted tool uses;
//! both collapse to single rows here.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::message::{
    CliMessage, ContentBlock, ControlRequestBody, ControlResponse, decode_unicode_escapes,
};
use crate::errors::Result;
use crate::store::{DbHandle, Role, ThreadStage, ThreadStatus, WaitingReason};
use crate::ws::{WsBroker, WsEvent, WsEventType};

/// Tools whose approval is held for the user instead of auto-allowed.
const ASK_USER_QUESTION: &str = "AskUserQuestion";
const EXIT_PLAN_MODE: &str = "ExitPlanMode";

#[derive(Debug, Clone)]
pub struct HeldControlRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Per-run, in-memory handler state. A fresh run (including a resume)
/// starts empty; everything it caches can be rebuilt from the store.
pub struct ThreadRunState {
    pub thread_id: i64,
    pub user_id: Option<String>,
    cli_to_db_message: HashMap<String, i64>,
    seen_tool_blocks: HashSet<String>,
    tool_use_to_call: HashMap<String, i64>,
    last_tool_name: Option<String>,
    permission_denied_tool: Option<String>,
    held_request: Option<HeldControlRequest>,
}

impl ThreadRunState {
    pub fn new(thread_id: i64, user_id: Option<String>) -> Self {
        Self {
            thread_id,
            user_id,
            cli_to_db_message: HashMap::new(),
            seen_tool_blocks: HashSet::new(),
            tool_use_to_call: HashMap::new(),
            last_tool_name: None,
            permission_denied_tool: None,
            held_request: None,
        }
    }

    pub fn held_request(&self) -> Option<&HeldControlRequest> {
        self.held_request.as_ref()
    }
}

/// What the run loop should do after one message.
#[derive(Debug)]
pub enum HandlerOutcome {
    Continue,
    /// Write this control response to the provider's stdin.
    Respond(ControlResponse),
    /// A control request is held for the user; keep the process alive.
    Held,
    /// The provider emitted its terminal result with this thread status.
    Finished(ThreadStatus),
}

pub struct MessageHandler {
    db: DbHandle,
    broker: WsBroker,
    denied_pattern: Regex,
}

impl MessageHandler {
    pub fn new(db: DbHandle, broker: WsBroker) -> Self {
        Self {
            db,
            broker,
            denied_pattern: Regex::new(
                r"(?i)permission denied|requested permissions|permission to use .* has not been granted",
            )
            .expect("static regex"),
        }
    }

    fn emit(&self, state: &ThreadRunState, event_type: WsEventType, data: Value) {
        self.broker.emit_scoped(
            state.user_id.as_deref(),
            &WsEvent::for_thread(event_type, state.thread_id, data),
        );
    }

    pub async fn handle(
        &self,
        state: &mut ThreadRunState,
        msg: CliMessage,
    ) -> Result<HandlerOutcome> {
        match msg {
            CliMessage::System {
                subtype,
                session_id,
                tools,
                cwd,
                model,
            } => {
                if subtype == "init" {
                    self.on_init(state, session_id, tools, cwd, model).await?;
                }
                Ok(HandlerOutcome::Continue)
            }
            CliMessage::Assistant { message, .. } => {
                self.on_assistant(state, message.id, message.content).await?;
                Ok(HandlerOutcome::Continue)
            }
            CliMessage::User { message } => {
                self.on_tool_results(state, message.content).await?;
                Ok(HandlerOutcome::Continue)
            }
            CliMessage::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
                duration_ms,
                ..
            } => {
                self.on_result(state, subtype, result, is_error, total_cost_usd, duration_ms)
                    .await
            }
            CliMessage::ControlRequest {
                request_id,
                request,
            } => self.on_control_request(state, request_id, request).await,
            CliMessage::Other => Ok(HandlerOutcome::Continue),
        }
    }

    async fn on_init(
        &self,
        state: &mut ThreadRunState,
        session_id: Option<String>,
        tools: Vec<String>,
        cwd: Option<String>,
        model: Option<String>,
    ) -> Result<()> {
        let thread_id = state.thread_id;
        if let Some(session) = session_id.clone() {
            self.db
                .call(move |db| db.set_thread_session(thread_id, Some(&session)))
                .await?;
        }
        self.db
            .call(move |db| db.update_thread_status(thread_id, ThreadStatus::Running, None))
            .await?;
        self.emit(
            state,
            WsEventType::AgentInit,
            serde_json::json!({"tools": tools, "cwd": cwd, "model": model}),
        );
        self.emit(
            state,
            WsEventType::AgentStatus,
            serde_json::json!({"status": "running"}),
        );
        Ok(())
    }

    async fn on_assistant(
        &self,
        state: &mut ThreadRunState,
        cli_message_id: String,
        content: Vec<ContentBlock>,
    ) -> Result<()> {
        // Combine text blocks; providers re-emit the whole message as it
        // grows, so the combined text replaces the previous revision.
        let combined_text: String = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(decode_unicode_escapes(text)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let db_message_id = match state.cli_to_db_message.get(&cli_message_id) {
            Some(&id) => {
                if !combined_text.is_empty() {
                    let text = combined_text.clone();
                    self.db
                        .call(move |db| db.update_message_content(id, &text))
                        .await?;
                }
                id
            }
            None => {
                let thread_id = state.thread_id;
                let text = combined_text.clone();
                let message = self
                    .db
                    .call(move |db| {
                        db.insert_message(thread_id, Role::Assistant, &text, &[], None, None)
                    })
                    .await?;
                state
                    .cli_to_db_message
                    .insert(cli_message_id.clone(), message.id);
                message.id
            }
        };

        if !combined_text.is_empty() {
            self.emit(
                state,
                WsEventType::AgentMessage,
                serde_json::json!({"messageId": db_message_id, "content": combined_text}),
            );
        }

        for block in content {
            if let ContentBlock::ToolUse { id, name, input } = block {
                self.on_tool_use(state, db_message_id, id, name, input).await?;
            }
        }
        Ok(())
    }

    async fn on_tool_use(
        &self,
        state: &mut ThreadRunState,
        db_message_id: i64,
        block_id: String,
        name: String,
        input: Value,
    ) -> Result<()> {
        // Streaming providers emit the same block repeatedly as content
        // grows; the block id collapses those in-run.
        if !state.seen_tool_blocks.insert(block_id.clone()) {
            return Ok(());
        }

        let input_json = serde_json::to_string(&input)?;
        let thread_id = state.thread_id;

        // Resume re-emission: the tool use may already be persisted under
        // an earlier message. Check the block id thread-wide first, then
        // the (parent, name, input) key.
        let existing = {
            let block_id = block_id.clone();
            self.db
                .call(move |db| db.find_tool_call_by_use_id(thread_id, &block_id))
                .await?
        };
        if let Some(tc) = existing {
            state.tool_use_to_call.insert(block_id, tc.id);
            state.last_tool_name = Some(tc.name);
            return Ok(());
        }

        let duplicate = {
            let name = name.clone();
            let input_json = input_json.clone();
            self.db
                .call(move |db| db.find_tool_call(db_message_id, &name, &input_json))
                .await?
        };
        if let Some(tc) = duplicate {
            debug!(thread_id, tool = %name, "tool call already persisted, skipping");
            state.tool_use_to_call.insert(block_id, tc.id);
            state.last_tool_name = Some(name);
            return Ok(());
        }

        let tool_call = {
            let block_id = block_id.clone();
            let name = name.clone();
            let input_json = input_json.clone();
            self.db
                .call(move |db| db.insert_tool_call(db_message_id, &block_id, &name, &input_json))
                .await?
        };
        state.tool_use_to_call.insert(block_id, tool_call.id);
        state.last_tool_name = Some(name.clone());

        self.emit(
            state,
            WsEventType::AgentToolCall,
            serde_json::json!({"toolCallId": tool_call.id, "name": name, "input": input}),
        );
        Ok(())
    }

    async fn on_tool_results(
        &self,
        state: &mut ThreadRunState,
        content: Vec<ContentBlock>,
    ) -> Result<()> {
        for block in content {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } = block
            else {
                continue;
            };

            let tool_call_id = match state.tool_use_to_call.get(&tool_use_id) {
                Some(&id) => Some(id),
                None => {
                    let thread_id = state.thread_id;
                    let use_id = tool_use_id.clone();
                    self.db
                        .call(move |db| db.find_tool_call_by_use_id(thread_id, &use_id))
                        .await?
                        .map(|tc| tc.id)
                }
            };
            let Some(tool_call_id) = tool_call_id else {
                warn!(thread_id = state.thread_id, %tool_use_id, "tool result for unknown tool use");
                continue;
            };

            let output = decode_unicode_escapes(&stringify_result(&content));
            if is_error {
                debug!(thread_id = state.thread_id, %tool_use_id, "tool reported an error result");
            }

            if self.denied_pattern.is_match(&output) {
                let tool_name = {
                    let thread_id = state.thread_id;
                    let use_id = tool_use_id.clone();
                    self.db
                        .call(move |db| db.find_tool_call_by_use_id(thread_id, &use_id))
                        .await?
                        .map(|tc| tc.name)
                };
                state.permission_denied_tool = tool_name.or_else(|| state.last_tool_name.clone());
            }

            let wrote = {
                let output = output.clone();
                self.db
                    .call(move |db| db.set_tool_call_output(tool_call_id, &output))
                    .await?
            };
            if wrote {
                self.emit(
                    state,
                    WsEventType::AgentToolOutput,
                    serde_json::json!({"toolCallId": tool_call_id, "output": output}),
                );
            }
        }
        Ok(())
    }

    async fn on_result(
        &self,
        state: &mut ThreadRunState,
        subtype: String,
        result_text: Option<String>,
        is_error: bool,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    ) -> Result<HandlerOutcome> {
        let thread_id = state.thread_id;

        // First-seen wins; providers can emit multiple candidate results.
        let first = self.db.call(move |db| db.record_result_once(thread_id)).await?;
        if !first {
            debug!(thread_id, "duplicate result message ignored");
            return Ok(HandlerOutcome::Continue);
        }

        let (status, waiting_reason) = if let Some(ref tool) = state.permission_denied_tool {
            debug!(thread_id, tool = %tool, "run paused on permission denial");
            (ThreadStatus::Waiting, Some(WaitingReason::Permission))
        } else if state.last_tool_name.as_deref() == Some(ASK_USER_QUESTION) {
            (ThreadStatus::Waiting, Some(WaitingReason::Question))
        } else if state.last_tool_name.as_deref() == Some(EXIT_PLAN_MODE) {
            (ThreadStatus::Waiting, Some(WaitingReason::Plan))
        } else if subtype == "success" && !is_error {
            (ThreadStatus::Completed, None)
        } else {
            (ThreadStatus::Failed, None)
        };

        if let Some(cost) = total_cost_usd {
            self.db.call(move |db| db.add_thread_cost(thread_id, cost)).await?;
        }

        let updated = self
            .db
            .call(move |db| db.update_thread_status(thread_id, status, waiting_reason))
            .await?;

        // Finishing a run moves an in-progress thread to review.
        if status.is_terminal() && updated.stage == ThreadStage::InProgress {
            self.db
                .call(move |db| db.update_thread_stage(thread_id, ThreadStage::Review))
                .await?;
        }

        let mut data = serde_json::json!({
            "status": status.as_str(),
            "cost": total_cost_usd,
            "durationMs": duration_ms,
            "result": result_text.map(|t| decode_unicode_escapes(&t)),
        });
        if let Some(reason) = waiting_reason {
            data["waitingReason"] = Value::String(reason.as_str().to_string());
        }
        if let Some(ref tool) = state.permission_denied_tool {
            data["permissionRequest"] = serde_json::json!({"toolName": tool});
        }
        self.emit(state, WsEventType::AgentResult, data);

        Ok(HandlerOutcome::Finished(status))
    }

    async fn on_control_request(
        &self,
        state: &mut ThreadRunState,
        request_id: String,
        request: ControlRequestBody,
    ) -> Result<HandlerOutcome> {
        let tool_name = request.tool_name.clone().unwrap_or_default();

        if tool_name == ASK_USER_QUESTION || tool_name == EXIT_PLAN_MODE {
            let reason = if tool_name == ASK_USER_QUESTION {
                WaitingReason::Question
            } else {
                WaitingReason::Plan
            };
            state.held_request = Some(HeldControlRequest {
                request_id,
                tool_name: tool_name.clone(),
                input: request.input,
            });
            let thread_id = state.thread_id;
            self.db
                .call(move |db| {
                    db.update_thread_status(thread_id, ThreadStatus::Waiting, Some(reason))
                })
                .await?;
            self.emit(
                state,
                WsEventType::AgentStatus,
                serde_json::json!({"status": "waiting", "waitingReason": reason.as_str(), "toolName": tool_name}),
            );
            return Ok(HandlerOutcome::Held);
        }

        // Plain tool approvals always pass.
        Ok(HandlerOutcome::Respond(ControlResponse::allow(&request_id)))
    }

    /// Answer a held control request with the user's reply; the reply
    /// becomes the tool's `result` and the thread returns to running.
    pub async fn answer_held(
        &self,
        state: &mut ThreadRunState,
        reply: &str,
    ) -> Result<Option<ControlResponse>> {
        let Some(held) = state.held_request.take() else {
            return Ok(None);
        };
        let thread_id = state.thread_id;
        self.db
            .call(move |db| db.update_thread_status(thread_id, ThreadStatus::Running, None))
            .await?;
        self.emit(
            state,
            WsEventType::AgentStatus,
            serde_json::json!({"status": "running"}),
        );
        Ok(Some(ControlResponse::allow_with_result(
            &held.request_id,
            held.input,
            reply,
        )))
    }
}

/// Tool results arrive as plain strings, content-block arrays, or raw
/// JSON; normalize to one string surface.
fn stringify_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|b| match b.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => b.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
