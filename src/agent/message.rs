//! Provider-agnostic stream messages.
//!
//! Claude, Codex, and Gemini CLIs all emit line-delimited JSON; their
//! duck-typed shapes normalize into one tagged [`CliMessage`] the message
//! handler folds over. Unknown message types parse into `Other` and are
//! ignored rather than failing the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliMessage {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Tool results come back as "user" messages.
    #[serde(rename = "user")]
    User { message: UserMessage },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "control_request")]
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    /// Provider-side message id; stable across cumulative re-emissions of
    /// the same turn.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Value,
}

/// Reply to a `control_request`, written to the provider's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub request_id: String,
    pub response: Value,
}

impl ControlResponse {
    pub fn allow(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            response: serde_json::json!({"behavior": "allow"}),
        }
    }

    /// The user's reply flows through as the held tool's input.
    pub fn allow_with_result(request_id: &str, mut input: Value, result: &str) -> Self {
        if let Some(obj) = input.as_object_mut() {
            obj.insert("result".to_string(), Value::String(result.to_string()));
        } else {
            input = serde_json::json!({"result": result});
        }
        Self {
            request_id: request_id.to_string(),
            response: serde_json::json!({"behavior": "allow", "updatedInput": input}),
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": self.request_id,
                "response": self.response,
            }
        })
        .to_string()
    }
}

/// Decode literal `\uXXXX` escapes some providers leave in plain text
/// surfaces, including surrogate pairs. Anything malformed passes through
/// untouched.
pub fn decode_unicode_escapes(input: &str) -> String {
    if !input.contains("\\u") {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let bytes = input.as_bytes();

    while let Some((i, c)) = chars.next() {
        if c == '\\' && bytes.get(i + 1) == Some(&b'u') {
            if let Some(first) = parse_hex4(input, i + 2) {
                // Surrogate pair?
                if (0xD800..0xDC00).contains(&first)
                    && input[i + 6..].starts_with("\\u")
                    && let Some(second) = parse_hex4(input, i + 8)
                    && (0xDC00..0xE000).contains(&second)
                {
                    let combined =
                        0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
                    if let Some(decoded) = char::from_u32(combined) {
                        out.push(decoded);
                        for _ in 0..11 {
                            chars.next();
                        }
                        continue;
                    }
                }
                if let Some(decoded) = char::from_u32(first) {
                    out.push(decoded);
                    for _ in 0..5 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn parse_hex4(input: &str, start: usize) -> Option<u32> {
    let hex = input.get(start..start + 4)?;
    u32::from_str_radix(hex, 16).ok()
}

/// Parse one provider stream line. Non-JSON and unknown shapes yield None.
pub fn parse_line(line: &str) -> Option<CliMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<CliMessage>(trimmed) {
        Ok(CliMessage::Other) => None,
        Ok(msg) => Some(msg),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_init_with_session() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-1","tools":["Bash","Read"],"cwd":"/work","model":"opus"}"#;
        match parse_line(line).unwrap() {
            CliMessage::System {
                subtype,
                session_id,
                tools,
                ..
            } => {
                assert_eq!(subtype, "init");
                assert_eq!(session_id.as_deref(), Some("sess-1"));
                assert_eq!(tools, vec!["Bash", "Read"]);
            }
            other => panic!("Expected System, got {:?}", other),
        }
    }

    #[test]
    fn parses_assistant_with_text_and_tool_use() {
        let line = r#"{"type":"assistant","message":{"id":"msg_01","content":[{"type":"text","text":"Looking"},{"type":"tool_use","id":"toolu_01","name":"Read","input":{"file_path":"/a.rs"}}]}}"#;
        match parse_line(line).unwrap() {
            CliMessage::Assistant { message, .. } => {
                assert_eq!(message.id, "msg_01");
                assert_eq!(message.content.len(), 2);
                assert!(matches!(message.content[0], ContentBlock::Text { .. }));
                match &message.content[1] {
                    ContentBlock::ToolUse { id, name, .. } => {
                        assert_eq!(id, "toolu_01");
                        assert_eq!(name, "Read");
                    }
                    other => panic!("Expected ToolUse, got {:?}", other),
                }
            }
            other => panic!("Expected Assistant, got {:?}", other),
        }
    }

    #[test]
    fn parses_tool_result_in_user_message() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_01","content":"file contents"}]}}"#;
        match parse_line(line).unwrap() {
            CliMessage::User { message } => match &message.content[0] {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    assert_eq!(tool_use_id, "toolu_01")
                }
                other => panic!("Expected ToolResult, got {:?}", other),
            },
            other => panic!("Expected User, got {:?}", other),
        }
    }

    #[test]
    fn parses_result_with_cost() {
        let line = r#"{"type":"result","subtype":"success","result":"done","total_cost_usd":0.42,"duration_ms":9000}"#;
        match parse_line(line).unwrap() {
            CliMessage::Result {
                subtype,
                total_cost_usd,
                is_error,
                ..
            } => {
                assert_eq!(subtype, "success");
                assert_eq!(total_cost_usd, Some(0.42));
                assert!(!is_error);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn parses_control_request() {
        let line = r#"{"type":"control_request","request_id":"cr-1","request":{"subtype":"can_use_tool","tool_name":"ExitPlanMode","input":{"plan":"do it"}}}"#;
        match parse_line(line).unwrap() {
            CliMessage::ControlRequest {
                request_id,
                request,
            } => {
                assert_eq!(request_id, "cr-1");
                assert_eq!(request.tool_name.as_deref(), Some("ExitPlanMode"));
            }
            other => panic!("Expected ControlRequest, got {:?}", other),
        }
    }

    #[test]
    fn unknown_types_and_plain_text_are_none() {
        assert!(parse_line("plain progress output").is_none());
        assert!(parse_line(r#"{"type":"stream_event","weird":true}"#).is_none());
        assert!(parse_line("{broken json").is_none());
    }

    #[test]
    fn decodes_basic_unicode_escapes() {
        assert_eq!(decode_unicode_escapes("caf\\u00e9"), "café");
        assert_eq!(decode_unicode_escapes("no escapes"), "no escapes");
    }

    #[test]
    fn decodes_surrogate_pairs() {
        assert_eq!(decode_unicode_escapes("done \\ud83d\\ude00"), "done 😀");
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(decode_unicode_escapes(r"bad \uZZZZ tail"), r"bad \uZZZZ tail");
        assert_eq!(decode_unicode_escapes(r"short \u12"), r"short \u12");
    }

    #[test]
    fn control_response_wire_format() {
        let resp = ControlResponse::allow_with_result(
            "cr-9",
            serde_json::json!({"question": "Which db?"}),
            "postgres",
        );
        let wire: serde_json::Value = serde_json::from_str(&resp.to_wire()).unwrap();
        assert_eq!(wire["type"], "control_response");
        assert_eq!(wire["response"]["request_id"], "cr-9");
        assert_eq!(
            wire["response"]["response"]["updatedInput"]["result"],
            "postgres"
        );
    }
}
