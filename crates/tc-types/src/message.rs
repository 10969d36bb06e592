//! Structured records emitted by the agent process, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why a single line of agent output could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record has no \"type\" discriminator")]
    MissingType,
    #[error("invalid {kind} record: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

/// One decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredMessage {
    Init(InitMessage),
    Assistant(AssistantMessage),
    ToolUse(ToolUseMessage),
    ToolResult(ToolResultMessage),
    Result(ResultMessage),
    Error(ErrorMessage),
    /// A record with a `type` this crate does not model. Passed through untouched.
    Other(UnknownRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: AssistantContent,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssistantContent {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseMessage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub result: String,
    #[serde(default, alias = "total_cost_usd")]
    pub cost_usd: f64,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(default)]
    pub error: String,
}

/// Token counts reported with a `result` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownRecord {
    pub kind: String,
    pub raw: Value,
}

/// Input of the shell-execution tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellInput {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl StructuredMessage {
    /// Decode one line of output. Surrounding whitespace (including `\r`) is ignored.
    pub fn from_line(line: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(line.trim_ascii())?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();

        let is_system_init = kind == "system"
            && value.get("subtype").and_then(Value::as_str) == Some("init");

        let msg = match kind.as_str() {
            "init" => Self::Init(payload(&kind, value)?),
            "system" if is_system_init => Self::Init(payload(&kind, value)?),
            "assistant" => Self::Assistant(payload(&kind, value)?),
            "tool_use" => Self::ToolUse(payload(&kind, value)?),
            "tool_result" => Self::ToolResult(payload(&kind, value)?),
            "result" => Self::Result(payload(&kind, value)?),
            "error" => Self::Error(payload(&kind, value)?),
            _ => Self::Other(UnknownRecord {
                kind: kind.clone(),
                raw: value,
            }),
        };
        Ok(msg)
    }

    /// The wire discriminator of this record.
    pub fn kind(&self) -> &str {
        match self {
            Self::Init(_) => "init",
            Self::Assistant(_) => "assistant",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Other(record) => &record.kind,
        }
    }
}

impl AssistantMessage {
    /// Concatenated text of all `text` blocks.
    pub fn text(&self) -> String {
        self.message
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect()
    }
}

impl ToolResultMessage {
    /// Result content as plain text, whether sent as a string or as text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl ToolUseMessage {
    /// Parse the input as the shell tool's `{command, description}` shape.
    pub fn shell_input(&self) -> Option<ShellInput> {
        serde_json::from_value(self.input.clone()).ok()
    }

    fn input_str(&self, field: &str) -> Option<&str> {
        self.input.get(field).and_then(Value::as_str)
    }

    /// One-line summary for display next to the streamed reply.
    pub fn summary(&self) -> String {
        let detail = match self.name.as_str() {
            "Read" | "Write" | "Edit" => self.input_str("file_path").map(str::to_string),
            "Bash" => self.input_str("command").map(|c| truncate(c, 40)),
            "Grep" | "Glob" => self.input_str("pattern").map(str::to_string),
            "WebFetch" => self.input_str("url").map(domain_of),
            _ => None,
        };
        match detail {
            Some(d) if !d.is_empty() => format!("{}: {d}", self.name),
            _ => self.name.clone(),
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Shorten `s` to at most `max` characters, ending in `...` when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn domain_of(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> StructuredMessage {
        StructuredMessage::from_line(line.as_bytes()).unwrap()
    }

    #[test]
    fn init_message() {
        let msg = parse(r#"{"type":"init","session_id":"abc123","cwd":"/home/user"}"#);
        assert_eq!(
            msg,
            StructuredMessage::Init(InitMessage { session_id: "abc123".into() })
        );
    }

    #[test]
    fn system_init_is_init() {
        let msg = parse(r#"{"type":"system","subtype":"init","session_id":"s-9"}"#);
        assert!(matches!(msg, StructuredMessage::Init(ref i) if i.session_id == "s-9"));
    }

    #[test]
    fn assistant_text_concatenates_text_blocks() {
        let msg = parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello "},{"type":"tool_use","id":"x"},{"type":"text","text":"world"}]}}"#,
        );
        match msg {
            StructuredMessage::Assistant(a) => assert_eq!(a.text(), "Hello world"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tool_use_message() {
        let msg = parse(r#"{"type":"tool_use","id":"toolu_123","name":"Read","input":{"file_path":"/src/main.rs"}}"#);
        match msg {
            StructuredMessage::ToolUse(t) => {
                assert_eq!(t.id, "toolu_123");
                assert_eq!(t.name, "Read");
                assert_eq!(t.summary(), "Read: /src/main.rs");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tool_result_content_forms() {
        let s = parse(r#"{"type":"tool_result","tool_use_id":"t1","content":"ok"}"#);
        let blocks = parse(r#"{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#);
        match (s, blocks) {
            (StructuredMessage::ToolResult(s), StructuredMessage::ToolResult(b)) => {
                assert_eq!(s.text(), "ok");
                assert_eq!(b.text(), "a\nb");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn result_message_with_cost_and_usage() {
        let msg = parse(r#"{"type":"result","result":"Done","cost_usd":0.05,"usage":{"input_tokens":100,"output_tokens":200}}"#);
        match msg {
            StructuredMessage::Result(r) => {
                assert_eq!(r.result, "Done");
                assert_eq!(r.cost_usd, 0.05);
                assert_eq!(r.usage, Some(Usage { input_tokens: 100, output_tokens: 200 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn result_accepts_total_cost_alias() {
        let msg = parse(r#"{"type":"result","result":"x","total_cost_usd":1.5}"#);
        assert!(matches!(msg, StructuredMessage::Result(ref r) if r.cost_usd == 1.5));
    }

    #[test]
    fn unknown_type_is_passed_through() {
        let msg = parse(r#"{"type":"stream_event","delta":"x"}"#);
        assert_eq!(msg.kind(), "stream_event");
        match msg {
            StructuredMessage::Other(rec) => assert_eq!(rec.raw["delta"], "x"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = StructuredMessage::from_line(br#"{"session_id":"abc"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingType));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = StructuredMessage::from_line(br#"{"type":"tool_use","id":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
        assert!(StructuredMessage::from_line(b"not json at all").is_err());
    }

    #[test]
    fn carriage_return_is_trimmed() {
        let msg = parse("{\"type\":\"init\",\"session_id\":\"a\"}\r");
        assert_eq!(msg.kind(), "init");
    }

    #[test]
    fn bash_summary_is_truncated() {
        let tool = ToolUseMessage {
            id: "t".into(),
            name: "Bash".into(),
            input: serde_json::json!({
                "command": "cargo test --workspace --all-features -- --nocapture"
            }),
        };
        let summary = tool.summary();
        assert!(summary.starts_with("Bash: cargo test"));
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn webfetch_summary_is_domain() {
        let tool = ToolUseMessage {
            id: "t".into(),
            name: "WebFetch".into(),
            input: serde_json::json!({"url": "https://docs.rs/tokio/latest"}),
        };
        assert_eq!(tool.summary(), "WebFetch: docs.rs");
    }
}
