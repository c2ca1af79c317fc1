//! Raw upstream message model and classifier.
//!
//! The upstream agent service is not consistent about field names across its
//! own message kinds (`id` vs `tool_use_id`, `name` vs `tool_name`, `type` vs
//! `kind`, ...). [`classify`] is the single place that inspects loosely typed
//! JSON; everything after it matches on [`RawMessage`] exhaustively.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::normalized::{ResultMetadata, Usage};

/// One message received from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Fine-grained streaming sub-event.
    StreamEvent(StreamSubEvent),
    /// Complete assistant message for one turn.
    AssistantMessage(AssistantMessage),
    /// Terminal result, success or error.
    Result(ResultMessage),
    /// Tool invocation announcement.
    ToolCall(ToolCallMessage),
    /// Tool invocation result.
    ToolResult(ToolResultMessage),
    /// Heartbeat from a running tool.
    ToolProgress(ToolProgressMessage),
    /// Session-level system notification.
    SystemEvent(SystemEvent),
    /// Upstream-reported failure.
    ErrorEvent(ErrorEvent),
    /// Anything that did not fit a known shape.
    Unrecognized { reason: String },
}

impl RawMessage {
    /// Short label used in log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamEvent(_) => "stream_event",
            Self::AssistantMessage(_) => "assistant",
            Self::Result(_) => "result",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::ToolProgress(_) => "tool_progress",
            Self::SystemEvent(_) => "system",
            Self::ErrorEvent(_) => "error",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    fn unrecognized(reason: impl Into<String>) -> Self {
        Self::Unrecognized {
            reason: reason.into(),
        }
    }
}

/// Sub-event carried by a `stream_event` message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSubEvent {
    BlockStart { index: usize, block: ContentBlock },
    BlockDelta { index: usize, delta: BlockDelta },
    BlockStop { index: usize },
    /// `message_start`, `message_delta`, `message_stop` and the like.
    Other(String),
}

/// Delta payload of a `content_block_delta` sub-event.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    InputJson(String),
    Other,
}

/// Content block inside an assistant message or a `content_block_start`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ServerToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    WebSearchToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    pub success: bool,
    pub result: Option<String>,
    pub errors: Vec<String>,
    pub subtype: Option<String>,
    pub usage: Option<Usage>,
    pub metadata: ResultMetadata,
}

impl ResultMessage {
    /// Human-readable failure message for an error result.
    #[must_use]
    pub fn error_message(&self) -> String {
        if let Some(result) = self.result.as_deref().filter(|r| !r.trim().is_empty()) {
            return result.to_string();
        }
        if !self.errors.is_empty() {
            return self.errors.join("; ");
        }
        match self.subtype.as_deref() {
            Some(subtype) => format!("upstream finished with `{subtype}`"),
            None => "upstream finished with an error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallMessage {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultMessage {
    pub id: Option<String>,
    pub name: Option<String>,
    pub result: Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgressMessage {
    pub id: Option<String>,
    pub name: Option<String>,
    pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub message: String,
}

const ID_KEYS: &[&str] = &["id", "tool_use_id", "toolUseId", "tool_call_id", "call_id"];
const NAME_KEYS: &[&str] = &["name", "tool_name", "toolName"];

/// Classify one deserialized upstream message.
///
/// Never fails: non-objects, missing or unknown discriminators and payloads
/// that do not fit their declared kind all become [`RawMessage::Unrecognized`].
pub fn classify(value: Value) -> RawMessage {
    let Value::Object(obj) = value else {
        return RawMessage::unrecognized("message is not an object");
    };

    let Some(kind) = ["type", "kind"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(normalize_kind)
    else {
        return RawMessage::unrecognized("missing discriminator");
    };

    let parsed = match kind.as_str() {
        "stream_event" => parse_stream_event(&obj),
        "assistant" | "assistant_message" => Some(parse_assistant(&obj)),
        "result" => Some(parse_result(&obj)),
        "tool_call" | "tool_use" => parse_tool_call(&obj),
        "tool_result" => Some(parse_tool_result(&obj)),
        "tool_progress" => Some(parse_tool_progress(&obj)),
        "system" | "system_event" => Some(parse_system(&obj)),
        "error" | "error_event" => Some(parse_error(&obj)),
        other => return RawMessage::unrecognized(format!("unknown discriminator `{other}`")),
    };

    parsed.unwrap_or_else(|| RawMessage::unrecognized(format!("malformed `{kind}` payload")))
}

/// `StreamEvent`, `STREAM_EVENT`, `stream-event` and `stream_event` all map
/// to `stream_event`.
fn normalize_kind(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c == '-' || c == ' ' {
            out.push('_');
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    out
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn index_field(obj: &Map<String, Value>) -> usize {
    obj.get("index")
        .and_then(Value::as_u64)
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(0)
}

/// Tool arguments sometimes arrive as a JSON-encoded string.
fn arguments_field(obj: &Map<String, Value>) -> Value {
    let raw = ["input", "arguments", "args"]
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or(Value::Null);

    match raw {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

fn parse_stream_event(obj: &Map<String, Value>) -> Option<RawMessage> {
    let event = obj.get("event")?.as_object()?;
    let sub_type = event.get("type").and_then(Value::as_str)?;
    let index = index_field(event);

    let sub = match sub_type {
        "content_block_start" => {
            let block = event
                .get("content_block")
                .cloned()
                .and_then(|b| serde_json::from_value(b).ok())
                .unwrap_or(ContentBlock::Other);
            StreamSubEvent::BlockStart { index, block }
        }
        "content_block_delta" => {
            let delta = event.get("delta").and_then(Value::as_object)?;
            let text_of = |key: &str| {
                delta
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let delta = match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => BlockDelta::Text(text_of("text")),
                Some("thinking_delta") => BlockDelta::Thinking(text_of("thinking")),
                Some("input_json_delta") => BlockDelta::InputJson(text_of("partial_json")),
                _ => BlockDelta::Other,
            };
            StreamSubEvent::BlockDelta { index, delta }
        }
        "content_block_stop" => StreamSubEvent::BlockStop { index },
        other => StreamSubEvent::Other(other.to_string()),
    };

    Some(RawMessage::StreamEvent(sub))
}

fn parse_assistant(obj: &Map<String, Value>) -> RawMessage {
    let content = obj
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| obj.get("content"));

    let content = match content {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|b| serde_json::from_value(b.clone()).unwrap_or(ContentBlock::Other))
            .collect(),
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        _ => Vec::new(),
    };

    RawMessage::AssistantMessage(AssistantMessage { content })
}

fn parse_result(obj: &Map<String, Value>) -> RawMessage {
    let subtype = str_field(obj, &["subtype"]);
    let is_error = obj
        .get("is_error")
        .or_else(|| obj.get("isError"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let success = !is_error && subtype.as_deref().is_none_or(|s| s == "success");

    let errors = obj
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .filter_map(|e| e.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    let usage = obj
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value::<Usage>(u).ok());

    let metadata = ResultMetadata {
        session_id: str_field(obj, &["session_id", "sessionId"]),
        duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
        num_turns: obj.get("num_turns").and_then(Value::as_u64),
        total_cost_usd: obj.get("total_cost_usd").and_then(Value::as_f64),
    };

    RawMessage::Result(ResultMessage {
        success,
        result: obj
            .get("result")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        errors,
        subtype,
        usage,
        metadata,
    })
}

fn parse_tool_call(obj: &Map<String, Value>) -> Option<RawMessage> {
    Some(RawMessage::ToolCall(ToolCallMessage {
        id: str_field(obj, ID_KEYS),
        name: str_field(obj, NAME_KEYS)?,
        input: arguments_field(obj),
    }))
}

fn parse_tool_result(obj: &Map<String, Value>) -> RawMessage {
    let result = ["result", "content", "output"]
        .iter()
        .find_map(|k| obj.get(*k))
        .cloned()
        .unwrap_or(Value::Null);

    RawMessage::ToolResult(ToolResultMessage {
        id: str_field(obj, ID_KEYS),
        name: str_field(obj, NAME_KEYS),
        result,
        is_error: obj
            .get("is_error")
            .or_else(|| obj.get("isError"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn parse_tool_progress(obj: &Map<String, Value>) -> RawMessage {
    RawMessage::ToolProgress(ToolProgressMessage {
        id: str_field(obj, ID_KEYS),
        name: str_field(obj, NAME_KEYS),
        elapsed_seconds: obj
            .get("elapsed_time_seconds")
            .or_else(|| obj.get("elapsed"))
            .and_then(Value::as_f64),
    })
}

fn parse_system(obj: &Map<String, Value>) -> RawMessage {
    let tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    RawMessage::SystemEvent(SystemEvent {
        subtype: str_field(obj, &["subtype"]),
        session_id: str_field(obj, &["session_id", "sessionId"]),
        model: str_field(obj, &["model"]),
        tools,
    })
}

fn parse_error(obj: &Map<String, Value>) -> RawMessage {
    let message = str_field(obj, &["message"])
        .or_else(|| {
            obj.get("error")
                .and_then(Value::as_object)
                .and_then(|e| str_field(e, &["message"]))
        })
        .or_else(|| str_field(obj, &["error"]))
        .unwrap_or_else(|| "unknown upstream error".to_string());

    RawMessage::ErrorEvent(ErrorEvent { message })
}
