//! Normalized event types emitted by the streaming engine.
//!
//! This module defines the stable, application-facing event model. Whatever
//! shape the upstream agent service uses for its own messages, the engine
//! translates it into a [`NormalizedEvent`] before anything leaves the crate.
//!
//! # Event Types
//!
//! The [`NormalizedEvent`] enum covers:
//! - Text and reasoning deltas plus their `done` summaries
//! - Tool call lifecycle (start, done) and the web search sub-lifecycle
//! - Citation annotations
//! - Stream termination (error, finish)
//!
//! # Example
//!
//! ```rust
//! use agent_stream::normalized::{NormalizedEvent, sse_event};
//!
//! let event = NormalizedEvent::TextDelta {
//!     text: "Hello".to_string(),
//! };
//! let sse = sse_event(&event);
//! assert!(sse.contains("text.delta"));
//! ```

use serde::{Deserialize, Serialize};

/// Citation record derived from tool results or final text.
///
/// `start_index`/`end_index` are placeholder offsets (`i * 100` and
/// `(i + 1) * 100` for the i-th unique URL of an extraction pass). They do
/// not point into the final text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Annotation {
    /// URL of the cited source.
    pub url: String,
    /// Title of the source; the URL itself when no title was found.
    pub title: String,
    /// Placeholder start offset.
    pub start_index: usize,
    /// Placeholder end offset.
    pub end_index: usize,
}

/// Token accounting reported by a successful upstream result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// Session metadata reported by a successful upstream result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    /// Upstream-side session identifier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Wall-clock duration reported by the upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Number of turns the upstream ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u64>,
    /// Cost reported by the upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

/// Normalized streaming events consumed by the application layer.
///
/// Every session produces exactly one [`NormalizedEvent::Finish`], optionally
/// preceded by a single [`NormalizedEvent::Error`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum NormalizedEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Text and Reasoning
    // ─────────────────────────────────────────────────────────────────────
    /// Incremental answer text.
    #[serde(rename = "text.delta")]
    TextDelta {
        /// The text fragment to append.
        text: String,
    },

    /// Full answer text, emitted once when the session finishes cleanly.
    #[serde(rename = "text.done")]
    TextDone {
        /// Concatenation of every emitted text delta.
        text: String,
    },

    /// Incremental reasoning/thinking text.
    #[serde(rename = "reasoning.delta")]
    ReasoningDelta {
        /// The reasoning fragment to append.
        text: String,
    },

    /// Full text of one reasoning block.
    #[serde(rename = "reasoning.done")]
    ReasoningDone {
        /// Concatenation of the block's reasoning deltas.
        text: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Tool Calls
    // ─────────────────────────────────────────────────────────────────────
    /// A tool invocation was announced.
    #[serde(rename = "tool_call.start")]
    ToolCallStart {
        /// Correlation id shared with the matching `ToolCallDone`.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments the tool is invoked with.
        arguments: serde_json::Value,
    },

    /// A tool invocation produced its result.
    #[serde(rename = "tool_call.done")]
    ToolCallDone {
        /// Correlation id shared with the matching `ToolCallStart`.
        id: String,
        /// Tool name.
        name: String,
        /// Normalized result payload.
        result: serde_json::Value,
        /// Whether the tool reported success.
        success: bool,
    },

    /// A web search tool started.
    #[serde(rename = "web_search.start")]
    WebSearchStart {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
    },

    /// Progress heartbeat from a running web search.
    #[serde(rename = "web_search.searching")]
    WebSearchSearching {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed_seconds: Option<f64>,
    },

    /// A web search finished.
    #[serde(rename = "web_search.done")]
    WebSearchDone { id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Citations
    // ─────────────────────────────────────────────────────────────────────
    /// Deduplicated citations from one extraction pass.
    #[serde(rename = "annotations")]
    Annotations { annotations: Vec<Annotation> },

    // ─────────────────────────────────────────────────────────────────────
    // Termination
    // ─────────────────────────────────────────────────────────────────────
    /// The session failed. Always followed by `Finish`.
    #[serde(rename = "error")]
    Error {
        /// Error message.
        message: String,
        /// Optional error code for programmatic handling.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Terminal event; exactly one per session.
    #[serde(rename = "finish")]
    Finish {
        /// Number of completed assistant turns.
        total_steps: u32,
        /// Text accumulated before the session ended.
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<ResultMetadata>,
    },
}

impl NormalizedEvent {
    /// Whether this is the terminal `Finish` event.
    #[must_use]
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

/// Convert a [`NormalizedEvent`] to an SSE-formatted string.
///
/// The output carries both an `event:` line (for EventSource listeners) and
/// a `data:` line containing the JSON payload.
///
/// # Example
///
/// ```rust
/// use agent_stream::normalized::{NormalizedEvent, sse_event};
///
/// let event = NormalizedEvent::WebSearchDone { id: "ws-1".to_string() };
/// let sse = sse_event(&event);
/// assert!(sse.starts_with("event: web_search.done\n"));
/// ```
pub fn sse_event(evt: &NormalizedEvent) -> String {
    let json = serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "data": { "message": e.to_string() } }).to_string()
    });

    let event_name = event_name(evt);

    format!("event: {event_name}\ndata: {json}\n\n")
}

/// Get the SSE event name for a [`NormalizedEvent`].
pub fn event_name(evt: &NormalizedEvent) -> &'static str {
    match evt {
        NormalizedEvent::TextDelta { .. } => "text.delta",
        NormalizedEvent::TextDone { .. } => "text.done",
        NormalizedEvent::ReasoningDelta { .. } => "reasoning.delta",
        NormalizedEvent::ReasoningDone { .. } => "reasoning.done",
        NormalizedEvent::ToolCallStart { .. } => "tool_call.start",
        NormalizedEvent::ToolCallDone { .. } => "tool_call.done",
        NormalizedEvent::WebSearchStart { .. } => "web_search.start",
        NormalizedEvent::WebSearchSearching { .. } => "web_search.searching",
        NormalizedEvent::WebSearchDone { .. } => "web_search.done",
        NormalizedEvent::Annotations { .. } => "annotations",
        NormalizedEvent::Error { .. } => "error",
        NormalizedEvent::Finish { .. } => "finish",
    }
}
