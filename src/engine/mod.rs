//! Streaming event normalization engine.
//!
//! Raw upstream messages flow through a per-session [`SessionController`]:
//!
//! ```text
//! Upstream -> classify -> SessionController -> NormalizedEvent stream
//!                          |-- Accumulator      (text and reasoning)
//!                          |-- ToolCallRegistry (call/result correlation)
//!                          |-- CitationExtractor
//!                          `-- ToolBridge       (native or bridged tools)
//! ```

pub mod accumulator;
pub mod bridge;
pub mod citations;
pub mod controller;
pub mod raw;
pub mod registry;
pub mod upstream;

use serde::Deserialize;

pub use accumulator::Accumulator;
pub use bridge::{
    ToolBridge, ToolCatalog, ToolDefinition, ToolExecutionMode, ToolHandler, ToolModePreference,
    ToolOutcome, normalize_result,
};
pub use citations::CitationExtractor;
pub use controller::{Phase, SessionController, Termination};
pub use raw::{RawMessage, classify};
pub use registry::{ToolCallRecord, ToolCallRegistry, ToolCallState};
pub use upstream::{RawMessageStream, ReplayUpstream, StreamRequest, Upstream};

/// Engine behaviour shared by every session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineSettings {
    /// Default tool execution strategy when a request does not pick one.
    #[serde(default)]
    pub tool_mode: ToolModePreference,

    /// Tool names that get `web_search.*` lifecycle events.
    #[serde(default = "default_web_search_tools")]
    pub web_search_tools: Vec<String>,

    /// Scan the final answer text for citations not seen in tool results.
    #[serde(default = "default_true")]
    pub final_citation_pass: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tool_mode: ToolModePreference::default(),
            web_search_tools: default_web_search_tools(),
            final_citation_pass: true,
        }
    }
}

fn default_web_search_tools() -> Vec<String> {
    vec!["web_search".to_string(), "WebSearch".to_string()]
}

fn default_true() -> bool {
    true
}
