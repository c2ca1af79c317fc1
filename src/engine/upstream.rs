//! Upstream agent service abstraction.
//!
//! An [`Upstream`] turns a [`StreamRequest`] into a [`RawMessageStream`] of
//! loosely typed JSON messages. The engine classifies each item itself, so
//! adapters only need to deliver messages in arrival order.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use super::bridge::{ToolCatalog, ToolExecutionMode, ToolModePreference};
use crate::error::EngineError;

/// Raw upstream messages in arrival order. An `Err` item ends the session
/// with an error.
pub type RawMessageStream = Pin<Box<dyn Stream<Item = Result<Value, EngineError>> + Send>>;

/// Everything the upstream needs to start one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// User prompt for this turn.
    pub prompt: String,
    /// Optional system prompt supplied by the application.
    pub system_prompt: Option<String>,
    /// Tools available for this session.
    pub tools: ToolCatalog,
    /// Requested tool execution strategy; `None` uses the engine default.
    pub tool_mode: Option<ToolModePreference>,
}

impl StreamRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolCatalog) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_tool_mode(mut self, mode: ToolModePreference) -> Self {
        self.tool_mode = Some(mode);
        self
    }
}

/// Source of raw agent messages.
#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Whether the upstream can register tools natively and run their
    /// handlers itself.
    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Opens a stream for `request`. In [`ToolExecutionMode::Native`] the
    /// upstream is expected to register `request.tools`.
    async fn open(
        &self,
        request: &StreamRequest,
        mode: ToolExecutionMode,
    ) -> Result<RawMessageStream, EngineError>;
}

/// Replays a recorded list of raw messages.
///
/// Used for offline transcripts and tests. In native mode the recorded
/// `tool_result` messages stand in for the upstream's post-execution hooks.
#[derive(Debug, Clone, Default)]
pub struct ReplayUpstream {
    messages: Arc<Vec<Value>>,
    native_tools: bool,
}

impl ReplayUpstream {
    #[must_use]
    pub fn from_messages(messages: Vec<Value>) -> Self {
        Self {
            messages: Arc::new(messages),
            native_tools: false,
        }
    }

    /// Parses one JSON message per line; blank lines are skipped.
    pub fn parse_jsonl(contents: &str) -> Result<Self, EngineError> {
        let messages = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| EngineError::Transcript {
                    line: idx + 1,
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<Value>, _>>()?;

        Ok(Self::from_messages(messages))
    }

    pub async fn from_jsonl(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse_jsonl(&contents)
    }

    /// Advertise native tool registration.
    #[must_use]
    pub fn with_native_tools(mut self, native: bool) -> Self {
        self.native_tools = native;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl Upstream for ReplayUpstream {
    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    async fn open(
        &self,
        request: &StreamRequest,
        mode: ToolExecutionMode,
    ) -> Result<RawMessageStream, EngineError> {
        tracing::debug!(
            message_count = self.messages.len(),
            tool_count = request.tools.len(),
            mode = ?mode,
            "Opening replay stream"
        );
        let messages = (*self.messages).clone();
        Ok(Box::pin(futures::stream::iter(messages.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    #[test]
    fn test_parse_jsonl_skips_blank_lines() {
        let replay = ReplayUpstream::parse_jsonl(
            "{\"type\":\"system\"}\n\n{\"type\":\"result\",\"result\":\"ok\"}\n",
        )
        .unwrap();
        assert_eq!(replay.len(), 2);
    }

    #[test]
    fn test_parse_jsonl_reports_line() {
        let err = ReplayUpstream::parse_jsonl("{\"type\":\"system\"}\n{oops\n").unwrap_err();
        assert!(matches!(err, EngineError::Transcript { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_from_jsonl_file_and_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"type\":\"error\",\"message\":\"x\"}}").unwrap();

        let replay = ReplayUpstream::from_jsonl(file.path()).await.unwrap();
        let stream = replay
            .open(&StreamRequest::new("hi"), ToolExecutionMode::Bridged)
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[tokio::test]
    async fn test_missing_transcript_is_io_error() {
        let err = ReplayUpstream::from_jsonl("/definitely/not/here.jsonl")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IO");
    }
}
