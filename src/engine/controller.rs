//! Per-session stream state machine.
//!
//! A [`SessionController`] consumes one upstream stream and produces the
//! normalized event sequence for it:
//!
//! ```text
//! Idle -> Streaming -> { Finishing | Aborting | Failing } -> Terminated
//! ```
//!
//! Whatever path ends the stream, exactly one [`NormalizedEvent::Finish`] is
//! emitted and it is always the last event.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::EngineSettings;
use super::accumulator::Accumulator;
use super::bridge::{ToolBridge, ToolOutcome};
use super::citations::CitationExtractor;
use super::raw::{
    AssistantMessage, BlockDelta, ContentBlock, RawMessage, ResultMessage, StreamSubEvent,
    SystemEvent, ToolCallMessage, ToolProgressMessage, ToolResultMessage, classify,
};
use super::registry::ToolCallRegistry;
use super::upstream::{StreamRequest, Upstream};
use crate::error::EngineError;
use crate::normalized::{NormalizedEvent, ResultMetadata};

/// Lifecycle phase of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Streaming,
    Finishing,
    Aborting,
    Failing,
    Terminated,
}

/// Why a session is ending.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The upstream sent a successful result.
    Completed(ResultMessage),
    /// The upstream stream ended without a result message.
    Exhausted,
    /// Upstream error, error result or transport failure.
    Failed {
        message: String,
        code: Option<String>,
    },
    /// The session's cancellation token fired.
    Cancelled,
}

impl Termination {
    fn from_error(err: &EngineError) -> Self {
        Self::Failed {
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

/// A tool call the engine must run itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// What the run loop should do after a message was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    Continue,
    Execute(Invocation),
    Terminate(Termination),
}

/// Events produced by one raw message, plus the follow-up action.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub events: Vec<NormalizedEvent>,
    pub next: Next,
}

impl Dispatch {
    fn none() -> Self {
        Self::events(Vec::new())
    }

    fn events(events: Vec<NormalizedEvent>) -> Self {
        Self {
            events,
            next: Next::Continue,
        }
    }

    fn terminate(termination: Termination) -> Self {
        Self {
            events: Vec::new(),
            next: Next::Terminate(termination),
        }
    }
}

/// A content block still being streamed.
#[derive(Debug)]
enum OpenBlock {
    Thinking,
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
        partial_json: String,
        web_search: bool,
    },
}

/// Owns all mutable state of one streaming session.
#[derive(Debug)]
pub struct SessionController {
    session_key: String,
    session_id: Uuid,
    phase: Phase,
    settings: Arc<EngineSettings>,
    bridge: ToolBridge,
    accumulator: Accumulator,
    registry: ToolCallRegistry,
    citations: CitationExtractor,
    open_blocks: HashMap<usize, OpenBlock>,
    web_search_ids: HashSet<String>,
    step_count: u32,
    upstream_session_id: Option<String>,
    finish_emitted: bool,
}

impl SessionController {
    pub fn new(
        session_key: impl Into<String>,
        session_id: Uuid,
        bridge: ToolBridge,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            session_id,
            phase: Phase::Idle,
            settings,
            bridge,
            accumulator: Accumulator::new(),
            registry: ToolCallRegistry::new(),
            citations: CitationExtractor::new(),
            open_blocks: HashMap::new(),
            web_search_ids: HashSet::new(),
            step_count: 0,
            upstream_session_id: None,
            finish_emitted: false,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn registry(&self) -> &ToolCallRegistry {
        &self.registry
    }

    /// Opens the upstream and drives the session to its terminal event.
    ///
    /// Cancellation is checked before every upstream pull and raced against
    /// pulls and bridged handler runs, so nothing derived from later
    /// messages is emitted once `cancel` fires.
    pub fn run(
        mut self,
        upstream: Arc<dyn Upstream>,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = NormalizedEvent> + Send {
        async_stream::stream! {
            self.phase = Phase::Streaming;
            tracing::info!(
                session_key = %self.session_key,
                session_id = %self.session_id,
                mode = ?self.bridge.mode(),
                tool_count = request.tools.len(),
                "Starting session stream"
            );

            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                opened = upstream.open(&request, self.bridge.mode()) => Some(opened),
            };

            let mut messages = match opened {
                None => {
                    for event in self.terminate(Termination::Cancelled) {
                        yield event;
                    }
                    return;
                }
                Some(Err(e)) => {
                    tracing::error!(
                        session_key = %self.session_key,
                        error = %e,
                        "Failed to open upstream stream"
                    );
                    for event in self.terminate(Termination::from_error(&e)) {
                        yield event;
                    }
                    return;
                }
                Some(Ok(messages)) => messages,
            };

            let termination = loop {
                if cancel.is_cancelled() {
                    break Termination::Cancelled;
                }

                let pulled = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    item = messages.next() => Some(item),
                };

                let value = match pulled {
                    None => break Termination::Cancelled,
                    Some(None) => break Termination::Exhausted,
                    Some(Some(Err(e))) => {
                        tracing::error!(
                            session_key = %self.session_key,
                            error = %e,
                            "Upstream stream failed"
                        );
                        break Termination::from_error(&e);
                    }
                    Some(Some(Ok(value))) => value,
                };

                let dispatch = self.dispatch(classify(value));
                for event in dispatch.events {
                    yield event;
                }

                match dispatch.next {
                    Next::Continue => {}
                    Next::Terminate(termination) => break termination,
                    Next::Execute(invocation) => {
                        let executed = tokio::select! {
                            biased;
                            () = cancel.cancelled() => None,
                            events = self.execute(invocation) => Some(events),
                        };
                        match executed {
                            Some(events) => {
                                for event in events {
                                    yield event;
                                }
                            }
                            None => break Termination::Cancelled,
                        }
                    }
                }
            };

            for event in self.terminate(termination) {
                yield event;
            }
        }
    }

    /// Translates one raw message. Messages arriving after the session left
    /// `Streaming` are ignored.
    pub fn dispatch(&mut self, raw: RawMessage) -> Dispatch {
        if self.phase == Phase::Idle {
            self.phase = Phase::Streaming;
        }
        if self.phase != Phase::Streaming {
            tracing::debug!(
                session_key = %self.session_key,
                kind = raw.kind(),
                phase = ?self.phase,
                "Ignoring message after stream end"
            );
            return Dispatch::none();
        }

        tracing::trace!(session_key = %self.session_key, kind = raw.kind(), "Dispatching message");

        match raw {
            RawMessage::StreamEvent(sub) => Dispatch::events(self.on_stream_event(sub)),
            RawMessage::AssistantMessage(message) => Dispatch::events(self.on_assistant(message)),
            RawMessage::Result(result) if result.success => {
                Dispatch::terminate(Termination::Completed(result))
            }
            RawMessage::Result(result) => Dispatch::terminate(Termination::Failed {
                message: result.error_message(),
                code: result.subtype,
            }),
            RawMessage::ToolCall(call) => self.on_tool_call(call),
            RawMessage::ToolResult(result) => Dispatch::events(self.on_tool_result(result)),
            RawMessage::ToolProgress(progress) => {
                Dispatch::events(self.on_tool_progress(&progress))
            }
            RawMessage::SystemEvent(event) => {
                self.on_system(event);
                Dispatch::none()
            }
            RawMessage::ErrorEvent(event) => Dispatch::terminate(Termination::Failed {
                message: event.message,
                code: None,
            }),
            RawMessage::Unrecognized { reason } => {
                tracing::warn!(
                    session_key = %self.session_key,
                    reason = %reason,
                    "Skipping unrecognized upstream message"
                );
                Dispatch::none()
            }
        }
    }

    /// Runs a bridged tool call and emits its completion.
    pub async fn execute(&mut self, invocation: Invocation) -> Vec<NormalizedEvent> {
        tracing::info!(
            session_key = %self.session_key,
            tool_id = %invocation.id,
            tool_name = %invocation.name,
            "Executing bridged tool call"
        );
        let outcome = self
            .bridge
            .invoke(&invocation.name, invocation.arguments)
            .await;
        self.complete_tool(invocation.id, invocation.name, outcome)
    }

    /// Emits the terminal sequence for `termination`.
    ///
    /// Only the first call produces events; later calls return nothing.
    pub fn terminate(&mut self, termination: Termination) -> Vec<NormalizedEvent> {
        if self.finish_emitted {
            return Vec::new();
        }
        self.finish_emitted = true;

        let mut events = Vec::new();
        let (usage, metadata) = match termination {
            Termination::Completed(result) => {
                self.phase = Phase::Finishing;
                if self.accumulator.text().is_empty() {
                    let fallback = result.result.as_deref().unwrap_or_default();
                    events.extend(self.text_delta(fallback));
                }
                self.finish_buffers(&mut events);
                (result.usage, Some(self.metadata(result.metadata)))
            }
            Termination::Exhausted => {
                self.phase = Phase::Finishing;
                self.finish_buffers(&mut events);
                let metadata = self
                    .upstream_session_id
                    .is_some()
                    .then(|| self.metadata(ResultMetadata::default()));
                (None, metadata)
            }
            Termination::Failed { message, code } => {
                self.phase = Phase::Failing;
                tracing::warn!(
                    session_key = %self.session_key,
                    error = %message,
                    code = ?code,
                    "Session failed"
                );
                events.push(NormalizedEvent::Error { message, code });
                (None, None)
            }
            Termination::Cancelled => {
                self.phase = Phase::Aborting;
                tracing::info!(session_key = %self.session_key, "Session cancelled");
                (None, None)
            }
        };

        events.push(NormalizedEvent::Finish {
            total_steps: self.step_count,
            text: self.accumulator.text().to_string(),
            usage,
            metadata,
        });

        for record in self.registry.unmatched() {
            tracing::debug!(
                session_key = %self.session_key,
                tool_id = %record.id,
                tool_name = %record.name,
                "Tool call announced but never resolved"
            );
        }

        tracing::info!(
            session_key = %self.session_key,
            phase = ?self.phase,
            total_steps = self.step_count,
            text_length = self.accumulator.text().len(),
            tool_calls = self.registry.len(),
            "Session finished"
        );
        self.phase = Phase::Terminated;
        events
    }

    fn finish_buffers(&mut self, events: &mut Vec<NormalizedEvent>) {
        if let Some(text) = self.accumulator.finish_reasoning() {
            events.push(NormalizedEvent::ReasoningDone { text });
        }
        if let Some(text) = self.accumulator.finalize() {
            events.push(NormalizedEvent::TextDone { text });
        }
        if !self.settings.final_citation_pass {
            return;
        }
        if let Some(annotations) = self.citations.from_final_text(self.accumulator.text()) {
            events.push(NormalizedEvent::Annotations { annotations });
        }
    }

    fn metadata(&self, mut metadata: ResultMetadata) -> ResultMetadata {
        if metadata.session_id.is_none() {
            metadata.session_id.clone_from(&self.upstream_session_id);
        }
        metadata
    }

    // ─────────────────────────────────────────────────────────────────────
    // Message handlers
    // ─────────────────────────────────────────────────────────────────────

    fn on_stream_event(&mut self, sub: StreamSubEvent) -> Vec<NormalizedEvent> {
        match sub {
            StreamSubEvent::BlockStart { index, block } => self.on_block_start(index, block),
            StreamSubEvent::BlockDelta { index, delta } => match delta {
                BlockDelta::Text(text) => self.text_delta(&text),
                BlockDelta::Thinking(text) => self.reasoning_delta(&text),
                BlockDelta::InputJson(partial) => {
                    if let Some(OpenBlock::ToolUse { partial_json, .. }) =
                        self.open_blocks.get_mut(&index)
                    {
                        partial_json.push_str(&partial);
                    }
                    Vec::new()
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamSubEvent::BlockStop { index } => match self.open_blocks.remove(&index) {
                Some(OpenBlock::Thinking) => self
                    .accumulator
                    .finish_reasoning()
                    .map(|text| vec![NormalizedEvent::ReasoningDone { text }])
                    .unwrap_or_default(),
                Some(OpenBlock::ToolUse {
                    id,
                    name,
                    input,
                    partial_json,
                    web_search,
                }) => {
                    let arguments = if partial_json.trim().is_empty() {
                        input
                    } else {
                        serde_json::from_str(&partial_json).unwrap_or(Value::String(partial_json))
                    };
                    self.announce(&name, id.as_deref(), arguments, web_search).0
                }
                None => Vec::new(),
            },
            StreamSubEvent::Other(name) => {
                tracing::trace!(
                    session_key = %self.session_key,
                    sub_event = %name,
                    "Ignoring sub-event"
                );
                Vec::new()
            }
        }
    }

    fn on_block_start(&mut self, index: usize, block: ContentBlock) -> Vec<NormalizedEvent> {
        match block {
            ContentBlock::Text { text } => self.text_delta(&text),
            ContentBlock::Thinking { thinking } => {
                self.accumulator.start_reasoning_block();
                self.open_blocks.insert(index, OpenBlock::Thinking);
                self.reasoning_delta(&thinking)
            }
            ContentBlock::ToolUse { id, name, input } => {
                let web_search = self.is_web_search_tool(&name);
                self.open_blocks.insert(
                    index,
                    OpenBlock::ToolUse {
                        id,
                        name,
                        input,
                        partial_json: String::new(),
                        web_search,
                    },
                );
                Vec::new()
            }
            ContentBlock::ServerToolUse { id, name, input } => {
                self.open_blocks.insert(
                    index,
                    OpenBlock::ToolUse {
                        id,
                        name,
                        input,
                        partial_json: String::new(),
                        web_search: true,
                    },
                );
                Vec::new()
            }
            ContentBlock::WebSearchToolResult {
                tool_use_id,
                content,
            } => self.on_tool_result(ToolResultMessage {
                id: tool_use_id,
                name: None,
                result: content,
                is_error: false,
            }),
            ContentBlock::Other => Vec::new(),
        }
    }

    fn on_assistant(&mut self, message: AssistantMessage) -> Vec<NormalizedEvent> {
        self.step_count += 1;
        let mut events = Vec::new();
        for block in message.content {
            match block {
                ContentBlock::Text { text } => events.extend(self.text_delta(&text)),
                ContentBlock::Thinking { thinking } => {
                    events.extend(self.reasoning_block(&thinking));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let web_search = self.is_web_search_tool(&name);
                    events.extend(self.announce(&name, id.as_deref(), input, web_search).0);
                }
                ContentBlock::ServerToolUse { id, name, input } => {
                    events.extend(self.announce(&name, id.as_deref(), input, true).0);
                }
                ContentBlock::WebSearchToolResult {
                    tool_use_id,
                    content,
                } => events.extend(self.on_tool_result(ToolResultMessage {
                    id: tool_use_id,
                    name: None,
                    result: content,
                    is_error: false,
                })),
                ContentBlock::Other => {}
            }
        }
        events
    }

    fn on_tool_call(&mut self, call: ToolCallMessage) -> Dispatch {
        let web_search = self.is_web_search_tool(&call.name);
        let (events, id) = self.announce(&call.name, call.id.as_deref(), call.input, web_search);

        if !self.bridge.executes_calls() || !self.bridge.handles(&call.name) {
            return Dispatch::events(events);
        }

        let Some(record) = self.registry.get(&id) else {
            return Dispatch::events(events);
        };
        if record.result.is_some() {
            tracing::debug!(
                session_key = %self.session_key,
                tool_id = %id,
                "Tool call already executed"
            );
            return Dispatch::events(events);
        }

        Dispatch {
            events,
            next: Next::Execute(Invocation {
                id,
                name: call.name,
                arguments: record.arguments.clone(),
            }),
        }
    }

    fn on_tool_result(&mut self, result: ToolResultMessage) -> Vec<NormalizedEvent> {
        let resolution = self
            .registry
            .resolve(result.name.as_deref(), result.id.as_deref());

        if resolution.is_duplicate() {
            tracing::debug!(
                session_key = %self.session_key,
                tool_id = %resolution.id,
                "Ignoring duplicate tool result"
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        if resolution.is_orphan() {
            tracing::warn!(
                session_key = %self.session_key,
                tool_id = %resolution.id,
                tool_name = %resolution.name,
                supplied_id = ?result.id,
                "Tool result without matching announcement"
            );
            events.push(NormalizedEvent::ToolCallStart {
                id: resolution.id.clone(),
                name: resolution.name.clone(),
                arguments: Value::Object(serde_json::Map::new()),
            });
        }

        let outcome = self.bridge.upstream_outcome(result.result, result.is_error);
        events.extend(self.complete_tool(resolution.id, resolution.name, outcome));
        events
    }

    fn on_tool_progress(&self, progress: &ToolProgressMessage) -> Vec<NormalizedEvent> {
        let Some(record) = self
            .registry
            .lookup(progress.name.as_deref(), progress.id.as_deref())
        else {
            tracing::debug!(
                session_key = %self.session_key,
                tool_id = ?progress.id,
                tool_name = ?progress.name,
                "Progress for unknown tool call"
            );
            return Vec::new();
        };

        tracing::debug!(
            session_key = %self.session_key,
            tool_id = %record.id,
            elapsed_seconds = ?progress.elapsed_seconds,
            "Tool progress"
        );

        if self.web_search_ids.contains(&record.id) && record.result.is_none() {
            vec![NormalizedEvent::WebSearchSearching {
                id: record.id.clone(),
                elapsed_seconds: progress.elapsed_seconds,
            }]
        } else {
            Vec::new()
        }
    }

    fn on_system(&mut self, event: SystemEvent) {
        tracing::info!(
            session_key = %self.session_key,
            subtype = ?event.subtype,
            upstream_session_id = ?event.session_id,
            model = ?event.model,
            tool_count = event.tools.len(),
            "Upstream system event"
        );
        if event.session_id.is_some() {
            self.upstream_session_id = event.session_id;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shared helpers
    // ─────────────────────────────────────────────────────────────────────

    fn text_delta(&mut self, text: &str) -> Vec<NormalizedEvent> {
        self.accumulator
            .append_text(text)
            .map(|text| vec![NormalizedEvent::TextDelta { text }])
            .unwrap_or_default()
    }

    fn reasoning_delta(&mut self, text: &str) -> Vec<NormalizedEvent> {
        self.accumulator
            .append_reasoning(text)
            .map(|text| vec![NormalizedEvent::ReasoningDelta { text }])
            .unwrap_or_default()
    }

    /// A complete reasoning block from an assistant message. Blocks already
    /// streamed as deltas are skipped.
    fn reasoning_block(&mut self, thinking: &str) -> Vec<NormalizedEvent> {
        if self.accumulator.reasoning().ends_with(thinking) {
            return Vec::new();
        }
        self.accumulator.start_reasoning_block();
        let mut events = self.reasoning_delta(thinking);
        if let Some(text) = self.accumulator.finish_reasoning() {
            events.push(NormalizedEvent::ReasoningDone { text });
        }
        events
    }

    /// Registers a call and returns its start events (empty when the id was
    /// already announced) together with the resolved id.
    fn announce(
        &mut self,
        name: &str,
        supplied_id: Option<&str>,
        arguments: Value,
        web_search: bool,
    ) -> (Vec<NormalizedEvent>, String) {
        let announcement = self.registry.announce(name, supplied_id, arguments.clone());
        let id = announcement.id;
        if !announcement.fresh {
            return (Vec::new(), id);
        }

        tracing::debug!(
            session_key = %self.session_key,
            tool_id = %id,
            tool_name = %name,
            "Tool call announced"
        );

        let mut events = Vec::new();
        if web_search {
            self.web_search_ids.insert(id.clone());
        }
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        events.push(NormalizedEvent::ToolCallStart {
            id: id.clone(),
            name: name.to_string(),
            arguments,
        });
        if web_search {
            events.push(NormalizedEvent::WebSearchStart {
                id: id.clone(),
                query,
            });
        }
        (events, id)
    }

    fn complete_tool(
        &mut self,
        id: String,
        name: String,
        outcome: ToolOutcome,
    ) -> Vec<NormalizedEvent> {
        let ToolOutcome { result, success } = outcome;
        self.registry.complete(&id, result.clone(), success);

        tracing::debug!(
            session_key = %self.session_key,
            tool_id = %id,
            tool_name = %name,
            success = success,
            "Tool call completed"
        );

        let annotations = if success {
            self.citations.from_tool_result(&result)
        } else {
            None
        };
        let web_search = self.web_search_ids.contains(&id);

        let mut events = vec![NormalizedEvent::ToolCallDone {
            id: id.clone(),
            name,
            result,
            success,
        }];
        if web_search {
            events.push(NormalizedEvent::WebSearchDone { id });
        }
        if let Some(annotations) = annotations {
            events.push(NormalizedEvent::Annotations { annotations });
        }
        events
    }

    fn is_web_search_tool(&self, name: &str) -> bool {
        self.settings.web_search_tools.iter().any(|t| t == name)
    }
}
