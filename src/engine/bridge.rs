//! Tool execution bridge.
//!
//! Externally supplied [`ToolDefinition`]s reach the upstream in one of two
//! ways, selected per session by [`ToolExecutionMode`]:
//!
//! - **Native**: the upstream registers the tools itself and invokes the
//!   handlers in its own runtime (typically through [`ToolCatalog::call`]).
//!   Its pre/post execution hooks surface as `ToolCall`/`ToolResult` raw
//!   messages, and those drive the lifecycle events.
//! - **Bridged**: the upstream only announces calls. The engine invokes the
//!   handler in-process when a `ToolCall` arrives and emits the result itself.
//!
//! In both modes result payloads go through [`normalize_result`] and handler
//! failures become `{ "success": false, "error": ... }` results.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};

/// Handler invoked with a tool call's arguments.
#[async_trait]
pub trait ToolHandler: Send + Sync + fmt::Debug {
    async fn call(&self, arguments: Value) -> anyhow::Result<Value>;
}

/// A named tool supplied by the application for one session.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    /// Builds a definition from an async closure.
    ///
    /// ```rust
    /// use agent_stream::engine::bridge::ToolDefinition;
    /// use serde_json::json;
    ///
    /// let echo = ToolDefinition::from_fn(
    ///     "echo",
    ///     "Returns its arguments",
    ///     json!({ "type": "object" }),
    ///     |args| async move { Ok(args) },
    /// );
    /// assert_eq!(echo.name, "echo");
    /// ```
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(name, description, input_schema, Arc::new(FnHandler { f }))
    }
}

struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, arguments: Value) -> anyhow::Result<Value> {
        (self.f)(arguments).await
    }
}

/// Normalized result of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: Value,
    pub success: bool,
}

impl ToolOutcome {
    fn failure(error: impl fmt::Display) -> Self {
        Self {
            result: json!({ "success": false, "error": error.to_string() }),
            success: false,
        }
    }
}

/// The set of tools available to one session.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: Arc<HashMap<String, ToolDefinition>>,
    order: Arc<Vec<String>>,
}

impl fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, replacing any tool with the same name.
    #[must_use]
    pub fn with_tool(self, tool: ToolDefinition) -> Self {
        let mut tools = (*self.tools).clone();
        let mut order = (*self.order).clone();
        if !tools.contains_key(&tool.name) {
            order.push(tool.name.clone());
        }
        tools.insert(tool.name.clone(), tool);

        Self {
            tools: Arc::new(tools),
            order: Arc::new(order),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Definitions in registration order.
    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tool descriptors for upstreams that register tools natively.
    pub fn schemas_json(&self) -> Vec<Value> {
        self.definitions()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    /// Invokes a tool by name. Never fails: unknown tools, handler errors and
    /// handler panics all become failed outcomes.
    pub async fn call(&self, name: &str, arguments: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool_name = %name, "Tool call for unregistered tool");
            return ToolOutcome::failure(crate::error::EngineError::UnknownTool(name.to_string()));
        };

        match AssertUnwindSafe(tool.handler.call(arguments)).catch_unwind().await {
            Ok(Ok(raw)) => ToolOutcome {
                result: normalize_result(raw),
                success: true,
            },
            Ok(Err(e)) => {
                tracing::warn!(tool_name = %name, error = %e, "Tool handler failed");
                ToolOutcome::failure(e)
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool_name = %name, panic = %message, "Tool handler panicked");
                ToolOutcome::failure(format!("Tool handler panicked: {message}"))
            }
        }
    }
}

/// Which side invokes tool handlers for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExecutionMode {
    /// The upstream runtime invokes handlers; its hooks drive events.
    Native,
    /// The engine invokes handlers when a `ToolCall` arrives.
    Bridged,
}

/// Configured preference, resolved against upstream capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolModePreference {
    #[default]
    Auto,
    Native,
    Bridged,
}

impl ToolModePreference {
    /// `Auto` uses native registration whenever the upstream offers it.
    /// Explicit `Native` falls back to bridging when it does not.
    #[must_use]
    pub fn resolve(self, upstream_supports_native: bool) -> ToolExecutionMode {
        match self {
            Self::Auto | Self::Native if upstream_supports_native => ToolExecutionMode::Native,
            _ => ToolExecutionMode::Bridged,
        }
    }
}

impl std::str::FromStr for ToolModePreference {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "bridged" | "bridge" => Ok(Self::Bridged),
            other => Err(crate::error::EngineError::Config(format!(
                "unknown tool mode `{other}` (expected auto, native or bridged)"
            ))),
        }
    }
}

/// Single entry point for both execution strategies.
#[derive(Debug, Clone)]
pub struct ToolBridge {
    mode: ToolExecutionMode,
    catalog: ToolCatalog,
}

impl ToolBridge {
    #[must_use]
    pub fn new(mode: ToolExecutionMode, catalog: ToolCatalog) -> Self {
        Self { mode, catalog }
    }

    #[must_use]
    pub fn mode(&self) -> ToolExecutionMode {
        self.mode
    }

    /// Whether the engine itself must run handlers for announced calls.
    #[must_use]
    pub fn executes_calls(&self) -> bool {
        self.mode == ToolExecutionMode::Bridged
    }

    /// Whether `name` is one of the session's application tools. Calls to
    /// anything else are left to the upstream.
    #[must_use]
    pub fn handles(&self, name: &str) -> bool {
        self.catalog.get(name).is_some()
    }

    /// Runs a handler in-process.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolOutcome {
        self.catalog.call(name, arguments).await
    }

    /// Normalizes a result reported by the upstream.
    #[must_use]
    pub fn upstream_outcome(&self, raw: Value, is_error: bool) -> ToolOutcome {
        let result = normalize_result(raw);
        let reported_failure = result.get("success").and_then(Value::as_bool) == Some(false);
        ToolOutcome {
            success: !is_error && !reported_failure,
            result,
        }
    }
}

/// Unwraps content-block results and decodes embedded JSON text.
///
/// `[{"type":"text","text":"{\"a\":1}"}]` becomes `{"a":1}`; text that is not
/// JSON stays a string. Anything else is returned untouched.
pub fn normalize_result(raw: Value) -> Value {
    match raw {
        Value::String(s) => decode_text(s),
        Value::Array(ref blocks) => match joined_text(blocks) {
            Some(text) => decode_text(text),
            None => raw,
        },
        Value::Object(ref obj) => {
            if let Some(structured) = obj
                .get("structuredContent")
                .or_else(|| obj.get("structured_content"))
                .filter(|v| !v.is_null())
            {
                return structured.clone();
            }
            match obj
                .get("content")
                .and_then(Value::as_array)
                .and_then(|blocks| joined_text(blocks))
            {
                Some(text) if obj.len() <= 2 => decode_text(text),
                _ => raw,
            }
        }
        other => other,
    }
}

fn joined_text(blocks: &[Value]) -> Option<String> {
    if blocks.is_empty() {
        return None;
    }
    let texts: Option<Vec<&str>> = blocks
        .iter()
        .map(|b| {
            (b.get("type").and_then(Value::as_str) == Some("text"))
                .then(|| b.get("text").and_then(Value::as_str))
                .flatten()
        })
        .collect();
    texts.map(|t| t.join("\n"))
}

fn decode_text(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new()
            .with_tool(ToolDefinition::from_fn(
                "add",
                "Adds two numbers",
                json!({ "type": "object" }),
                |args| async move {
                    let a = args["a"].as_i64().unwrap_or(0);
                    let b = args["b"].as_i64().unwrap_or(0);
                    Ok(json!({ "sum": a + b }))
                },
            ))
            .with_tool(ToolDefinition::from_fn(
                "explode",
                "Always fails",
                json!({ "type": "object" }),
                |_| async move { Err(anyhow::anyhow!("sheet is locked")) },
            ))
            .with_tool(ToolDefinition::from_fn(
                "crash",
                "Panics mid-call",
                json!({ "type": "object" }),
                |_| async move {
                    if true {
                        panic!("index out of range");
                    }
                    Ok(json!(null))
                },
            ))
    }

    #[tokio::test]
    async fn test_bridged_invoke_success() {
        let bridge = ToolBridge::new(ToolExecutionMode::Bridged, catalog());
        let outcome = bridge.invoke("add", json!({ "a": 2, "b": 3 })).await;
        assert!(outcome.success);
        assert_eq!(outcome.result, json!({ "sum": 5 }));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failed_result() {
        let bridge = ToolBridge::new(ToolExecutionMode::Bridged, catalog());
        let outcome = bridge.invoke("crash", json!({})).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.result,
            json!({ "success": false, "error": "Tool handler panicked: index out of range" })
        );
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_result() {
        let bridge = ToolBridge::new(ToolExecutionMode::Bridged, catalog());
        let outcome = bridge.invoke("explode", json!({})).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.result,
            json!({ "success": false, "error": "sheet is locked" })
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_result() {
        let outcome = catalog().call("missing", json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.result["error"], "Unknown tool: missing");
    }

    #[test]
    fn test_normalize_wrapped_json_text() {
        let raw = json!([{ "type": "text", "text": "{\"rows\":3}" }]);
        assert_eq!(normalize_result(raw), json!({ "rows": 3 }));
    }

    #[test]
    fn test_normalize_wrapped_plain_text() {
        let raw = json!({ "content": [{ "type": "text", "text": "not json" }] });
        assert_eq!(normalize_result(raw), json!("not json"));
    }

    #[test]
    fn test_normalize_prefers_structured_content() {
        let raw = json!({
            "content": [{ "type": "text", "text": "ignored" }],
            "structuredContent": { "ok": true }
        });
        assert_eq!(normalize_result(raw), json!({ "ok": true }));
    }

    #[test]
    fn test_normalize_leaves_mixed_blocks() {
        let raw = json!([{ "type": "text", "text": "a" }, { "type": "image", "data": "..." }]);
        assert_eq!(normalize_result(raw.clone()), raw);
        assert_eq!(normalize_result(json!({ "x": 1 })), json!({ "x": 1 }));
    }

    #[test]
    fn test_upstream_outcome_reads_success_flag() {
        let bridge = ToolBridge::new(ToolExecutionMode::Native, ToolCatalog::new());
        assert!(!bridge.upstream_outcome(json!({ "success": false }), false).success);
        assert!(!bridge.upstream_outcome(json!("boom"), true).success);
        assert!(bridge.upstream_outcome(json!("{\"n\":1}"), false).success);
        assert!(!bridge.executes_calls());
        assert!(!bridge.handles("add"));
        assert!(ToolBridge::new(ToolExecutionMode::Bridged, catalog()).handles("add"));
    }

    #[test]
    fn test_mode_preference_resolution() {
        assert_eq!(ToolModePreference::Auto.resolve(true), ToolExecutionMode::Native);
        assert_eq!(ToolModePreference::Auto.resolve(false), ToolExecutionMode::Bridged);
        assert_eq!(ToolModePreference::Native.resolve(false), ToolExecutionMode::Bridged);
        assert_eq!(ToolModePreference::Bridged.resolve(true), ToolExecutionMode::Bridged);
        assert_eq!("Bridge".parse::<ToolModePreference>().unwrap(), ToolModePreference::Bridged);
        assert!("sideways".parse::<ToolModePreference>().is_err());
    }

    #[test]
    fn test_catalog_order_and_schemas() {
        let catalog = catalog();
        let names: Vec<_> = catalog.definitions().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "explode"]);
        assert_eq!(catalog.schemas_json()[0]["name"], "add");
        assert_eq!(catalog.len(), 2);
    }
}
