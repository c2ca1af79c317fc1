//! Error types for the streaming engine.

/// Errors raised by the engine and its upstream adapters.
///
/// None of these reach the application as a panic: inside a running session
/// every variant is converted into a terminal `Error` + `Finish` pair.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The upstream agent service failed to open or dropped the stream.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A recorded transcript line could not be parsed.
    #[error("Invalid transcript at line {line}: {message}")]
    Transcript { line: usize, message: String },

    /// No tool with this name is registered for the session.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Invalid engine configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O error occurred while reading a transcript.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Creates an upstream error from any displayable message.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Short machine-readable code attached to `Error` events.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "UPSTREAM",
            Self::Transcript { .. } => "TRANSCRIPT",
            Self::UnknownTool(_) => "UNKNOWN_TOOL",
            Self::Config(_) => "CONFIG",
            Self::Io(_) => "IO",
            Self::Json(_) => "JSON",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_code() {
        let err = EngineError::upstream("connection reset");
        assert_eq!(err.to_string(), "Upstream error: connection reset");
        assert_eq!(err.code(), "UPSTREAM");

        let err = EngineError::Transcript {
            line: 3,
            message: "expected value".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid transcript at line 3: expected value");
    }

    #[test]
    fn test_from_json_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = parse.into();
        assert_eq!(err.code(), "JSON");
    }
}
