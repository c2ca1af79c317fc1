//! Agent Stream CLI
//!
//! Replays a JSONL transcript of raw upstream messages through the engine and
//! prints the normalized events to stdout.

#![allow(clippy::missing_fields_in_debug)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::info;

use agent_stream::config::{AppConfig, Cli, OutputFormat};
use agent_stream::engine::{ReplayUpstream, StreamRequest, ToolCatalog, ToolDefinition};
use agent_stream::normalized::sse_event;
use agent_stream::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("Failed to load configuration")?;

    agent_stream::telemetry::init(&config.telemetry);

    let Some(transcript) = cli.transcript.as_deref() else {
        anyhow::bail!("No transcript given (use --transcript <file.jsonl> or TRANSCRIPT_FILE)");
    };

    let upstream = ReplayUpstream::from_jsonl(transcript)
        .await
        .with_context(|| format!("Failed to load transcript {}", transcript.display()))?
        .with_native_tools(cli.native_tools);

    info!(
        transcript = %transcript.display(),
        message_count = upstream.len(),
        tool_mode = ?config.engine.tool_mode,
        "Replaying transcript"
    );

    let manager = SessionManager::new(Arc::new(upstream), config.engine.clone());
    let request = StreamRequest::new(cli.prompt.clone()).with_tools(builtin_tools());
    let events = manager.start(cli.session_key.clone(), request);

    let stopper = manager.clone();
    let key = cli.session_key.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(session_key = %key, "Interrupted, stopping session");
            stopper.stop(&key);
        }
    });

    futures::pin_mut!(events);
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.next().await {
        let frame = match cli.output {
            OutputFormat::Sse => sse_event(&event),
            OutputFormat::Json => format!("{}\n", serde_json::to_string(&event)?),
        };
        stdout.write_all(frame.as_bytes()).await?;
    }
    stdout.flush().await?;

    Ok(())
}

/// Tools available to bridged replays.
fn builtin_tools() -> ToolCatalog {
    ToolCatalog::new()
        .with_tool(ToolDefinition::from_fn(
            "mirror",
            "Returns its arguments unchanged",
            json!({ "type": "object" }),
            |args| async move { Ok(args) },
        ))
        .with_tool(ToolDefinition::from_fn(
            "clock",
            "Returns the current UTC time",
            json!({ "type": "object", "properties": {} }),
            |_| async move { Ok(json!({ "now": chrono::Utc::now().to_rfc3339() })) },
        ))
}
