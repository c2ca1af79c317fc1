use crate::engine::{EngineSettings, ToolModePreference};
use clap::{Parser, ValueEnum};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "agent-stream.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// JSONL transcript of raw upstream messages to replay
    #[arg(short, long, env = "TRANSCRIPT_FILE")]
    pub transcript: Option<PathBuf>,

    /// Session key to run the replay under
    #[arg(long, default_value = "replay")]
    pub session_key: String,

    /// Prompt passed to the upstream
    #[arg(long, default_value = "")]
    pub prompt: String,

    /// Tool execution mode: auto, native or bridged
    #[arg(long, env = "TOOL_MODE")]
    pub tool_mode: Option<String>,

    /// Advertise native tool support on the replay upstream
    #[arg(long)]
    pub native_tools: bool,

    /// Log filter directive, e.g. `info,agent_stream=trace`
    #[arg(long, env = "LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Output format for normalized events
    #[arg(long, value_enum, default_value_t = OutputFormat::Sse)]
    pub output: OutputFormat,
}

/// How the CLI prints normalized events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `event:`/`data:` frames
    Sse,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub filter: String,
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args()).map(|(config, _)| config)
    }

    /// Parses `args` and builds the layered configuration.
    ///
    /// Priority: CLI flag > CLI env var > `AGENT_STREAM_*` env > config file >
    /// defaults.
    pub fn load_from_args<I, T>(args: I) -> Result<(Self, Cli), config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        let config = Self::from_cli(&cli)?;
        Ok((config, cli))
    }

    /// Builds the configuration for an already parsed command line.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // 1. Defaults
        let defaults = EngineSettings::default();
        builder = builder
            .set_default("engine.tool_mode", "auto")?
            .set_default("engine.web_search_tools", defaults.web_search_tools)?
            .set_default("engine.final_citation_pass", defaults.final_citation_pass)?
            .set_default("telemetry.filter", "info,agent_stream=debug")?
            .set_default("telemetry.format", "compact")?;

        // 2. Config file: explicit path must exist, the cwd fallback is optional
        let (path, required) = match cli.config.as_deref() {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        builder = builder.add_source(
            File::from(path)
                .format(FileFormat::Yaml)
                .required(required),
        );

        // 3. Environment, e.g. AGENT_STREAM_ENGINE__TOOL_MODE=bridged
        builder = builder.add_source(
            Environment::with_prefix("AGENT_STREAM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.web_search_tools")
                .try_parsing(true),
        );

        // 4. CLI overrides
        if let Some(mode) = cli.tool_mode.as_deref() {
            let mode = mode
                .parse::<ToolModePreference>()
                .map_err(|e| config::ConfigError::Message(e.to_string()))?;
            builder = builder.set_override("engine.tool_mode", tool_mode_key(mode))?;
        }
        if let Some(filter) = cli.log_filter.as_deref() {
            builder = builder.set_override("telemetry.filter", filter)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

fn tool_mode_key(mode: ToolModePreference) -> &'static str {
    match mode {
        ToolModePreference::Auto => "auto",
        ToolModePreference::Native => "native",
        ToolModePreference::Bridged => "bridged",
    }
}
