use agent_stream::config::{AppConfig, DEFAULT_CONFIG_FILE, LogFormat};
use agent_stream::engine::ToolModePreference;
use serial_test::serial;
use std::env;
use std::fs;

const ENV_VARS: &[&str] = &[
    "CONFIG_FILE",
    "TOOL_MODE",
    "LOG_FILTER",
    "TRANSCRIPT_FILE",
    "AGENT_STREAM_ENGINE__TOOL_MODE",
    "AGENT_STREAM_ENGINE__WEB_SEARCH_TOOLS",
    "AGENT_STREAM_ENGINE__FINAL_CITATION_PASS",
    "AGENT_STREAM_TELEMETRY__FORMAT",
];

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    for var in ENV_VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn load(args: &[&str]) -> AppConfig {
    let argv = std::iter::once("agent-stream").chain(args.iter().copied());
    AppConfig::load_from_args(argv)
        .expect("Failed to load config")
        .0
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = load(&[]);
    assert_eq!(config.engine.tool_mode, ToolModePreference::Auto);
    assert_eq!(config.engine.web_search_tools, vec!["web_search", "WebSearch"]);
    assert!(config.engine.final_citation_pass);
    assert_eq!(config.telemetry.filter, "info,agent_stream=debug");
    assert_eq!(config.telemetry.format, LogFormat::Compact);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("AGENT_STREAM_ENGINE__TOOL_MODE", "bridged");
        env::set_var("AGENT_STREAM_ENGINE__FINAL_CITATION_PASS", "false");
        env::set_var("AGENT_STREAM_ENGINE__WEB_SEARCH_TOOLS", "search,browse");
        env::set_var("AGENT_STREAM_TELEMETRY__FORMAT", "json");
    }

    let config = load(&[]);
    assert_eq!(config.engine.tool_mode, ToolModePreference::Bridged);
    assert!(!config.engine.final_citation_pass);
    assert_eq!(config.engine.web_search_tools, vec!["search", "browse"]);
    assert_eq!(config.telemetry.format, LogFormat::Json);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let config_content = r"
engine:
  tool_mode: native
  web_search_tools: [web_search, lookup]
telemetry:
  filter: warn
";
    let file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    fs::write(file.path(), config_content).expect("Failed to write temp config");

    // Tell AppConfig to use this file via Env Var
    unsafe {
        env::set_var("CONFIG_FILE", file.path());
    }

    let config = load(&[]);
    assert_eq!(config.engine.tool_mode, ToolModePreference::Native);
    assert_eq!(config.engine.web_search_tools, vec!["web_search", "lookup"]);
    assert!(config.engine.final_citation_pass);
    assert_eq!(config.telemetry.filter, "warn");

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_overrides_env_and_file() {
    clear_env_vars();

    let file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("Failed to create temp config");
    fs::write(file.path(), "engine:\n  tool_mode: native\n").expect("Failed to write temp config");
    unsafe {
        env::set_var("AGENT_STREAM_ENGINE__TOOL_MODE", "auto");
    }

    let path = file.path().to_string_lossy().to_string();
    let config = load(&["--config", &path, "--tool-mode", "bridge", "--log-filter", "debug"]);
    assert_eq!(config.engine.tool_mode, ToolModePreference::Bridged);
    assert_eq!(config.telemetry.filter, "debug");

    clear_env_vars();
}

#[test]
#[serial]
fn test_invalid_tool_mode_rejected() {
    clear_env_vars();

    let err = AppConfig::load_from_args(["agent-stream", "--tool-mode", "sideways"]).unwrap_err();
    assert!(err.to_string().contains("sideways"));
}

#[test]
#[serial]
fn test_missing_explicit_config_file_fails() {
    clear_env_vars();

    let result =
        AppConfig::load_from_args(["agent-stream", "--config", "/no/such/agent-stream.yaml"]);
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    fs::write(
        dir.path().join(DEFAULT_CONFIG_FILE),
        "engine:\n  final_citation_pass: false\n",
    )
    .expect("Failed to write ./agent-stream.yaml");

    let previous = env::current_dir().expect("cwd");
    env::set_current_dir(dir.path()).expect("chdir");
    let result = AppConfig::load_from_args(["agent-stream"]);
    env::set_current_dir(previous).expect("restore cwd");

    let config = result.expect("Failed to load config").0;
    assert!(!config.engine.final_citation_pass);
}
