//! Agent Stream
//!
//! Normalizes the raw message stream of an upstream agent service into a
//! small, stable event vocabulary for a web application, and orchestrates the
//! tool calls made along the way.
//!
//! # Architecture
//!
//! - **Classification**: loosely typed upstream JSON becomes [`engine::RawMessage`]
//! - **Controller**: a per-session state machine turns raw messages into
//!   [`normalized::NormalizedEvent`]s with exactly one terminal `Finish`
//! - **Tools**: application tools run natively inside the upstream or are
//!   bridged and executed by the engine
//! - **Sessions**: [`session::SessionManager`] tracks live sessions and their
//!   cancellation
//!
//! # Modules
//!
//! - [`engine`]: classifier, accumulator, tool registry, citations, bridge and controller
//! - [`normalized`]: Unified streaming event model and SSE framing
//! - [`session`]: Live session table
//! - [`config`]: Layered configuration
//! - [`telemetry`]: Logging setup

#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod engine;
pub mod error;
pub mod normalized;
pub mod session;
pub mod telemetry;

pub use engine::{EngineSettings, StreamRequest, ToolCatalog, ToolDefinition, Upstream};
pub use error::EngineError;
pub use normalized::{NormalizedEvent, sse_event};
pub use session::SessionManager;
