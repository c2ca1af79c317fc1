//! Session lifecycle management.
//!
//! A session is one streaming interaction with the upstream, identified by a
//! caller-chosen key. [`SessionManager`] owns the table of live sessions and
//! their cancellation tokens.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use agent_stream::engine::{EngineSettings, ReplayUpstream, StreamRequest};
//! use agent_stream::session::SessionManager;
//!
//! let upstream = Arc::new(ReplayUpstream::from_messages(Vec::new()));
//! let manager = SessionManager::new(upstream, EngineSettings::default());
//!
//! let _events = manager.start("chat-1", StreamRequest::new("Hello!"));
//! assert!(manager.is_live("chat-1"));
//! assert!(manager.stop("chat-1"));
//! ```

mod manager;

pub use manager::{LiveSessionInfo, SessionManager};
