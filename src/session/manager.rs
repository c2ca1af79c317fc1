//! Live session table keyed by caller-chosen session keys.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{
    EngineSettings, SessionController, StreamRequest, ToolBridge, Upstream,
};
use crate::normalized::NormalizedEvent;

/// Snapshot of one running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveSessionInfo {
    pub key: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LiveSession {
    session_id: Uuid,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Starts, tracks and cancels streaming sessions.
///
/// At most one session runs per key. Starting a key that is already live
/// cancels the previous session first. Cloning is cheap and clones share the
/// same table.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    upstream: Arc<dyn Upstream>,
    settings: Arc<EngineSettings>,
    live: RwLock<HashMap<String, LiveSession>>,
}

impl ManagerInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, LiveSession>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, LiveSession>> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(upstream: Arc<dyn Upstream>, settings: EngineSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                upstream,
                settings: Arc::new(settings),
                live: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Starts a session under `key` and returns its normalized events.
    ///
    /// The session stays live until its `Finish` is yielded, its stream is
    /// dropped, or it is stopped. The returned stream always ends with exactly one
    /// [`NormalizedEvent::Finish`].
    pub fn start(
        &self,
        key: impl Into<String>,
        request: StreamRequest,
    ) -> impl Stream<Item = NormalizedEvent> + Send + 'static {
        let key = key.into();
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let previous = self.inner.write().insert(
            key.clone(),
            LiveSession {
                session_id,
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                session_key = %key,
                previous_session_id = %previous.session_id,
                session_id = %session_id,
                "Replacing live session"
            );
            previous.cancel.cancel();
        }

        let upstream = Arc::clone(&self.inner.upstream);
        let mode = request
            .tool_mode
            .unwrap_or(self.inner.settings.tool_mode)
            .resolve(upstream.supports_native_tools());
        let bridge = ToolBridge::new(mode, request.tools.clone());
        let controller = SessionController::new(
            key.clone(),
            session_id,
            bridge,
            Arc::clone(&self.inner.settings),
        );
        let events = controller.run(upstream, request, cancel);

        let guard = LiveGuard {
            inner: Arc::clone(&self.inner),
            key,
            session_id,
        };

        async_stream::stream! {
            let mut guard = Some(guard);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if event.is_finish() {
                    drop(guard.take());
                }
                yield event;
            }
        }
    }

    /// Cancels the session under `key`. Returns `false` if none was live.
    ///
    /// The session's stream still yields its terminal `Finish` when polled.
    pub fn stop(&self, key: &str) -> bool {
        let Some(session) = self.inner.write().remove(key) else {
            return false;
        };
        tracing::info!(
            session_key = %key,
            session_id = %session.session_id,
            "Stopping session"
        );
        session.cancel.cancel();
        true
    }

    /// Cancels every live session.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.inner.write().drain().collect();
        for (key, session) in &drained {
            tracing::info!(
                session_key = %key,
                session_id = %session.session_id,
                "Stopping session"
            );
            session.cancel.cancel();
        }
        drained.len()
    }

    #[must_use]
    pub fn is_live(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Live sessions ordered by start time.
    #[must_use]
    pub fn live_sessions(&self) -> Vec<LiveSessionInfo> {
        let mut sessions: Vec<_> = self
            .inner
            .read()
            .iter()
            .map(|(key, s)| LiveSessionInfo {
                key: key.clone(),
                session_id: s.session_id,
                started_at: s.started_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

/// Removes a session from the live table when its stream is dropped, unless
/// a newer session has taken over the key.
struct LiveGuard {
    inner: Arc<ManagerInner>,
    key: String,
    session_id: Uuid,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = self.inner.write();
        if live
            .get(&self.key)
            .is_some_and(|s| s.session_id == self.session_id)
        {
            live.remove(&self.key);
            tracing::debug!(
                session_key = %self.key,
                session_id = %self.session_id,
                "Session released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReplayUpstream;
    use serde_json::json;

    fn manager(messages: Vec<serde_json::Value>) -> SessionManager {
        SessionManager::new(
            Arc::new(ReplayUpstream::from_messages(messages)),
            EngineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_session_released_after_finish() {
        let manager = manager(vec![json!({ "type": "result", "result": "ok" })]);
        let events: Vec<_> = manager.start("k", StreamRequest::new("hi")).collect().await;

        assert!(events.last().is_some_and(NormalizedEvent::is_finish));
        assert!(!manager.is_live("k"));
    }

    #[tokio::test]
    async fn test_released_when_finish_is_yielded() {
        let manager = manager(vec![
            json!({ "type": "stream_event", "event": { "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": "ok" } } }),
            json!({ "type": "result" }),
        ]);
        let stream = manager.start("k", StreamRequest::new("hi"));
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            if event.is_finish() {
                break;
            }
            assert!(manager.is_live("k"));
        }

        assert!(!manager.is_live("k"));
        assert!(!manager.stop("k"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_live_until_dropped() {
        let manager = manager(vec![json!({ "type": "result" })]);
        let stream = manager.start("k", StreamRequest::new("hi"));

        assert!(manager.is_live("k"));
        let live = manager.live_sessions();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key, "k");

        drop(stream);
        assert!(!manager.is_live("k"));
    }

    #[tokio::test]
    async fn test_stop_unknown_key() {
        let manager = manager(Vec::new());
        assert!(!manager.stop("missing"));
    }

    #[tokio::test]
    async fn test_stop_before_polling_yields_only_finish() {
        let manager = manager(vec![json!({ "type": "result", "result": "never" })]);
        let stream = manager.start("k", StreamRequest::new("hi"));

        assert!(manager.stop("k"));
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_finish());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let manager = manager(Vec::new());
        let _a = manager.start("a", StreamRequest::new("x"));
        let _b = manager.start("b", StreamRequest::new("y"));

        assert_eq!(manager.stop_all(), 2);
        assert!(manager.live_sessions().is_empty());
    }
}
