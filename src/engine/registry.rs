//! Per-session correlation of tool announcements with their results.

use std::collections::HashMap;

use serde::Serialize;

/// Name recorded for results that carry neither a name nor an id.
const UNNAMED_TOOL: &str = "tool";

/// Lifecycle state of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Announced,
    Completed,
    Failed,
}

/// One tool invocation tracked for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub state: ToolCallState,
}

/// Outcome of [`ToolCallRegistry::announce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: String,
    /// `false` when this id was already announced earlier in the session.
    pub fresh: bool,
}

/// Outcome of [`ToolCallRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: String,
    pub name: String,
    /// State of the record before this resolution; `None` means no matching
    /// announcement existed and the record was created on the spot.
    pub previous: Option<ToolCallState>,
}

impl Resolution {
    /// The result had no discoverable announcement.
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.previous.is_none()
    }

    /// The matching call already has a terminal result.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.previous,
            Some(ToolCallState::Completed | ToolCallState::Failed)
        )
    }
}

/// Maps tool-call ids to names and pending state.
///
/// Ids supplied by the upstream win. Without one, the most recent id seen
/// for the same tool name is reused, and as a last resort `name-<n>` is
/// synthesized from a per-registry counter.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    records: HashMap<String, ToolCallRecord>,
    last_by_name: HashMap<String, String>,
    order: Vec<String>,
    counter: u64,
}

impl ToolCallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an announced call and returns the id to emit.
    ///
    /// The last id for `name` is only reused while that call is still
    /// pending, so two consecutive id-less calls of the same tool stay
    /// distinct.
    pub fn announce(
        &mut self,
        name: &str,
        supplied_id: Option<&str>,
        arguments: serde_json::Value,
    ) -> Announcement {
        let id = supplied_id
            .map(ToString::to_string)
            .or_else(|| {
                self.last_by_name
                    .get(name)
                    .filter(|id| {
                        self.records
                            .get(id.as_str())
                            .is_some_and(|r| r.state == ToolCallState::Announced)
                    })
                    .cloned()
            })
            .unwrap_or_else(|| self.synthesize(name));

        self.last_by_name.insert(name.to_string(), id.clone());

        if let Some(record) = self.records.get_mut(&id) {
            if is_empty_arguments(&record.arguments) {
                record.arguments = arguments;
            }
            return Announcement { id, fresh: false };
        }

        self.insert(ToolCallRecord {
            id: id.clone(),
            name: name.to_string(),
            arguments,
            result: None,
            state: ToolCallState::Announced,
        });
        Announcement { id, fresh: true }
    }

    /// Finds the call a result belongs to.
    ///
    /// A supplied id is matched exactly, so a second result for a finished
    /// call reports as a duplicate. Without one, the last id registered for
    /// `name` is used while it is pending, then the oldest pending call of
    /// that name. When nothing matches, a fresh id is synthesized and
    /// registered so the result is never dropped.
    pub fn resolve(&mut self, name: Option<&str>, supplied_id: Option<&str>) -> Resolution {
        let name = name.unwrap_or(UNNAMED_TOOL);
        let id = match supplied_id {
            Some(id) => id.to_string(),
            None => self.pending_for(name).unwrap_or_else(|| self.synthesize(name)),
        };

        if let Some(record) = self.records.get(&id) {
            return Resolution {
                name: record.name.clone(),
                previous: Some(record.state),
                id,
            };
        }

        self.last_by_name.insert(name.to_string(), id.clone());
        self.insert(ToolCallRecord {
            id: id.clone(),
            name: name.to_string(),
            arguments: serde_json::Value::Object(serde_json::Map::new()),
            result: None,
            state: ToolCallState::Announced,
        });
        Resolution {
            id,
            name: name.to_string(),
            previous: None,
        }
    }

    /// Stores the terminal result for `id`.
    pub fn complete(&mut self, id: &str, result: serde_json::Value, success: bool) {
        if let Some(record) = self.records.get_mut(id) {
            record.result = Some(result);
            record.state = if success {
                ToolCallState::Completed
            } else {
                ToolCallState::Failed
            };
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ToolCallRecord> {
        self.records.get(id)
    }

    /// Finds a call without registering anything: by id, then by the last
    /// id seen for `name`.
    #[must_use]
    pub fn lookup(
        &self,
        name: Option<&str>,
        supplied_id: Option<&str>,
    ) -> Option<&ToolCallRecord> {
        supplied_id
            .and_then(|id| self.records.get(id))
            .or_else(|| {
                name.and_then(|n| self.last_by_name.get(n))
                    .and_then(|id| self.records.get(id))
            })
    }

    /// Calls announced but never resolved, in announcement order.
    pub fn unmatched(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.state == ToolCallState::Announced)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn pending_for(&self, name: &str) -> Option<String> {
        let is_pending = |id: &String| {
            self.records
                .get(id)
                .is_some_and(|r| r.name == name && r.state == ToolCallState::Announced)
        };
        self.last_by_name
            .get(name)
            .filter(|id| is_pending(id))
            .or_else(|| self.order.iter().find(|id| is_pending(id)))
            .cloned()
    }

    fn insert(&mut self, record: ToolCallRecord) {
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    fn synthesize(&mut self, name: &str) -> String {
        loop {
            self.counter += 1;
            let id = format!("{name}-{}", self.counter);
            if !self.records.contains_key(&id) {
                return id;
            }
        }
    }
}

fn is_empty_arguments(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_supplied_id_round_trip() {
        let mut reg = ToolCallRegistry::new();
        let ann = reg.announce("search", Some("t1"), json!({ "q": "rust" }));
        assert_eq!(ann, Announcement { id: "t1".to_string(), fresh: true });

        let res = reg.resolve(Some("search"), Some("t1"));
        assert_eq!(res.id, "t1");
        assert_eq!(res.previous, Some(ToolCallState::Announced));
    }

    #[test]
    fn test_result_without_id_falls_back_to_name() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("search", Some("t1"), json!({}));

        let res = reg.resolve(Some("search"), None);
        assert_eq!(res.id, "t1");
        assert!(!res.is_orphan());
    }

    #[test]
    fn test_synthesized_ids_are_sequential() {
        let mut reg = ToolCallRegistry::new();
        let first = reg.announce("calc", None, json!({}));
        assert_eq!(first.id, "calc-1");
        reg.complete(&first.id, json!(2), true);

        let second = reg.announce("calc", None, json!({}));
        assert_eq!(second.id, "calc-2");
        assert!(second.fresh);
    }

    #[test]
    fn test_pending_id_is_reused_for_same_name() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("read_sheet", Some("abc"), json!({}));

        let hook = reg.announce("read_sheet", None, json!({ "range": "A1:B2" }));
        assert_eq!(hook.id, "abc");
        assert!(!hook.fresh);
        assert_eq!(
            reg.get("abc").map(|r| r.arguments.clone()),
            Some(json!({ "range": "A1:B2" }))
        );
    }

    #[test]
    fn test_orphan_result_gets_fresh_id() {
        let mut reg = ToolCallRegistry::new();
        let res = reg.resolve(Some("fetch"), None);
        assert_eq!(res.id, "fetch-1");
        assert!(res.is_orphan());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_resolution_detected() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("search", Some("t1"), json!({}));
        reg.complete("t1", json!({ "ok": true }), true);

        let res = reg.resolve(Some("search"), Some("t1"));
        assert!(res.is_duplicate());
    }

    #[test]
    fn test_unmatched_in_order() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("a", Some("1"), json!({}));
        reg.announce("b", Some("2"), json!({}));
        reg.announce("c", Some("3"), json!({}));
        reg.complete("2", json!(null), false);

        let pending: Vec<_> = reg.unmatched().map(|r| r.id.as_str()).collect();
        assert_eq!(pending, vec!["1", "3"]);
        assert_eq!(reg.get("2").map(|r| r.state), Some(ToolCallState::Failed));
    }

    #[test]
    fn test_lookup_does_not_register() {
        let mut reg = ToolCallRegistry::new();
        assert!(reg.lookup(Some("search"), None).is_none());
        assert!(reg.is_empty());

        reg.announce("search", Some("s1"), json!({}));
        assert_eq!(reg.lookup(Some("search"), None).map(|r| r.id.as_str()), Some("s1"));
        assert_eq!(reg.lookup(None, Some("s1")).map(|r| r.name.as_str()), Some("search"));
    }

    #[test]
    fn test_synthesized_id_skips_taken_ids() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("calc", Some("calc-1"), json!({}));
        reg.complete("calc-1", json!(1), true);

        let next = reg.announce("calc", None, json!({}));
        assert_eq!(next.id, "calc-2");
    }

    #[test]
    fn test_idless_results_pair_with_each_pending_call() {
        let mut reg = ToolCallRegistry::new();
        reg.announce("lookup", Some("a"), json!({}));
        reg.announce("lookup", Some("b"), json!({}));

        let first = reg.resolve(Some("lookup"), None);
        assert_eq!(first.id, "b");
        reg.complete(&first.id, json!("r1"), true);

        let second = reg.resolve(Some("lookup"), None);
        assert_eq!(second.id, "a");
        assert!(!second.is_duplicate());
        reg.complete(&second.id, json!("r2"), true);

        let third = reg.resolve(Some("lookup"), None);
        assert!(third.is_orphan());
        assert_eq!(reg.unmatched().count(), 1);
    }

    #[test]
    fn test_nameless_orphan_uses_one_fallback_name() {
        let mut reg = ToolCallRegistry::new();
        let res = reg.resolve(None, None);
        assert_eq!(res.id, "tool-1");
        assert_eq!(res.name, "tool");
        assert_eq!(reg.get("tool-1").map(|r| r.name.as_str()), Some("tool"));
    }
}
