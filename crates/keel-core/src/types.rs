use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KeelError, Result};

/// Conversation thread identifier; checkpoints are grouped by thread.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap a trusted id without checking it. Store operations still call
    /// [`validate`](Self::validate) before building keys from it.
    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Parse an id from untrusted input (CLI, HTTP).
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Thread ids become one segment of colon-delimited store keys and glob
    /// patterns, so separators and glob metacharacters are rejected.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.0.is_empty() {
            Some("must not be empty".to_string())
        } else {
            self.0
                .chars()
                .find(|c| {
                    matches!(c, ':' | '*' | '?' | '[' | ']' | '\\')
                        || c.is_whitespace()
                        || c.is_control()
                })
                .map(|c| format!("contains reserved character {:?}", c))
        };
        match reason {
            Some(reason) => Err(KeelError::InvalidThreadId {
                id: self.0.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a fresh correlation id for a run.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// How a degraded result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationSource {
    /// A previously cached successful result for equivalent inputs.
    Cached,
    /// A cheaper approximation computed from inputs already in hand.
    Approximated,
    /// Nothing usable; the value only states that data is missing.
    InsufficientData,
}

/// A lower-confidence substitute for a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedResult {
    pub value: serde_json::Value,
    pub reason: String,
    pub source: DegradationSource,
}

impl DegradedResult {
    pub fn new(value: serde_json::Value, reason: impl Into<String>, source: DegradationSource) -> Self {
        Self {
            value,
            reason: reason.into(),
            source,
        }
    }

    /// Render as JSON carrying the `_degraded` / `_degradation_reason` markers.
    ///
    /// Object values get the markers spliced in; any other value is wrapped
    /// under a `value` key.
    pub fn to_marked_json(&self) -> serde_json::Value {
        let mut obj = match &self.value {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other.clone());
                map
            }
        };
        obj.insert("_degraded".into(), serde_json::Value::Bool(true));
        obj.insert(
            "_degradation_reason".into(),
            serde_json::Value::String(self.reason.clone()),
        );
        obj.insert(
            "_degradation_source".into(),
            serde_json::to_value(self.source).unwrap_or(serde_json::Value::Null),
        );
        serde_json::Value::Object(obj)
    }
}

/// Outcome of a tool call routed through the resilience layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The tool answered normally.
    Ok(serde_json::Value),
    /// The tool could not answer; a fallback substituted a degraded value.
    Degraded(DegradedResult),
}

impl ToolOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ToolOutcome::Degraded(_))
    }

    /// The value to hand downstream. Degraded values carry their markers.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            ToolOutcome::Ok(v) => v,
            ToolOutcome::Degraded(d) => d.to_marked_json(),
        }
    }
}

/// Returns true if a JSON value carries the `_degraded` marker.
pub fn is_marked_degraded(value: &serde_json::Value) -> bool {
    value
        .get("_degraded")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Status of a stage invocation as reported on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// Observability events.
///
/// Every event carries the correlation id of the run it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeelEvent {
    RunStarted {
        correlation_id: String,
        plan_id: String,
        query_type: String,
        stage_count: usize,
    },
    AgentExecution {
        correlation_id: String,
        stage_id: String,
        agent_id: String,
        status: StageStatus,
        attempt: u32,
        duration_ms: u64,
    },
    ToolCall {
        correlation_id: String,
        tool: String,
        succeeded: bool,
        degraded: bool,
        duration_ms: u64,
    },
    StateChange {
        correlation_id: String,
        stage_id: String,
        keys: Vec<String>,
    },
    CheckpointOperation {
        correlation_id: String,
        thread_id: String,
        operation: String,
        succeeded: bool,
        detail: Option<String>,
    },
    Error {
        correlation_id: String,
        source: String,
        message: String,
    },
    RunComplete {
        correlation_id: String,
        plan_id: String,
        success: bool,
        duration_ms: u64,
    },
}

impl KeelEvent {
    pub fn correlation_id(&self) -> &str {
        match self {
            KeelEvent::RunStarted { correlation_id, .. }
            | KeelEvent::AgentExecution { correlation_id, .. }
            | KeelEvent::ToolCall { correlation_id, .. }
            | KeelEvent::StateChange { correlation_id, .. }
            | KeelEvent::CheckpointOperation { correlation_id, .. }
            | KeelEvent::Error { correlation_id, .. }
            | KeelEvent::RunComplete { correlation_id, .. } => correlation_id,
        }
    }

    /// Snake-case event kind, as used in the JSONL log.
    pub fn kind(&self) -> &'static str {
        match self {
            KeelEvent::RunStarted { .. } => "run_started",
            KeelEvent::AgentExecution { .. } => "agent_execution",
            KeelEvent::ToolCall { .. } => "tool_call",
            KeelEvent::StateChange { .. } => "state_change",
            KeelEvent::CheckpointOperation { .. } => "checkpoint_operation",
            KeelEvent::Error { .. } => "error",
            KeelEvent::RunComplete { .. } => "run_complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thread_id_parse_rejects_key_separators() {
        assert!(ThreadId::parse("voyage-42").is_ok());
        assert!(ThreadId::parse(&ThreadId::new().to_string()).is_ok());
        for bad in ["", "a:b", "a*", "a?", "[a]", "a b", "a\\b"] {
            assert!(
                matches!(ThreadId::parse(bad), Err(KeelError::InvalidThreadId { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn degraded_markers_on_object() {
        let d = DegradedResult::new(
            json!({"distance_nm": 120.5}),
            "route service unavailable",
            DegradationSource::Approximated,
        );
        let v = d.to_marked_json();
        assert_eq!(v["distance_nm"], json!(120.5));
        assert_eq!(v["_degraded"], json!(true));
        assert_eq!(v["_degradation_reason"], json!("route service unavailable"));
        assert_eq!(v["_degradation_source"], json!("approximated"));
        assert!(is_marked_degraded(&v));
    }

    #[test]
    fn degraded_markers_on_scalar() {
        let d = DegradedResult::new(json!(42), "stale", DegradationSource::Cached);
        let v = d.to_marked_json();
        assert_eq!(v["value"], json!(42));
        assert!(is_marked_degraded(&v));
    }

    #[test]
    fn ok_outcome_passes_through() {
        let out = ToolOutcome::Ok(json!({"price": 610}));
        assert!(!out.is_degraded());
        assert!(!is_marked_degraded(&out.into_json()));
    }

    #[test]
    fn event_kind_and_correlation() {
        let e = KeelEvent::StateChange {
            correlation_id: "c-1".into(),
            stage_id: "s1".into(),
            keys: vec!["route".into()],
        };
        assert_eq!(e.kind(), "state_change");
        assert_eq!(e.correlation_id(), "c-1");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"state_change\""));
    }
}
