use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// State key under which the executor records agents that completed.
pub const COMPLETED_AGENTS_KEY: &str = "_completed_agents";

/// Shared conversation state passed between stages.
///
/// Keys are strings; values are JSON. A `BTreeMap` keeps iteration order
/// stable so snapshots, diffs and logs are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    data: BTreeMap<String, serde_json::Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Merge fields into this state (overwrites on conflict).
    /// Returns the keys that were written.
    pub fn merge_fields(&mut self, fields: BTreeMap<String, serde_json::Value>) -> Vec<String> {
        let mut written = Vec::with_capacity(fields.len());
        for (k, v) in fields {
            written.push(k.clone());
            self.data.insert(k, v);
        }
        written
    }

    /// Copy of the listed keys that are present. Absent keys are omitted.
    pub fn slice(&self, keys: &[String]) -> SharedState {
        let data = keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        SharedState { data }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }

    pub fn into_map(self) -> BTreeMap<String, serde_json::Value> {
        self.data
    }

    /// Agents recorded as having completed in earlier runs.
    pub fn completed_agents(&self) -> Vec<String> {
        self.data
            .get(COMPLETED_AGENTS_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_agent_completed(&self, agent_id: &str) -> bool {
        self.completed_agents().iter().any(|a| a == agent_id)
    }

    /// Record an agent as completed (idempotent).
    pub fn mark_agent_completed(&mut self, agent_id: &str) {
        let mut agents = self.completed_agents();
        if !agents.iter().any(|a| a == agent_id) {
            agents.push(agent_id.to_string());
        }
        self.data.insert(
            COMPLETED_AGENTS_KEY.to_string(),
            serde_json::Value::from(agents),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut st = SharedState::new();
        st.set_str("vessel_name", "Nordic Star");
        st.set("speed_knots", json!(12.5));

        assert_eq!(st.get_str("vessel_name"), Some("Nordic Star"));
        assert_eq!(st.get("speed_knots"), Some(&json!(12.5)));
        assert!(st.get("missing").is_none());
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut st = SharedState::new();
        st.set_str("a", "1");
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), json!("2"));
        fields.insert("b".to_string(), json!(3));

        let written = st.merge_fields(fields);
        assert_eq!(written, vec!["a", "b"]);
        assert_eq!(st.get_str("a"), Some("2"));
        assert_eq!(st.get("b"), Some(&json!(3)));
    }

    #[test]
    fn test_slice_omits_absent_keys() {
        let mut st = SharedState::new();
        st.set_str("route", "r");
        st.set_str("prices", "p");

        let slice = st.slice(&["route".into(), "weather".into()]);
        assert_eq!(slice.len(), 1);
        assert!(slice.contains("route"));
        assert!(!slice.contains("weather"));
    }

    #[test]
    fn test_completed_agents_idempotent() {
        let mut st = SharedState::new();
        st.mark_agent_completed("route_agent");
        st.mark_agent_completed("route_agent");
        st.mark_agent_completed("bunker_agent");

        assert_eq!(st.completed_agents(), vec!["route_agent", "bunker_agent"]);
        assert!(st.is_agent_completed("bunker_agent"));
        assert!(!st.is_agent_completed("weather_agent"));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut st = SharedState::new();
        st.set("x", json!(1));
        assert_eq!(serde_json::to_string(&st).unwrap(), r#"{"x":1}"#);
    }
}
