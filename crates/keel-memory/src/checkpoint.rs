use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;
use keel_core::traits::KvStore;
use keel_core::types::ThreadId;

use crate::compress::{CompressedState, CompressionStats, StateCompressor, STATE_REF_PREFIX};
use crate::delta::{compute_delta, DeltaSummary};

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Key holding the timestamp of the most recent checkpoint write.
pub const LAST_WRITE_KEY: &str = "meta:checkpoint_last_write";

const CHECKPOINT_PREFIX: &str = "checkpoint";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Stage ids completed when the snapshot was taken.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    #[serde(default)]
    pub delta: Option<DeltaSummary>,
    #[serde(default)]
    pub stats: Option<CompressionStats>,
}

/// Durable snapshot of one thread's state at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub v: u32,
    pub id: String,
    pub ts: DateTime<Utc>,
    pub thread_id: String,
    /// 1-based, increasing per thread.
    pub step: u64,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub channel_values: CompressedState,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

/// Listing entry for history browsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub step: u64,
    pub ts: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub field_count: usize,
    pub plan_id: Option<String>,
}

impl From<&Checkpoint> for CheckpointInfo {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            step: cp.step,
            ts: cp.ts,
            parent_id: cp.parent_id.clone(),
            field_count: cp.channel_values.len(),
            plan_id: cp.metadata.plan_id.clone(),
        }
    }
}

/// State restored from a checkpoint, ready to resume from.
#[derive(Debug, Clone)]
pub struct RecoveredContext {
    pub thread_id: ThreadId,
    pub checkpoint_id: String,
    pub step: u64,
    pub state: SharedState,
    /// Fields whose externalized value was missing or expired.
    pub missing_fields: Vec<String>,
    pub metadata: CheckpointMetadata,
}

/// Structural integrity check of a raw checkpoint before it is trusted.
pub fn validate_checkpoint(raw: &serde_json::Value) -> Result<()> {
    let fail = |reason: String| Err(KeelError::CheckpointIntegrity { reason });

    let Some(obj) = raw.as_object() else {
        return fail("checkpoint is not an object".into());
    };

    match obj.get("v").and_then(|v| v.as_u64()) {
        Some(v) if (1..=CHECKPOINT_VERSION as u64).contains(&v) => {}
        Some(v) => return fail(format!("unsupported schema version {}", v)),
        None => return fail("missing or non-integer field 'v'".into()),
    }

    for field in ["id", "thread_id"] {
        match obj.get(field).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => {}
            _ => return fail(format!("missing or empty string field '{}'", field)),
        }
    }

    match obj.get("ts").and_then(|v| v.as_str()) {
        Some(ts) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
        Some(ts) => return fail(format!("unparseable timestamp '{}'", ts)),
        None => return fail("missing field 'ts'".into()),
    }

    if obj.get("step").and_then(|v| v.as_u64()).is_none() {
        return fail("missing or non-integer field 'step'".into());
    }

    let Some(values) = obj.get("channel_values").and_then(|v| v.as_object()) else {
        return fail("missing or non-object field 'channel_values'".into());
    };

    for (name, entry) in values {
        let Some(tagged) = entry.as_object().filter(|m| m.len() == 1) else {
            return fail(format!("channel '{}' is not a tagged field", name));
        };
        if tagged.contains_key("inline") {
            continue;
        }
        let Some(reference) = tagged.get("reference").and_then(|r| r.as_object()) else {
            return fail(format!("channel '{}' has unknown field kind", name));
        };
        let key_ok = reference
            .get("key")
            .and_then(|k| k.as_str())
            .is_some_and(|k| k.starts_with(STATE_REF_PREFIX));
        let size_ok = reference.get("size_bytes").is_some_and(|s| s.is_u64());
        if !key_ok || !size_ok {
            return fail(format!("channel '{}' has a malformed reference", name));
        }
    }

    if let Some(meta) = obj.get("metadata") {
        if !meta.is_object() {
            return fail("field 'metadata' is not an object".into());
        }
    }

    Ok(())
}

/// Saves, lists, recovers and purges thread checkpoints.
///
/// Checkpoints live in the key-value store under
/// `checkpoint:<thread>:<step>` with no expiry; large fields are
/// externalized by the [`StateCompressor`] under `state_ref:<thread>:...`.
pub struct Checkpointer {
    store: Arc<dyn KvStore>,
    compressor: StateCompressor,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn KvStore>, compressor: StateCompressor) -> Self {
        Self { store, compressor }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn key(thread_id: &ThreadId, step: u64) -> String {
        format!("{}:{}:{:010}", CHECKPOINT_PREFIX, thread_id, step)
    }

    /// Checkpoint keys of exactly this thread, ascending by step.
    async fn thread_keys(&self, thread_id: &ThreadId) -> Result<Vec<String>> {
        thread_id.validate()?;
        let prefix = format!("{}:{}:", CHECKPOINT_PREFIX, thread_id);
        let mut keys: Vec<String> = self
            .store
            .keys(&format!("{}*", prefix))
            .await?
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&prefix).is_some_and(|step| {
                    step.len() == 10 && step.bytes().all(|b| b.is_ascii_digit())
                })
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Snapshot `state` as the next step of the thread.
    pub async fn save(
        &self,
        thread_id: &ThreadId,
        state: &SharedState,
        mut metadata: CheckpointMetadata,
    ) -> Result<Checkpoint> {
        let (channel_values, stats) = self.compressor.compress(state, thread_id).await?;

        let parent = match self.latest_checkpoint(thread_id).await {
            Ok(parent) => parent,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Could not read parent checkpoint");
                None
            }
        };

        metadata.delta = parent
            .as_ref()
            .map(|p| compute_delta(&p.channel_values, &channel_values));
        metadata.stats = Some(stats);

        let checkpoint = Checkpoint {
            v: CHECKPOINT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            thread_id: thread_id.to_string(),
            step: parent.as_ref().map_or(1, |p| p.step + 1),
            parent_id: parent.map(|p| p.id),
            channel_values,
            metadata,
        };

        let raw = serde_json::to_string(&checkpoint)?;
        self.store
            .set(&Self::key(thread_id, checkpoint.step), raw, None)
            .await?;
        if let Err(e) = self
            .store
            .set(LAST_WRITE_KEY, checkpoint.ts.to_rfc3339(), None)
            .await
        {
            warn!(error = %e, "Failed to record checkpoint freshness");
        }

        debug!(
            thread_id = %thread_id,
            step = checkpoint.step,
            checkpoint_id = %checkpoint.id,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// All checkpoints of a thread, ascending by step.
    pub async fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<CheckpointInfo>> {
        let mut infos: Vec<CheckpointInfo> = self
            .load_all(thread_id)
            .await?
            .iter()
            .map(CheckpointInfo::from)
            .collect();
        infos.sort_by_key(|i| i.step);
        Ok(infos)
    }

    /// Restore a thread to the given checkpoint. `checkpoint_id` may be the
    /// checkpoint's id or its step number.
    pub async fn recover_from_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &str,
    ) -> Result<RecoveredContext> {
        thread_id.validate()?;
        let key = self.resolve_key(thread_id, checkpoint_id).await?;
        let not_found = || KeelError::CheckpointNotFound {
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
        };

        let raw = self.store.get(&key).await?.ok_or_else(not_found)?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| KeelError::CheckpointIntegrity {
                reason: format!("checkpoint is not valid JSON: {}", e),
            })?;
        validate_checkpoint(&value)?;

        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(|e| KeelError::CheckpointIntegrity {
                reason: e.to_string(),
            })?;
        if checkpoint.thread_id != thread_id.as_str() {
            return Err(KeelError::CheckpointIntegrity {
                reason: format!(
                    "checkpoint belongs to thread {}, not {}",
                    checkpoint.thread_id, thread_id
                ),
            });
        }

        let decompressed = self.compressor.decompress(&checkpoint.channel_values).await?;

        info!(
            thread_id = %thread_id,
            step = checkpoint.step,
            missing = decompressed.missing_fields.len(),
            "Recovered from checkpoint"
        );

        Ok(RecoveredContext {
            thread_id: thread_id.clone(),
            checkpoint_id: checkpoint.id,
            step: checkpoint.step,
            state: decompressed.state,
            missing_fields: decompressed.missing_fields,
            metadata: checkpoint.metadata,
        })
    }

    /// Recover from the most recent checkpoint, if the thread has any.
    pub async fn recover_latest(&self, thread_id: &ThreadId) -> Result<Option<RecoveredContext>> {
        let keys = self.thread_keys(thread_id).await?;
        match keys.last() {
            Some(key) => {
                let step = key.rsplit(':').next().unwrap_or_default();
                self.recover_from_checkpoint(thread_id, step).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Remove every checkpoint and externalized field of a thread.
    pub async fn delete_thread(&self, thread_id: &ThreadId) -> Result<usize> {
        let mut keys = self.thread_keys(thread_id).await?;
        keys.extend(
            self.store
                .keys(&format!("{}:{}:*", STATE_REF_PREFIX, thread_id))
                .await?,
        );

        let mut deleted = 0;
        for key in &keys {
            if self.store.del(key).await? {
                deleted += 1;
            }
        }

        info!(thread_id = %thread_id, deleted, "Thread purged");
        Ok(deleted)
    }

    async fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>> {
        let keys = self.thread_keys(thread_id).await?;
        let Some(key) = keys.last() else {
            return Ok(None);
        };
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        let keys = self.thread_keys(thread_id).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(cp) => out.push(cp),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(out)
    }

    async fn resolve_key(&self, thread_id: &ThreadId, checkpoint_id: &str) -> Result<String> {
        if let Ok(step) = checkpoint_id.parse::<u64>() {
            return Ok(Self::key(thread_id, step));
        }
        self.load_all(thread_id)
            .await?
            .into_iter()
            .find(|cp| cp.id == checkpoint_id)
            .map(|cp| Self::key(thread_id, cp.step))
            .ok_or_else(|| KeelError::CheckpointNotFound {
                thread_id: thread_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, SqliteKv};
    use serde_json::json;
    use std::time::Duration;

    fn checkpointer(store: Arc<dyn KvStore>) -> Checkpointer {
        let compressor = StateCompressor::new(store.clone(), 128, Duration::from_secs(3600))
            .with_inline_keys(["correlation_id".to_string()]);
        Checkpointer::new(store, compressor)
    }

    fn state_at(step: u64) -> SharedState {
        let mut st = SharedState::new();
        st.set_str("correlation_id", "c-1");
        st.set("step", json!(step));
        st.set(
            "route_data",
            json!({ "waypoints": vec![json!({"lat": 1.0, "lon": 103.8}); 20] }),
        );
        st
    }

    #[tokio::test]
    async fn test_list_ascending_and_recover_step() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store);
        let thread = ThreadId::from_string("voyage-1");

        for step in 1..=5 {
            cp.save(&thread, &state_at(step), CheckpointMetadata::default())
                .await
                .unwrap();
        }

        let list = cp.list_checkpoints(&thread).await.unwrap();
        let steps: Vec<u64> = list.iter().map(|i| i.step).collect();
        assert_eq!(steps, vec![1, 2, 3, 4, 5]);
        assert_eq!(list[1].parent_id.as_deref(), Some(list[0].id.as_str()));

        let third = &list[2];
        let recovered = cp.recover_from_checkpoint(&thread, &third.id).await.unwrap();
        assert_eq!(recovered.step, 3);
        assert_eq!(recovered.state, state_at(3));
        assert!(recovered.missing_fields.is_empty());

        let by_step = cp.recover_from_checkpoint(&thread, "3").await.unwrap();
        assert_eq!(by_step.checkpoint_id, third.id);
    }

    #[tokio::test]
    async fn test_delta_recorded_against_parent() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store);
        let thread = ThreadId::from_string("t");

        let first = cp
            .save(&thread, &state_at(1), CheckpointMetadata::default())
            .await
            .unwrap();
        assert!(first.metadata.delta.is_none());

        let second = cp
            .save(&thread, &state_at(2), CheckpointMetadata::default())
            .await
            .unwrap();
        let delta = second.metadata.delta.unwrap();
        assert_eq!(delta.change_count, 1);
        assert_eq!(delta.changes[0].key, "step");
    }

    #[tokio::test]
    async fn test_recover_unknown_checkpoint() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store);
        let err = cp
            .recover_from_checkpoint(&ThreadId::from_string("t"), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_raises_integrity_error() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store.clone());
        let thread = ThreadId::from_string("t");
        cp.save(&thread, &state_at(1), CheckpointMetadata::default())
            .await
            .unwrap();

        store
            .set("checkpoint:t:0000000001", r#"{"v":1,"id":"x"}"#.into(), None)
            .await
            .unwrap();
        let err = cp.recover_from_checkpoint(&thread, "1").await.unwrap_err();
        assert!(matches!(err, KeelError::CheckpointIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_delete_thread_purges_refs() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store.clone());
        let a = ThreadId::from_string("a");
        let b = ThreadId::from_string("b");
        cp.save(&a, &state_at(1), CheckpointMetadata::default()).await.unwrap();
        cp.save(&a, &state_at(2), CheckpointMetadata::default()).await.unwrap();
        cp.save(&b, &state_at(1), CheckpointMetadata::default()).await.unwrap();

        assert!(!store.keys("state_ref:a:*").await.unwrap().is_empty());
        let deleted = cp.delete_thread(&a).await.unwrap();
        assert!(deleted >= 3);
        assert!(cp.list_checkpoints(&a).await.unwrap().is_empty());
        assert!(store.keys("state_ref:a:*").await.unwrap().is_empty());
        assert_eq!(cp.list_checkpoints(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_threads_sharing_a_prefix_stay_isolated() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cp = checkpointer(store.clone());
        let a = ThreadId::from_string("a");
        cp.save(&a, &state_at(1), CheckpointMetadata::default()).await.unwrap();

        // A colon in a thread id would make it look like a sub-key of `a`.
        let nested = ThreadId::from_string("a:b");
        let err = cp
            .save(&nested, &state_at(1), CheckpointMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidThreadId { .. }));
        assert!(matches!(
            cp.delete_thread(&nested).await,
            Err(KeelError::InvalidThreadId { .. })
        ));
        assert!(matches!(
            cp.list_checkpoints(&ThreadId::from_string("a*")).await,
            Err(KeelError::InvalidThreadId { .. })
        ));

        // Keys written behind the checkpointer's back are not adopted by `a`.
        let foreign = "checkpoint:a:b:0000000009";
        store.set(foreign, "{}".into(), None).await.unwrap();
        let list = cp.list_checkpoints(&a).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].step, 1);
        assert_eq!(cp.recover_latest(&a).await.unwrap().unwrap().step, 1);

        let ab = ThreadId::from_string("ab");
        cp.save(&ab, &state_at(1), CheckpointMetadata::default()).await.unwrap();
        cp.delete_thread(&a).await.unwrap();
        assert!(store.get(foreign).await.unwrap().is_some());
        assert_eq!(cp.list_checkpoints(&ab).await.unwrap().len(), 1);
        assert!(cp.list_checkpoints(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_latest_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.db");
        let thread = ThreadId::from_string("durable");
        {
            let store: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&path).unwrap());
            let cp = checkpointer(store);
            cp.save(&thread, &state_at(1), CheckpointMetadata::default()).await.unwrap();
            cp.save(&thread, &state_at(2), CheckpointMetadata::default()).await.unwrap();
        }
        let store: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&path).unwrap());
        let cp = checkpointer(store.clone());
        let ctx = cp.recover_latest(&thread).await.unwrap().unwrap();
        assert_eq!(ctx.step, 2);
        assert_eq!(ctx.state.get("step"), Some(&json!(2)));
        assert!(store.get(LAST_WRITE_KEY).await.unwrap().is_some());
    }

    #[test]
    fn test_validate_checkpoint_shapes() {
        let good = json!({
            "v": 1,
            "id": "abc",
            "ts": "2026-03-01T10:00:00Z",
            "thread_id": "t",
            "step": 1,
            "channel_values": {
                "vessel_imo": { "inline": "9321483" },
                "route_data": { "reference": { "key": "state_ref:t:route_data:ff", "size_bytes": 4096 } }
            },
            "metadata": {}
        });
        assert!(validate_checkpoint(&good).is_ok());

        let mut bad_version = good.clone();
        bad_version["v"] = json!(9);
        assert!(validate_checkpoint(&bad_version).is_err());

        let mut bad_channel = good.clone();
        bad_channel["channel_values"]["x"] = json!(42);
        assert!(validate_checkpoint(&bad_channel).is_err());

        let mut bad_ref = good.clone();
        bad_ref["channel_values"]["route_data"] = json!({ "reference": { "key": 7 } });
        assert!(validate_checkpoint(&bad_ref).is_err());

        let mut bad_ts = good;
        bad_ts["ts"] = json!("yesterday");
        assert!(matches!(
            validate_checkpoint(&bad_ts),
            Err(KeelError::CheckpointIntegrity { .. })
        ));
    }
}
