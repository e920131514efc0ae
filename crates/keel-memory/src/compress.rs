//! State compression: large fields are moved out of the checkpoint payload
//! into the key-value store and replaced by reference keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use keel_core::config::CheckpointConfig;
use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;
use keel_core::traits::KvStore;
use keel_core::types::ThreadId;

/// Prefix for externalized field values.
pub const STATE_REF_PREFIX: &str = "state_ref";

/// One field of a compressed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressedField {
    Inline(serde_json::Value),
    Reference { key: String, size_bytes: usize },
}

impl CompressedField {
    pub fn is_reference(&self) -> bool {
        matches!(self, CompressedField::Reference { .. })
    }
}

/// Checkpoint payload with large fields replaced by reference keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressedState {
    pub fields: BTreeMap<String, CompressedField>,
}

impl CompressedState {
    pub fn get(&self, key: &str) -> Option<&CompressedField> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn reference_keys(&self) -> Vec<&str> {
        self.fields
            .values()
            .filter_map(|f| match f {
                CompressedField::Reference { key, .. } => Some(key.as_str()),
                CompressedField::Inline(_) => None,
            })
            .collect()
    }

    /// Serialized size of the payload itself (references count as their key).
    pub fn payload_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    pub externalized_fields: usize,
    pub inline_fields: usize,
    pub savings_percent: f64,
}

/// Result of decompression. Fields whose reference was missing or expired
/// are absent from `state` and listed in `missing_fields`.
#[derive(Debug, Clone, Default)]
pub struct Decompressed {
    pub state: SharedState,
    pub missing_fields: Vec<String>,
}

pub struct StateCompressor {
    store: Arc<dyn KvStore>,
    threshold_bytes: usize,
    ttl: Duration,
    inline_keys: BTreeSet<String>,
}

impl StateCompressor {
    pub fn new(store: Arc<dyn KvStore>, threshold_bytes: usize, ttl: Duration) -> Self {
        Self {
            store,
            threshold_bytes,
            ttl,
            inline_keys: BTreeSet::new(),
        }
    }

    pub fn from_config(store: Arc<dyn KvStore>, config: &CheckpointConfig) -> Self {
        Self::new(
            store,
            config.compression_threshold_bytes,
            Duration::from_secs(config.reference_ttl_secs),
        )
        .with_inline_keys(config.inline_keys.iter().cloned())
    }

    /// Fields that always stay inline regardless of size.
    pub fn with_inline_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.inline_keys.extend(keys);
        self
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Reference key for a field value. Identical content yields the same key,
    /// so unchanged fields compare equal by key alone.
    pub fn reference_key(thread_id: &ThreadId, field: &str, serialized: &str) -> String {
        let digest = Sha256::digest(serialized.as_bytes());
        let hash = format!("{:x}", digest);
        format!("{}:{}:{}:{}", STATE_REF_PREFIX, thread_id, field, &hash[..16])
    }

    pub async fn compress(
        &self,
        state: &SharedState,
        thread_id: &ThreadId,
    ) -> Result<(CompressedState, CompressionStats)> {
        thread_id.validate()?;
        let mut compressed = CompressedState::default();
        let mut stats = CompressionStats {
            original_bytes: serde_json::to_vec(state.data())?.len(),
            ..Default::default()
        };

        for (field, value) in state.iter() {
            let serialized = serde_json::to_string(value)?;
            let size_bytes = serialized.len();

            if size_bytes <= self.threshold_bytes || self.inline_keys.contains(field) {
                compressed
                    .fields
                    .insert(field.clone(), CompressedField::Inline(value.clone()));
                stats.inline_fields += 1;
                continue;
            }

            let key = Self::reference_key(thread_id, field, &serialized);
            match self.store.set(&key, serialized, Some(self.ttl)).await {
                Ok(()) => {
                    compressed
                        .fields
                        .insert(field.clone(), CompressedField::Reference { key, size_bytes });
                    stats.externalized_fields += 1;
                }
                Err(e) => {
                    // Keep the value inline; the payload grows but nothing is lost.
                    warn!(field = %field, error = %e, "Failed to externalize field, keeping inline");
                    compressed
                        .fields
                        .insert(field.clone(), CompressedField::Inline(value.clone()));
                    stats.inline_fields += 1;
                }
            }
        }

        stats.compressed_bytes = compressed.payload_bytes();
        stats.savings_percent = savings(stats.original_bytes, stats.compressed_bytes);

        debug!(
            thread_id = %thread_id,
            original = stats.original_bytes,
            compressed = stats.compressed_bytes,
            externalized = stats.externalized_fields,
            "State compressed"
        );
        Ok((compressed, stats))
    }

    pub async fn decompress(&self, compressed: &CompressedState) -> Result<Decompressed> {
        let mut out = Decompressed::default();

        for (field, entry) in &compressed.fields {
            match entry {
                CompressedField::Inline(value) => out.state.set(field.clone(), value.clone()),
                CompressedField::Reference { key, .. } => match self.store.get(key).await? {
                    Some(raw) => {
                        let value: serde_json::Value =
                            serde_json::from_str(&raw).map_err(|e| KeelError::CheckpointIntegrity {
                                reason: format!("Reference {} holds invalid JSON: {}", key, e),
                            })?;
                        out.state.set(field.clone(), value);
                    }
                    None => {
                        warn!(field = %field, key = %key, "State reference missing or expired");
                        out.missing_fields.push(field.clone());
                    }
                },
            }
        }

        Ok(out)
    }
}

/// Percentage saved going from `original` to `reduced` bytes, floored at zero.
pub(crate) fn savings(original: usize, reduced: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    let pct = (1.0 - reduced as f64 / original as f64) * 100.0;
    (pct.max(0.0) * 100.0).round() / 100.0
}
