//! Structural diff between two compressed snapshots.
//!
//! Works on the compressed form: an externalized field is unchanged when its
//! reference key is unchanged, so large values are never fetched to compare.

use serde::{Deserialize, Serialize};

use crate::compress::{savings, CompressedField, CompressedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub key: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub change_count: usize,
    /// Serialized bytes needed to express the changes.
    pub delta_size: usize,
    /// Savings of persisting the delta instead of the full modified payload.
    pub savings_percent: f64,
    pub changes: Vec<FieldChange>,
}

impl DeltaSummary {
    pub fn is_empty(&self) -> bool {
        self.change_count == 0
    }
}

pub fn compute_delta(base: &CompressedState, modified: &CompressedState) -> DeltaSummary {
    let mut changes = Vec::new();
    let mut delta_size = 0usize;

    for (key, field) in &modified.fields {
        let kind = match base.fields.get(key) {
            None => ChangeKind::Added,
            Some(old) if !same_field(old, field) => ChangeKind::Modified,
            Some(_) => continue,
        };
        delta_size += key.len() + field_bytes(field);
        changes.push(FieldChange {
            key: key.clone(),
            kind,
        });
    }

    for key in base.fields.keys() {
        if !modified.fields.contains_key(key) {
            delta_size += key.len();
            changes.push(FieldChange {
                key: key.clone(),
                kind: ChangeKind::Removed,
            });
        }
    }

    DeltaSummary {
        change_count: changes.len(),
        delta_size,
        savings_percent: savings(modified.payload_bytes(), delta_size),
        changes,
    }
}

fn same_field(a: &CompressedField, b: &CompressedField) -> bool {
    match (a, b) {
        (CompressedField::Reference { key: ka, .. }, CompressedField::Reference { key: kb, .. }) => {
            ka == kb
        }
        (CompressedField::Inline(va), CompressedField::Inline(vb)) => va == vb,
        _ => false,
    }
}

fn field_bytes(field: &CompressedField) -> usize {
    serde_json::to_vec(field).map(|v| v.len()).unwrap_or(0)
}
