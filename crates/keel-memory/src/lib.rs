pub mod checkpoint;
pub mod compress;
pub mod delta;
pub mod kv;

pub use checkpoint::{
    validate_checkpoint, Checkpoint, CheckpointInfo, CheckpointMetadata, Checkpointer,
    RecoveredContext, LAST_WRITE_KEY,
};
pub use compress::{
    CompressedField, CompressedState, CompressionStats, Decompressed, StateCompressor,
    STATE_REF_PREFIX,
};
pub use delta::{compute_delta, ChangeKind, DeltaSummary, FieldChange};
pub use kv::{MemoryKv, SqliteKv};
