use serde::{Deserialize, Serialize};

use super::error::ReconcileError;

/// Last-modified times of both copies of an entity, in milliseconds since
/// UNIX_EPOCH. `None` means that side has no copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityVersions {
    pub local_updated_ms: Option<u64>,
    pub remote_updated_ms: Option<u64>,
}

impl EntityVersions {
    pub fn new(local_updated_ms: Option<u64>, remote_updated_ms: Option<u64>) -> Self {
        Self {
            local_updated_ms,
            remote_updated_ms,
        }
    }
}

/// Outcome of comparing both sides of a bidirectional sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local copy wins; write it outward.
    Push,
    /// External copy wins; write it inward.
    Pull,
    /// Both copies carry the same modification time; nothing to write.
    InSync,
}

/// Last-write-wins by modification time. A side without a copy always loses
/// to a side with one; equal times are treated as already reconciled.
pub fn last_write_wins(entity_id: &str, versions: EntityVersions) -> Result<Resolution, ReconcileError> {
    match (versions.local_updated_ms, versions.remote_updated_ms) {
        (None, None) => Err(ReconcileError::EntityMissing(entity_id.to_string())),
        (Some(_), None) => Ok(Resolution::Push),
        (None, Some(_)) => Ok(Resolution::Pull),
        (Some(local), Some(remote)) if local > remote => Ok(Resolution::Push),
        (Some(local), Some(remote)) if local < remote => Ok(Resolution::Pull),
        (Some(_), Some(_)) => Ok(Resolution::InSync),
    }
}
