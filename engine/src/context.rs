//! Replication context shared by analysis and execution.

use serde::{Deserialize, Serialize};

/// How the current stretch of the oplog is being replayed.
///
/// Immutable: a retry builds a new context with [`ReplicationContext::reapplying`]
/// instead of flipping flags on the existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationContext {
    /// Classify every update as an upsert.
    pub treat_update_as_upsert: bool,
    /// Whether these operations may already be applied. `None` when unknown.
    pub is_reapplying: Option<bool>,
}

impl ReplicationContext {
    pub fn new(treat_update_as_upsert: bool, is_reapplying: Option<bool>) -> Self {
        Self {
            treat_update_as_upsert,
            is_reapplying,
        }
    }

    /// The context used to retry a batch after a backend rollback.
    pub fn reapplying() -> Self {
        Self {
            treat_update_as_upsert: true,
            is_reapplying: Some(true),
        }
    }

    /// Whether delete-and-create operations may skip the identity lookup.
    ///
    /// Optimistic unless the operations are known to be reapplied.
    pub fn optimistic_delete_and_create(&self) -> bool {
        !self.is_reapplying.unwrap_or(false)
    }
}
