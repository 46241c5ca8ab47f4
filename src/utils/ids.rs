//! Workflow and checkpoint identifier generation.
//!
//! Both id families share the same shape: a short prefix, the UTC creation
//! instant down to the second, and eight lowercase hex characters of
//! randomness. The timestamp makes ids roughly sortable and human-scannable in
//! a storage directory; the random suffix keeps concurrent generators from
//! colliding. Collisions are still checked at the store before a write.

use chrono::Utc;

/// Prefix for workflow ids (`wf_20250611_142233_9f3a01bc`).
pub const WORKFLOW_ID_PREFIX: &str = "wf";

/// Prefix for checkpoint ids (`ckpt_20250611_142233_0b44d1ea`).
pub const CHECKPOINT_ID_PREFIX: &str = "ckpt";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

fn stamped(prefix: &str) -> String {
    format!(
        "{prefix}_{}_{:08x}",
        Utc::now().format(TIMESTAMP_FORMAT),
        rand::random::<u32>()
    )
}

/// Generate a fresh workflow id.
#[must_use]
pub fn new_workflow_id() -> String {
    stamped(WORKFLOW_ID_PREFIX)
}

/// Generate a fresh checkpoint id.
#[must_use]
pub fn new_checkpoint_id() -> String {
    stamped(CHECKPOINT_ID_PREFIX)
}
