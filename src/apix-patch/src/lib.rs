//!
//! # Patch application
//!
//! The three wire patch flavors plus the field ownership bookkeeping that
//! server side apply builds on. All operations work on `serde_json::Value`
//! trees; strategic merge takes its list semantics from the structural
//! schema's list-type hints.
//!
mod json;
mod ownership;

use std::fmt;

pub use json::apply_json_patch;
pub use json::apply_merge_patch;
pub use json::strategic_merge;
pub use json::PatchOperation;
pub use ownership::extract_field_set;
pub use ownership::field_conflicts;
pub use ownership::remove_abandoned_fields;
pub use ownership::FieldConflict;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    BadPatch(String),
    #[error("json pointer \"{0}\" does not resolve")]
    BadPointer(String),
    #[error("test operation failed at \"{0}\"")]
    TestFailed(String),
}

impl PatchError {
    pub(crate) fn bad(message: impl fmt::Display) -> Self {
        Self::BadPatch(message.to_string())
    }
}
