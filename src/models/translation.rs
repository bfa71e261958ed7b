//! Dataspace-translation record.

use serde::{Deserialize, Serialize};

use super::capability::Badge;

/// Maps a child dataspace to the supervisor-owned copy of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataspaceTranslation {
    /// Child dataspace whose content is copied.
    pub source: Badge,
    /// Supervisor-owned dataspace holding the copy.
    pub backing: Badge,
    /// Copy size in bytes.
    pub size: usize,
    /// Epoch of the checkpoint that last copied the content.
    pub copied_epoch: Option<u64>,
    /// Number of content copies performed over the record's lifetime.
    pub copies: u64,
    /// SHA-256 digest of the last copied content.
    pub digest: Option<String>,
}

impl DataspaceTranslation {
    /// Construct a record for a freshly allocated backing dataspace.
    #[must_use]
    pub fn new(source: Badge, backing: Badge, size: usize) -> Self {
        Self {
            source,
            backing,
            size,
            copied_epoch: None,
            copies: 0,
            digest: None,
        }
    }
}
