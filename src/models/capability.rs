//! Capability identifiers: per-session badges and kernel-global kcaps.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Opaque kernel-object identifier assigned when the object is created.
///
/// Unique within the child's capability namespace but not comparable
/// across sessions without a kcap translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Badge(pub u64);

impl Badge {
    /// Raw badge value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Display for Badge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of an object in the kernel's own capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kcap(pub u64);

impl Kcap {
    /// Sentinel returned for unknown badges or before the first mapping pass.
    pub const INVALID: Self = Self(0);

    /// Whether this kcap refers to a real table slot.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for Kcap {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for Kcap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
