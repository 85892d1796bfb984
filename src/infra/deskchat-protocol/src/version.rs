use serde::{Deserialize, Serialize};

use crate::ProtocolError;

pub const PROTOCOL_VERSION: u16 = 1;

/// Inclusive range of protocol versions a peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: u16,
    pub max: u16,
}

impl VersionRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: u16) -> bool {
        self.min <= version && version <= self.max
    }

    /// Highest version both ranges support.
    pub fn negotiate(&self, other: &VersionRange) -> Result<u16, ProtocolError> {
        let lo = self.min.max(other.min);
        let hi = self.max.min(other.max);
        if lo <= hi {
            Ok(hi)
        } else {
            Err(ProtocolError::VersionMismatch)
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, PROTOCOL_VERSION)
    }
}
