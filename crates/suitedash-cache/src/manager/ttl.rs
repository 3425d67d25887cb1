//! TTL tiers chosen by callers according to how fast the data changes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::TtlTiersConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlTier {
    /// Fast-changing aggregates (dashboard counts)
    Short,
    /// List queries
    Medium,
    /// Slow-changing single entities
    Long,
    /// Near-static data
    Extended,
}

impl TtlTier {
    pub fn seconds(self, tiers: &TtlTiersConfig) -> u64 {
        match self {
            TtlTier::Short => tiers.short_secs,
            TtlTier::Medium => tiers.medium_secs,
            TtlTier::Long => tiers.long_secs,
            TtlTier::Extended => tiers.extended_secs,
        }
    }
}

impl fmt::Display for TtlTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlTier::Short => write!(f, "short"),
            TtlTier::Medium => write!(f, "medium"),
            TtlTier::Long => write!(f, "long"),
            TtlTier::Extended => write!(f, "extended"),
        }
    }
}
