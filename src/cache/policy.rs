//! Tier Budgets and Promotion Policy
//!
//! Budgets are per shard: a cache with N shards holds at most
//! `N * budget` across a tier.

use serde::{Deserialize, Serialize};

use super::entry::Tier;

/// Byte and item ceiling for one tier of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudget {
    pub max_bytes: u64,
    pub max_items: usize,
}

impl TierBudget {
    pub const fn new(max_bytes: u64, max_items: usize) -> Self {
        Self {
            max_bytes,
            max_items,
        }
    }

    /// Item-count budget with no byte ceiling.
    pub const fn items(max_items: usize) -> Self {
        Self::new(u64::MAX, max_items)
    }

    #[inline]
    pub fn exceeded_by(&self, bytes: u64, items: usize) -> bool {
        bytes > self.max_bytes || items > self.max_items
    }
}

/// Budgets for every tier of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBudgets {
    pub hot: TierBudget,
    pub warm: TierBudget,
    pub cold: TierBudget,
}

impl TierBudgets {
    #[inline]
    pub fn get(&self, tier: Tier) -> &TierBudget {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }
}

impl Default for TierBudgets {
    fn default() -> Self {
        // 256 shards: ~1 GiB hot, ~4 GiB warm, ~16 GiB cold
        Self {
            hot: TierBudget::new(4 * 1024 * 1024, 4096),
            warm: TierBudget::new(16 * 1024 * 1024, 16384),
            cold: TierBudget::new(64 * 1024 * 1024, 65536),
        }
    }
}

/// Where a Warm or Cold hit moves the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionMode {
    /// Straight back to Hot.
    #[default]
    ToHot,
    /// One step warmer per hit.
    OneTier,
    /// Never promote.
    Disabled,
}

impl PromotionMode {
    /// Target tier for a hit in `tier`, or `None` if the entry stays put.
    pub fn target(&self, tier: Tier) -> Option<Tier> {
        if tier == Tier::Hot {
            return None;
        }
        match self {
            PromotionMode::ToHot => Some(Tier::Hot),
            PromotionMode::OneTier => Some(tier.warmer()),
            PromotionMode::Disabled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exceeded() {
        let b = TierBudget::new(100, 2);
        assert!(!b.exceeded_by(100, 2));
        assert!(b.exceeded_by(101, 1));
        assert!(b.exceeded_by(10, 3));
        assert!(!TierBudget::items(2).exceeded_by(u64::MAX, 2));
    }

    #[test]
    fn test_promotion_targets() {
        assert_eq!(PromotionMode::ToHot.target(Tier::Cold), Some(Tier::Hot));
        assert_eq!(PromotionMode::ToHot.target(Tier::Hot), None);
        assert_eq!(PromotionMode::OneTier.target(Tier::Cold), Some(Tier::Warm));
        assert_eq!(PromotionMode::OneTier.target(Tier::Warm), Some(Tier::Hot));
        assert_eq!(PromotionMode::Disabled.target(Tier::Warm), None);
    }
}
