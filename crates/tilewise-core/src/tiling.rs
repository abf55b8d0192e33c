//! Tile-size selection from device memory.
//!
//! A [`TilePolicy`] is a descending ladder of `(min_budget_mib, tile_size)`
//! tiers. The first tier whose bound the budget meets wins; below the last
//! tier the floor applies. CPU sessions skip the ladder entirely.

use serde::{Deserialize, Serialize};

use crate::config::MIN_TILE_SIZE;
use crate::error::{EngineError, Result};
use crate::probe::HeapBudget;

/// One rung of the ladder. The bound is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileTier {
    pub min_budget_mib: u32,
    pub tile_size: u32,
}

/// Threshold table mapping a heap budget to a tile size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilePolicy {
    /// Tile used when `gpu_id < 0`.
    pub cpu_tile_size: u32,
    /// Strictly descending by `min_budget_mib`.
    pub tiers: Vec<TileTier>,
    /// Tile used when the budget is below every tier.
    pub floor_tile_size: u32,
}

impl Default for TilePolicy {
    fn default() -> Self {
        Self {
            cpu_tile_size: 400,
            tiers: vec![
                TileTier {
                    min_budget_mib: 1900,
                    tile_size: 200,
                },
                TileTier {
                    min_budget_mib: 550,
                    tile_size: 100,
                },
                TileTier {
                    min_budget_mib: 190,
                    tile_size: 64,
                },
            ],
            floor_tile_size: 32,
        }
    }
}

impl TilePolicy {
    /// Parse a replacement table from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(format!("tile policy: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject tables that would break the ladder's ordering or hand the
    /// engine a tile below [`MIN_TILE_SIZE`].
    pub fn validate(&self) -> Result<()> {
        if self.cpu_tile_size < MIN_TILE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "cpu_tile_size {} is below {MIN_TILE_SIZE}",
                self.cpu_tile_size
            )));
        }
        if self.floor_tile_size < MIN_TILE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "floor_tile_size {} is below {MIN_TILE_SIZE}",
                self.floor_tile_size
            )));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.tile_size < MIN_TILE_SIZE {
                return Err(EngineError::InvalidConfig(format!(
                    "tier {i}: tile_size {} is below {MIN_TILE_SIZE}",
                    tier.tile_size
                )));
            }
        }
        if let Some(pair) = self
            .tiers
            .windows(2)
            .find(|w| w[0].min_budget_mib <= w[1].min_budget_mib)
        {
            return Err(EngineError::InvalidConfig(format!(
                "tiers must be strictly descending by budget ({} MiB then {} MiB)",
                pair[0].min_budget_mib, pair[1].min_budget_mib
            )));
        }
        Ok(())
    }

    /// Tile size for `gpu_id` with `budget` available. Total.
    ///
    /// `budget` is ignored for CPU ids.
    pub fn decide(&self, gpu_id: i32, budget: HeapBudget) -> u32 {
        if gpu_id < 0 {
            return self.cpu_tile_size;
        }
        self.tiers
            .iter()
            .find(|t| budget.mib() >= t.min_budget_mib)
            .map_or(self.floor_tile_size, |t| t.tile_size)
    }

    /// The next smaller GPU tile below `tile_size`, or `None` at the floor.
    pub fn step_down(&self, tile_size: u32) -> Option<u32> {
        self.tiers
            .iter()
            .map(|t| t.tile_size)
            .chain(std::iter::once(self.floor_tile_size))
            .filter(|&t| t < tile_size)
            .max()
    }
}

/// [`TilePolicy::decide`] on the default table.
pub fn decide_tile_size(gpu_id: i32, budget: HeapBudget) -> u32 {
    TilePolicy::default().decide(gpu_id, budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_boundaries_are_inclusive() {
        let cases = [
            (u32::MAX, 200),
            (1900, 200),
            (1899, 100),
            (550, 100),
            (549, 64),
            (190, 64),
            (189, 32),
            (0, 32),
        ];
        for (mib, tile) in cases {
            assert_eq!(decide_tile_size(0, HeapBudget(mib)), tile, "budget {mib}");
        }
    }

    #[test]
    fn negative_ids_always_use_cpu_tile() {
        for gpu_id in [-1, -2, -100, i32::MIN] {
            for mib in [0, 189, 2000, u32::MAX] {
                assert_eq!(decide_tile_size(gpu_id, HeapBudget(mib)), 400);
            }
        }
    }

    #[test]
    fn default_table_validates() {
        TilePolicy::default().validate().expect("default policy");
    }

    #[test]
    fn replacement_table_from_json() {
        let json = r#"{
            "cpu_tile_size": 256,
            "tiers": [
                { "min_budget_mib": 8000, "tile_size": 512 },
                { "min_budget_mib": 4000, "tile_size": 256 }
            ],
            "floor_tile_size": 48
        }"#;
        let policy = TilePolicy::from_json_str(json).expect("valid table");
        assert_eq!(policy.decide(-1, HeapBudget(0)), 256);
        assert_eq!(policy.decide(0, HeapBudget(8000)), 512);
        assert_eq!(policy.decide(0, HeapBudget(4500)), 256);
        assert_eq!(policy.decide(0, HeapBudget(100)), 48);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let policy = TilePolicy::from_json_str(r#"{ "cpu_tile_size": 128 }"#).expect("valid");
        assert_eq!(policy.cpu_tile_size, 128);
        assert_eq!(policy.tiers, TilePolicy::default().tiers);
    }

    #[test]
    fn rejects_unordered_tiers() {
        let json = r#"{ "tiers": [
            { "min_budget_mib": 100, "tile_size": 64 },
            { "min_budget_mib": 100, "tile_size": 32 }
        ] }"#;
        let err = TilePolicy::from_json_str(json).expect_err("equal bounds");
        assert_eq!(err.error_code(), 501);
    }

    #[test]
    fn rejects_tiny_tiles() {
        let mut policy = TilePolicy::default();
        policy.tiers[1].tile_size = 16;
        assert!(policy.validate().is_err());

        let mut policy = TilePolicy::default();
        policy.floor_tile_size = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = TilePolicy::from_json_str("{ tiers: ").expect_err("syntax");
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn step_down_walks_the_ladder() {
        let policy = TilePolicy::default();
        assert_eq!(policy.step_down(400), Some(200));
        assert_eq!(policy.step_down(200), Some(100));
        assert_eq!(policy.step_down(100), Some(64));
        assert_eq!(policy.step_down(64), Some(32));
        assert_eq!(policy.step_down(32), None);
        assert_eq!(policy.step_down(150), Some(100));
    }
}
