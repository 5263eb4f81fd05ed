//! Consensus parameters
//!
//! A [`ConsensusContext`] is built once and handed to every controller,
//! validator and chain. Nothing here is process-wide.

use crate::fixed::UNIT;
use crate::vdf::{SlothVdf, VdfError, DEFAULT_PRIME, DEFAULT_PROOF_WIDTH};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const U: u128 = UNIT as u128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vdf: {0}")]
    Vdf(#[from] VdfError),
    #[error("invalid parameter: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdfParams {
    /// Decimal prime, ≡ 3 mod 4
    pub prime: String,
    /// Challenge and proof width in bytes
    pub proof_width: usize,
}

impl Default for VdfParams {
    fn default() -> Self {
        Self { prime: DEFAULT_PRIME.to_string(), proof_width: DEFAULT_PROOF_WIDTH }
    }
}

/// Difficulty controller tuning. Fields ending in `_fp` are fixed-point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerParams {
    pub target_block_time_ms: u64,
    /// Smoothing window, one day of blocks
    pub window_size: u64,
    /// One year of blocks
    pub bootstrap_period: u64,
    pub bootstrap_virtual_stake_fp: u128,
    pub initial_block_reward_fp: u128,
    pub min_block_time_factor_fp: u128,
    pub max_block_time_factor_fp: u128,
    pub min_speed_ratio_fp: u128,
    pub max_speed_ratio_fp: u128,
    pub initial_block_time_factor_fp: u128,
    pub initial_max_speed_fp: u128,
    pub initial_min_speed_fp: u128,
    /// Amplitude of the seed noise, as a fraction of one slot
    pub noise_fraction_fp: u128,
    pub protection_base: f64,
    pub max_exponent: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            target_block_time_ms: 40_000,
            window_size: 2_160,
            bootstrap_period: 788_400,
            bootstrap_virtual_stake_fp: 10_000 * U,
            initial_block_reward_fp: 10 * U,
            min_block_time_factor_fp: U,
            max_block_time_factor_fp: 1_000_000_000 * U,
            min_speed_ratio_fp: 13 * U / 10,
            max_speed_ratio_fp: 31 * U / 10,
            initial_block_time_factor_fp: 2_000 * U,
            initial_max_speed_fp: 15_000 * U,
            initial_min_speed_fp: 5_000 * U,
            noise_fraction_fp: U / 10,
            protection_base: 3.0,
            max_exponent: 64.0,
        }
    }
}

/// Controller seed for blocks without a predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisParams {
    pub block_time_factor_fp: u128,
    pub max_speed_fp: u128,
    pub min_speed_fp: u128,
    /// Applied to every controller rebuilt from a block
    pub max_speed_ratio_fp: u128,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            block_time_factor_fp: 1_080 * U,
            max_speed_fp: 60 * U,
            min_speed_fp: 40 * U,
            max_speed_ratio_fp: 4 * U,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruneParams {
    pub frequency: u64,
    pub batch_max: usize,
    pub batch_min: usize,
}

impl Default for PruneParams {
    fn default() -> Self {
        Self { frequency: 16, batch_max: 128, batch_min: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusContext {
    pub chain_id: String,
    pub vdf: VdfParams,
    pub controller: ControllerParams,
    pub genesis: GenesisParams,
    pub max_transactions_per_block: usize,
    pub prune: PruneParams,
}

impl Default for ConsensusContext {
    fn default() -> Self {
        Self {
            chain_id: "pulsar-main".to_string(),
            vdf: VdfParams::default(),
            controller: ControllerParams::default(),
            genesis: GenesisParams::default(),
            max_transactions_per_block: 4_096,
            prune: PruneParams::default(),
        }
    }
}

impl ConsensusContext {
    /// Small prime and tiny factors: proofs take milliseconds
    pub fn devnet() -> Self {
        Self {
            chain_id: "pulsar-devnet".to_string(),
            vdf: VdfParams {
                // 2^127 - 1
                prime: "170141183460469231731687303715884105727".to_string(),
                proof_width: 16,
            },
            controller: ControllerParams {
                target_block_time_ms: 2_000,
                window_size: 16,
                bootstrap_period: 4,
                initial_block_reward_fp: 10 * U,
                ..ControllerParams::default()
            },
            genesis: GenesisParams {
                block_time_factor_fp: 4 * U,
                max_speed_fp: 6 * U,
                min_speed_fp: 4 * U,
                max_speed_ratio_fp: 4 * U,
            },
            max_transactions_per_block: 256,
            prune: PruneParams::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let ctx: Self = serde_json::from_str(json)?;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Rejects parameters the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        // grow/shrink scale by (w ± 1) / w
        if self.controller.window_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "window_size must be at least 2, got {}",
                self.controller.window_size
            )));
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn sloth(&self) -> Result<SlothVdf, ConfigError> {
        Ok(SlothVdf::from_decimal(&self.vdf.prime)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = ConsensusContext::default();
        assert_eq!(ctx.controller.window_size, 24 * 3600 / 40);
        assert_eq!(ctx.controller.bootstrap_period, 365 * 24 * 3600 / 40);
        assert_eq!(ctx.prune.frequency, 16);
        assert!(ctx.sloth().is_ok());
    }

    #[test]
    fn test_json_overrides() {
        let ctx = ConsensusContext::from_json(r#"{"chain_id":"test","max_transactions_per_block":7}"#).unwrap();
        assert_eq!(ctx.chain_id, "test");
        assert_eq!(ctx.max_transactions_per_block, 7);
        assert_eq!(ctx.controller, ControllerParams::default());
    }

    #[test]
    fn test_json_rejects_small_window() {
        for w in [0u64, 1] {
            let json = format!(r#"{{"controller":{{"window_size":{w}}}}}"#);
            assert!(matches!(ConsensusContext::from_json(&json), Err(ConfigError::Invalid(_))));
        }
        let ctx = ConsensusContext::from_json(r#"{"controller":{"window_size":2}}"#).unwrap();
        assert_eq!(ctx.controller.window_size, 2);
    }

    #[test]
    fn test_json_roundtrip() {
        let ctx = ConsensusContext::devnet();
        let back = ConsensusContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(ctx, back);
        assert!(back.sloth().is_ok());
    }
}
