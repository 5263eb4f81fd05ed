//! Difficulty Controller
//!
//! Адаптивный контроллер сложности. Держит интервал блоков около целевого
//! и ограничивает отношение самой быстрой и самой медленной скорости VDF.
//!
//! State is a pure function of the initial parameters plus the sequence of
//! `(block_time, difficulty)` samples. Two controllers rebuilt from the same
//! predecessor and fed the same sample end up with identical fields.
//!
//! ```text
//! steps = block_time_factor × base^(slot + noise)
//! slot  = vrf_seed mod ⌈total_stake / stake⌉
//! ```

use crate::config::{ControllerParams, GenesisParams};
use crate::fixed::{self, div_trunc, from_raw, mul_trunc, UNIT};
use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{FromPrimitive, One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Slot count never exceeds 2^32 - 1
pub const MAX_SLOTS: u64 = u32::MAX as u64;

/// Controller fields carried forward by every block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub height: u64,
    pub block_time_factor: BigUint,
    pub moving_max_speed: BigUint,
    pub moving_min_speed: BigUint,
}

#[derive(Debug, Clone)]
pub struct DifficultyController {
    params: ControllerParams,
    height: u64,
    block_time_factor: BigUint,
    moving_max_speed: BigUint,
    moving_min_speed: BigUint,
    speed_ratio: BigUint,
    max_speed_ratio: BigUint,
    block_reward: BigUint,
}

impl DifficultyController {
    /// Reference starting state from `params`
    pub fn new(params: &ControllerParams) -> Self {
        let max = from_raw(params.initial_max_speed_fp);
        let min = from_raw(params.initial_min_speed_fp);
        Self {
            height: 0,
            block_time_factor: from_raw(params.initial_block_time_factor_fp),
            speed_ratio: div_trunc(&max, &min),
            moving_max_speed: max,
            moving_min_speed: min,
            max_speed_ratio: from_raw(params.max_speed_ratio_fp),
            block_reward: from_raw(params.initial_block_reward_fp),
            params: params.clone(),
        }
    }

    /// Seed for a block without predecessor
    pub fn genesis(params: &ControllerParams, genesis: &GenesisParams) -> Self {
        let snapshot = ControllerSnapshot {
            height: 0,
            block_time_factor: from_raw(genesis.block_time_factor_fp),
            moving_max_speed: from_raw(genesis.max_speed_fp),
            moving_min_speed: from_raw(genesis.min_speed_fp),
        };
        Self::from_snapshot(params, genesis, &snapshot)
    }

    /// Rebuild from the fields a block carries
    pub fn from_snapshot(params: &ControllerParams, genesis: &GenesisParams, snapshot: &ControllerSnapshot) -> Self {
        let mut c = Self::new(params);
        c.height = snapshot.height;
        c.block_time_factor = snapshot.block_time_factor.clone();
        c.moving_max_speed = snapshot.moving_max_speed.clone();
        c.moving_min_speed = snapshot.moving_min_speed.clone();
        c.speed_ratio = div_trunc(&c.moving_max_speed, &c.moving_min_speed);
        c.max_speed_ratio = from_raw(genesis.max_speed_ratio_fp);
        c
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            height: self.height,
            block_time_factor: self.block_time_factor.clone(),
            moving_max_speed: self.moving_max_speed.clone(),
            moving_min_speed: self.moving_min_speed.clone(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn set_height(&mut self, height: u64) {
        self.height = height;
    }

    pub fn block_time_factor(&self) -> &BigUint {
        &self.block_time_factor
    }

    pub fn moving_max_speed(&self) -> &BigUint {
        &self.moving_max_speed
    }

    pub fn moving_min_speed(&self) -> &BigUint {
        &self.moving_min_speed
    }

    /// Overrides the moving maximum. The ratio catches up on the next sample.
    pub fn set_moving_max_speed(&mut self, speed: BigUint) {
        self.moving_max_speed = speed;
    }

    pub fn speed_ratio(&self) -> &BigUint {
        &self.speed_ratio
    }

    pub fn block_reward(&self) -> &BigUint {
        &self.block_reward
    }

    pub fn target_block_time(&self) -> BigUint {
        BigUint::from(self.params.target_block_time_ms) * UNIT / 1000u32
    }

    pub fn is_bootstrap_period(&self) -> bool {
        self.height < self.params.bootstrap_period
    }

    /// Blocks a reorg may reach back: trunc(max / min) + 1
    pub fn finality_depth(&self) -> u64 {
        let depth = fixed::trunc(&self.speed_ratio);
        depth.to_u64().unwrap_or(u64::MAX - 1) + 1
    }

    /// Steps of the secondary proof, zero outside the bootstrap period
    pub fn bootstrap_difficulty(&self) -> BigUint {
        if !self.is_bootstrap_period() {
            return BigUint::zero();
        }
        let mean_speed = (&self.moving_max_speed + &self.moving_min_speed) >> 1;
        mul_trunc(&mean_speed, &self.target_block_time()) / UNIT / 2u32
    }

    // ========================================================================
    // SAMPLES
    // ========================================================================

    /// Feed one block: `block_time` is fixed-point seconds, `difficulty` the
    /// VDF steps the block needed.
    pub fn add_block_sample(&mut self, block_time: &BigUint, difficulty: u64) {
        self.height += 1;
        let speed = div_trunc(&(BigUint::from(difficulty) * UNIT), block_time);
        self.adjust_block_time_factor(block_time);
        self.adjust_speed_bounds(&speed);
        debug!(
            height = self.height,
            speed = %fixed::display(&speed),
            max_speed = %fixed::display(&self.moving_max_speed),
            min_speed = %fixed::display(&self.moving_min_speed),
            speed_ratio = %fixed::display(&self.speed_ratio),
            block_time_factor = %fixed::display(&self.block_time_factor),
            "tokenomics"
        );
    }

    fn grow(&self, x: &BigUint) -> BigUint {
        let w = self.params.window_size;
        x * (w + 1) / w
    }

    fn shrink(&self, x: &BigUint) -> BigUint {
        let w = self.params.window_size;
        x * (w - 1) / w
    }

    fn adjust_block_time_factor(&mut self, block_time: &BigUint) {
        let target = self.target_block_time();
        let factor = match block_time.cmp(&target) {
            std::cmp::Ordering::Greater => self.shrink(&self.block_time_factor),
            std::cmp::Ordering::Less => self.grow(&self.block_time_factor),
            std::cmp::Ordering::Equal => self.block_time_factor.clone(),
        };
        let lo = from_raw(self.params.min_block_time_factor_fp);
        let hi = from_raw(self.params.max_block_time_factor_fp);
        self.block_time_factor = factor.clamp(lo, hi);
    }

    fn adjust_speed_bounds(&mut self, speed: &BigUint) {
        let max_ratio = self.max_speed_ratio.clone();
        let min_ratio = from_raw(self.params.min_speed_ratio_fp);
        let at_max_ratio = self.speed_ratio >= max_ratio;

        if *speed > self.moving_max_speed {
            // Faster than ever: lift the ceiling, drag the floor only at the ratio cap
            self.moving_max_speed = self.grow(&self.moving_max_speed);
            if at_max_ratio {
                self.moving_min_speed = self.grow(&self.moving_min_speed);
            }
        } else if *speed < self.moving_min_speed {
            self.moving_min_speed = self.shrink(&self.moving_min_speed);
            if at_max_ratio {
                self.moving_max_speed = self.shrink(&self.moving_max_speed);
            }
        } else if *speed < self.moving_max_speed && *speed > self.moving_min_speed && self.speed_ratio > min_ratio {
            self.moving_min_speed = self.grow(&self.moving_min_speed);
            self.moving_max_speed = self.shrink(&self.moving_max_speed);
        }

        if self.moving_max_speed < self.moving_min_speed {
            let mid: BigUint = (&self.moving_max_speed + &self.moving_min_speed) >> 1;
            self.moving_max_speed = mid.clone();
            self.moving_min_speed = mid;
        }
        self.speed_ratio = div_trunc(&self.moving_max_speed, &self.moving_min_speed);
    }

    // ========================================================================
    // STAKE-WEIGHTED DIFFICULTY
    // ========================================================================

    /// `seed mod ⌈total / stake⌉`; zero stake draws from the maximum slot count
    pub fn slot_by_stake(&self, stake: &BigUint, total_stake: &BigUint, seed: &BigUint) -> BigUint {
        let max_slots = BigUint::from(MAX_SLOTS);
        let slots = if stake.is_zero() {
            max_slots
        } else {
            total_stake.div_ceil(stake).clamp(BigUint::one(), max_slots)
        };
        seed % slots
    }

    /// Fraction of one slot taken from the low 256 bits of the seed,
    /// in `[0, noise_fraction]`
    pub fn noise(&self, seed: &BigUint) -> BigUint {
        let low = seed % (BigUint::one() << 256u32);
        let ratio = fixed::to_f64(&low) / 2f64.powi(256);
        let scaled = BigUint::from_f64((ratio * UNIT as f64).floor()).unwrap_or_default();
        mul_trunc(&scaled, &from_raw(self.params.noise_fraction_fp))
    }

    /// Fixed-point slot plus noise
    pub fn slot_by_stake_with_noise(&self, stake: &BigUint, total_stake: &BigUint, seed: &BigUint) -> BigUint {
        self.slot_by_stake(stake, total_stake, seed) * UNIT + self.noise(seed)
    }

    /// Required VDF steps for an author holding `stake` of `total_stake`.
    /// Always even.
    pub fn consensus_difficulty(&self, stake: &BigUint, total_stake: &BigUint, seed: &BigUint) -> BigUint {
        let stake = if self.is_bootstrap_period() {
            stake + from_raw(self.params.bootstrap_virtual_stake_fp)
        } else {
            stake.clone()
        };
        let plank = self.slot_by_stake_with_noise(&stake, total_stake, seed);
        let exponent = (fixed::to_f64(&plank) / UNIT as f64).min(self.params.max_exponent);
        let factor = fixed::to_f64(&self.block_time_factor) / UNIT as f64;
        let raw = (factor * self.params.protection_base.powf(exponent)).floor();
        let steps = BigUint::from_f64(raw).unwrap_or_default();
        let odd = &steps % 2u32;
        steps + odd
    }
}
