//! Stake oracle
//!
//! Consensus only needs two numbers per block: the author's stake and the
//! total. Where they come from is up to the deployment.

use crate::fixed::from_raw;
use crate::types::AccountId;
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::HashMap;

pub trait StakeOracle: Send + Sync {
    fn stake_of(&self, author: &AccountId) -> BigUint;
    fn total_stake(&self) -> BigUint;
}

/// Everyone holds nothing of a fixed total. During bootstrap every author
/// then draws from `total / virtual_stake` slots.
#[derive(Debug, Clone)]
pub struct FlatStake {
    total: BigUint,
}

impl FlatStake {
    pub fn new(total: BigUint) -> Self {
        Self { total }
    }

    /// Four times the bootstrap virtual stake
    pub fn for_virtual_stake(virtual_stake_fp: u128) -> Self {
        Self::new(from_raw(virtual_stake_fp) * 4u32)
    }
}

impl StakeOracle for FlatStake {
    fn stake_of(&self, _author: &AccountId) -> BigUint {
        BigUint::zero()
    }

    fn total_stake(&self) -> BigUint {
        self.total.clone()
    }
}

/// Explicit holdings
#[derive(Debug, Clone, Default)]
pub struct StakeTable {
    stakes: HashMap<AccountId, BigUint>,
    total: BigUint,
}

impl StakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, account: AccountId, stake: BigUint) -> Self {
        self.set(account, stake);
        self
    }

    pub fn set(&mut self, account: AccountId, stake: BigUint) {
        if let Some(old) = self.stakes.insert(account, stake.clone()) {
            self.total -= old;
        }
        self.total += stake;
    }
}

impl StakeOracle for StakeTable {
    fn stake_of(&self, author: &AccountId) -> BigUint {
        self.stakes.get(author).cloned().unwrap_or_default()
    }

    fn total_stake(&self) -> BigUint {
        self.total.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::units;

    #[test]
    fn test_flat_stake() {
        let flat = FlatStake::for_virtual_stake(10_000 * crate::fixed::UNIT as u128);
        assert!(flat.stake_of(&[9u8; 32]).is_zero());
        assert_eq!(flat.total_stake(), units(40_000));
    }

    #[test]
    fn test_stake_table_replaces_holdings() {
        let mut table = StakeTable::new().with([1u8; 32], units(3)).with([2u8; 32], units(7));
        assert_eq!(table.total_stake(), units(10));
        table.set([1u8; 32], units(1));
        assert_eq!(table.total_stake(), units(8));
        assert_eq!(table.stake_of(&[1u8; 32]), units(1));
        assert!(table.stake_of(&[3u8; 32]).is_zero());
    }
}
