//! Fork Choice Rule
//!
//! **Finality window + fastest fork** правило:
//! 1. Окно = максимальная finality depth двух голов (max/min скорости + 1)
//! 2. Разница высот больше окна: побеждает более высокая цепь
//! 3. Иначе идём назад до точки форка: меньше VDF steps лучше
//! 4. Окно исчерпано: меньшая накопленная сложность, затем меньший хеш
//!
//! The old head may not be in the store yet (the block being produced).
//! Ancestors, on the other hand, must be there: a missing one aborts the
//! comparison.

use crate::config::ConsensusContext;
use crate::controller::DifficultyController;
use crate::db::{ObjectStore, StoreError};
use crate::types::{short, Block};
use tracing::debug;

/// Ошибки fork choice
#[derive(Debug, thiserror::Error)]
pub enum ForkChoiceError {
    #[error("ancestor {0} missing from store")]
    MissingAncestor(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub struct ForkChoice<'a> {
    ctx: &'a ConsensusContext,
    store: &'a dyn ObjectStore,
}

impl<'a> ForkChoice<'a> {
    pub fn new(ctx: &'a ConsensusContext, store: &'a dyn ObjectStore) -> Self {
        Self { ctx, store }
    }

    /// trunc(max speed / min speed) + 1 of the block's controller
    pub fn finality_depth(&self, block: &Block) -> u64 {
        DifficultyController::from_snapshot(&self.ctx.controller, &self.ctx.genesis, &block.controller_snapshot())
            .finality_depth()
    }

    fn parent(&self, block: &Block) -> Result<Block, ForkChoiceError> {
        let prev = block
            .prev
            .ok_or_else(|| ForkChoiceError::MissingAncestor(format!("parent of height {}", block.height)))?;
        self.store
            .load_block(&prev)?
            .ok_or_else(|| ForkChoiceError::MissingAncestor(short(&prev)))
    }

    /// Stored value, or the predecessor's plus own steps for an unstored head
    pub fn cumulative_difficulty(&self, block: &Block) -> Result<u128, ForkChoiceError> {
        if let Some(pos) = self.store.load_position(&block.hash())? {
            return Ok(pos.cumulative_difficulty);
        }
        let base = match block.prev {
            Some(prev) => {
                self.store
                    .load_position(&prev)?
                    .ok_or_else(|| ForkChoiceError::MissingAncestor(short(&prev)))?
                    .cumulative_difficulty
            }
            None => 0,
        };
        Ok(base + block.steps as u128)
    }

    /// Should `new` replace `old` as the chain head?
    pub fn should_accept_new_head(&self, new: &Block, old: &Block) -> Result<bool, ForkChoiceError> {
        let new_hash = new.hash();
        let old_hash = old.hash();
        if new_hash == old_hash {
            return Ok(false);
        }

        let window = self.finality_depth(new).max(self.finality_depth(old));
        if new.height.abs_diff(old.height) > window {
            debug!(new = new.height, old = old.height, window, "fork choice by height");
            return Ok(new.height > old.height);
        }

        let mut a = new.clone();
        let mut b = old.clone();
        let mut a_hash = new_hash;
        let mut b_hash = old_hash;
        let mut budget = window;

        loop {
            if a_hash == b_hash {
                // one chain contains the other
                return Ok(new.height > old.height);
            }
            if a.height == b.height && a.prev == b.prev {
                debug!(
                    fork_height = a.height,
                    new_steps = a.steps,
                    old_steps = b.steps,
                    "fork choice at fork point"
                );
                return Ok((a.steps, a_hash) < (b.steps, b_hash));
            }
            if budget == 0 {
                break;
            }
            budget -= 1;
            if a.height > b.height {
                a = self.parent(&a)?;
                a_hash = a.hash();
            } else if b.height > a.height {
                b = self.parent(&b)?;
                b_hash = b.hash();
            } else {
                a = self.parent(&a)?;
                b = self.parent(&b)?;
                a_hash = a.hash();
                b_hash = b.hash();
            }
        }

        let new_total = self.cumulative_difficulty(new)?;
        let old_total = self.cumulative_difficulty(old)?;
        debug!(new_total, old_total, "fork choice by cumulative difficulty");
        Ok((new_total, new_hash) < (old_total, old_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::fixed::units;
    use crate::types::{ChainOp, ChainPosition};
    use num_bigint::BigUint;

    /// ratio 3 → finality depth 4
    fn mk(height: u64, prev: Option<&Block>, steps: u64, salt: u8) -> Block {
        Block {
            height,
            prev: prev.map(Block::hash),
            author: [salt; 32],
            timestamp_ms: height,
            steps,
            proof: vec![salt],
            bootstrap_proof: None,
            vrf_seed: None,
            block_time_factor: units(1),
            moving_max_speed: units(3),
            moving_min_speed: units(1),
            reward: BigUint::from(0u32),
            transactions: vec![],
        }
    }

    struct Tree {
        store: MemoryStore,
        ctx: ConsensusContext,
    }

    impl Tree {
        fn new() -> Self {
            Self { store: MemoryStore::new(), ctx: ConsensusContext::devnet() }
        }

        fn put(&self, b: &Block) {
            let base = match b.prev {
                Some(p) => self.store.load_position(&p).unwrap().unwrap().cumulative_difficulty,
                None => 0,
            };
            let pos = ChainPosition { height: b.height, cumulative_difficulty: base + b.steps as u128, ignore: false };
            self.store.put(&ChainOp::Block(b.clone()), pos).unwrap();
        }

        /// `len` blocks on top of `from`
        fn extend(&self, from: &Block, len: u64, steps: u64, salt: u8) -> Vec<Block> {
            let mut out = vec![];
            let mut tip = from.clone();
            for _ in 0..len {
                let b = mk(tip.height + 1, Some(&tip), steps, salt);
                self.put(&b);
                tip = b.clone();
                out.push(b);
            }
            out
        }

        fn fc(&self) -> ForkChoice<'_> {
            ForkChoice::new(&self.ctx, &self.store)
        }
    }

    #[test]
    fn test_identical_heads_rejected() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        assert!(!t.fc().should_accept_new_head(&g, &g).unwrap());
    }

    #[test]
    fn test_height_outside_window() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let long = t.extend(&g, 9, 1_000, 2);
        let short = t.extend(&g, 2, 2, 3);
        let fc = t.fc();
        assert_eq!(fc.finality_depth(&g), 4);
        let (l, s) = (long.last().unwrap(), short.last().unwrap());
        assert!(fc.should_accept_new_head(l, s).unwrap());
        assert!(!fc.should_accept_new_head(s, l).unwrap());
    }

    #[test]
    fn test_fork_point_fewer_steps_wins() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let fast = mk(2, Some(&g), 100, 2);
        let slow = mk(2, Some(&g), 300, 3);
        t.put(&fast);
        t.put(&slow);
        let fc = t.fc();
        assert!(fc.should_accept_new_head(&fast, &slow).unwrap());
        assert!(!fc.should_accept_new_head(&slow, &fast).unwrap());

        // fork point found below the heads: fast branch wins even when shorter
        let slow_tip = t.extend(&slow, 2, 1, 4);
        assert!(fc.should_accept_new_head(&fast, slow_tip.last().unwrap()).unwrap());
    }

    #[test]
    fn test_tie_breaks_on_hash() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let a = mk(2, Some(&g), 100, 2);
        let b = mk(2, Some(&g), 100, 3);
        let fc = t.fc();
        let a_first = a.hash() < b.hash();
        assert_eq!(fc.should_accept_new_head(&a, &b).unwrap(), a_first);
        assert_eq!(fc.should_accept_new_head(&b, &a).unwrap(), !a_first);
    }

    #[test]
    fn test_genesis_siblings() {
        let t = Tree::new();
        let a = mk(1, None, 10, 1);
        let b = mk(1, None, 20, 2);
        assert!(t.fc().should_accept_new_head(&a, &b).unwrap());
    }

    #[test]
    fn test_descendant_accepted() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let chain = t.extend(&g, 3, 50, 2);
        let fc = t.fc();
        assert!(fc.should_accept_new_head(&chain[2], &chain[0]).unwrap());
        assert!(!fc.should_accept_new_head(&chain[0], &chain[2]).unwrap());
    }

    #[test]
    fn test_window_exhausted_uses_cumulative_difficulty() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let light = t.extend(&g, 7, 10, 2);
        let heavy = t.extend(&g, 7, 20, 3);
        // the window (4) ends before the fork point at height 2
        let fc = t.fc();
        let (l, h) = (light.last().unwrap(), heavy.last().unwrap());
        assert!(fc.should_accept_new_head(l, h).unwrap());
        assert!(!fc.should_accept_new_head(h, l).unwrap());
        assert_eq!(fc.cumulative_difficulty(l).unwrap(), 10 + 70);
    }

    #[test]
    fn test_unstored_old_head() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        t.put(&g);
        let branch = t.extend(&g, 7, 10, 2);
        let other = t.extend(&g, 6, 20, 3);
        // being mined, not stored
        let mining = mk(8, other.last(), 20, 4);
        let fc = t.fc();
        assert_eq!(fc.cumulative_difficulty(&mining).unwrap(), 10 + 7 * 20);
        assert!(fc.should_accept_new_head(branch.last().unwrap(), &mining).unwrap());
    }

    #[test]
    fn test_missing_ancestor_is_fatal() {
        let t = Tree::new();
        let g = mk(1, None, 10, 1);
        let a = mk(2, Some(&g), 5, 2);
        let b = mk(2, Some(&mk(1, None, 11, 3)), 5, 3);
        // nothing stored: the walk needs the parents
        let err = t.fc().should_accept_new_head(&mk(3, Some(&a), 1, 4), &b).unwrap_err();
        assert!(matches!(err, ForkChoiceError::MissingAncestor(_)));
    }
}
