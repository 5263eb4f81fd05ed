//! Chain instance
//!
//! Связывает все слои одной цепи:
//! - validator.rs: проверка кандидата
//! - fork_choice.rs: выбор головы
//! - ledger.rs: балансы через delta
//! - prune.rs: сворачивание старых веток
//! - db.rs: хранилище
//!
//! One writer per chain. A candidate's ledger delta and fork-choice verdict
//! are computed against a snapshot of (head, ledger); the commit re-checks
//! that the head did not move in between and starts over if it did.
//!
//! The API is synchronous and no guard is ever held across an await, so
//! state sits behind `std::sync::RwLock` rather than the tokio one.

use crate::config::{ConfigError, ConsensusContext};
use crate::crypto::Verifier;
use crate::db::{ObjectStore, StoreError};
use crate::fixed::{display, UNIT};
use crate::fork_choice::{ForkChoice, ForkChoiceError};
use crate::ledger::{Ledger, LedgerDelta, LedgerError};
use crate::prune::Pruner;
use crate::stake::StakeOracle;
use crate::types::{short, AccountId, Block, ChainOp, ChainPosition, Hash};
use crate::validator::{block_time, now_ms, BlockValidator, ValidationError, ValidationState};
use crate::vdf::SlothVdf;
use num_bigint::BigUint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fatal failures. Ordinary rejections are a [`Verdict`], not an error.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("fork choice: {0}")]
    ForkChoice(#[from] ForkChoiceError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("ancestor {0} missing from store")]
    MissingAncestor(String),
    #[error("chain state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Stored; `new_head` tells whether it became the head
    ConsensusValid { new_head: bool },
    Rejected(ValidationError),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::ConsensusValid { .. })
    }
}

pub type NewHeadCallback = Arc<dyn Fn(&Block, bool) + Send + Sync>;

#[derive(Clone, Default)]
struct ChainState {
    head: Option<Block>,
    ledger: Arc<Ledger>,
}

impl ChainState {
    fn head_hash(&self) -> Option<Hash> {
        self.head.as_ref().map(Block::hash)
    }
}

pub struct Chain {
    ctx: ConsensusContext,
    vdf: SlothVdf,
    verifier: Arc<dyn Verifier>,
    stake: Arc<dyn StakeOracle>,
    store: Arc<dyn ObjectStore>,
    state: RwLock<ChainState>,
    callbacks: RwLock<Vec<NewHeadCallback>>,
    synchronized: AtomicBool,
    pruner: Pruner,
}

impl Chain {
    /// Opens a chain over `store`, picking the head back up if the store
    /// already holds blocks.
    pub fn new(
        ctx: ConsensusContext,
        verifier: Arc<dyn Verifier>,
        stake: Arc<dyn StakeOracle>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ChainError> {
        ctx.validate()?;
        let vdf = ctx.sloth()?;
        let pruner = Pruner::new(ctx.prune.clone());
        let chain = Self {
            ctx,
            vdf,
            verifier,
            stake,
            store,
            state: RwLock::new(ChainState::default()),
            callbacks: RwLock::new(Vec::new()),
            synchronized: AtomicBool::new(false),
            pruner,
        };
        chain.recover()?;
        Ok(chain)
    }

    fn recover(&self) -> Result<(), ChainError> {
        let fork_choice = ForkChoice::new(&self.ctx, self.store.as_ref());
        let mut best: Option<Block> = None;
        for hash in self.store.terminals()? {
            let Some(block) = self.store.load_block(&hash)? else {
                continue;
            };
            let better = match &best {
                Some(current) => fork_choice.should_accept_new_head(&block, current)?,
                None => true,
            };
            if better {
                best = Some(block);
            }
        }
        let Some(head) = best else {
            return Ok(());
        };

        let empty = Arc::new(Ledger::new());
        let delta = self.branch_delta(&empty, None, &head)?;
        let mut ledger = Ledger::new();
        ledger.commit(&delta)?;
        info!(height = head.height, hash = %short(&head.hash()), "recovered head from store");
        let mut state = self.state.write().map_err(|_| ChainError::Poisoned)?;
        *state = ChainState { head: Some(head), ledger: Arc::new(ledger) };
        Ok(())
    }

    pub fn context(&self) -> &ConsensusContext {
        &self.ctx
    }

    pub fn vdf(&self) -> &SlothVdf {
        &self.vdf
    }

    pub fn stake(&self) -> &dyn StakeOracle {
        self.stake.as_ref()
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn current_head(&self) -> Option<Block> {
        self.state.read().ok().and_then(|s| s.head.clone())
    }

    pub fn height(&self) -> u64 {
        self.current_head().map_or(0, |b| b.height)
    }

    pub fn balance(&self, account: &AccountId) -> BigUint {
        self.state.read().map(|s| s.ledger.balance(account)).unwrap_or_default()
    }

    pub fn register_new_head_callback<F>(&self, callback: F)
    where
        F: Fn(&Block, bool) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// History fully consumed; enables pruning
    pub fn mark_synchronized(&self) {
        self.synchronized.store(true, Ordering::Release);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Would `candidate` replace `current` as head?
    pub fn prefers(&self, candidate: &Block, current: &Block) -> Result<bool, ChainError> {
        Ok(ForkChoice::new(&self.ctx, self.store.as_ref()).should_accept_new_head(candidate, current)?)
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    pub fn submit_candidate_block(&self, block: Block) -> Result<Verdict, ChainError> {
        let hash = block.hash();
        if self.store.contains(&hash)? {
            debug!(height = block.height, hash = %short(&hash), "block already known");
            return Ok(Verdict::ConsensusValid { new_head: false });
        }

        let prev = match block.prev {
            Some(p) => self.store.load_block(&p)?,
            None => None,
        };
        let validator = BlockValidator::new(&self.ctx, &self.vdf, self.verifier.as_ref(), self.stake.as_ref());
        if let ValidationState::Rejected(reason) = validator.validate(&block, prev.as_ref(), now_ms()) {
            warn!(height = block.height, hash = %short(&hash), kind = ?reason.kind(), %reason, "block rejected");
            return Ok(Verdict::Rejected(reason));
        }

        let position = self.position_of(&block)?;
        let new_head = loop {
            let snapshot = self.state.read().map_err(|_| ChainError::Poisoned)?.clone();
            let delta = self.branch_delta(&snapshot.ledger, snapshot.head.as_ref(), &block)?;
            if !delta.is_valid() {
                let reason = ValidationError::LedgerInvalid;
                warn!(height = block.height, hash = %short(&hash), %reason, "block rejected");
                return Ok(Verdict::Rejected(reason));
            }
            let new_head = match &snapshot.head {
                Some(head) => self.prefers(&block, head)?,
                None => true,
            };

            let mut state = self.state.write().map_err(|_| ChainError::Poisoned)?;
            if state.head_hash() != snapshot.head_hash() {
                debug!(height = block.height, "head moved during evaluation, retrying");
                continue;
            }
            self.store.put(&ChainOp::Block(block.clone()), position)?;
            if new_head {
                Arc::make_mut(&mut state.ledger).commit(&delta)?;
                state.head = Some(block.clone());
            }
            break new_head;
        };

        let elapsed = prev.as_ref().map(|p| display(&block_time(p.timestamp_ms, block.timestamp_ms)));
        info!(
            height = block.height,
            hash = %short(&hash),
            steps = block.steps,
            block_time = elapsed.as_deref().unwrap_or("-"),
            new_head,
            "block accepted"
        );

        let callbacks = self.callbacks.read().map(|c| c.clone()).unwrap_or_default();
        for callback in &callbacks {
            callback(&block, new_head);
        }

        if new_head {
            let markers = self.pruner.maybe_prune(self.store.as_ref(), &hash, block.height, self.is_synchronized())?;
            if !markers.is_empty() {
                info!(height = block.height, markers = markers.len(), "pruned stale branches");
            }
        }
        Ok(Verdict::ConsensusValid { new_head })
    }

    fn position_of(&self, block: &Block) -> Result<ChainPosition, ChainError> {
        let base = match block.prev {
            Some(p) => {
                self.store
                    .load_position(&p)?
                    .ok_or_else(|| ChainError::MissingAncestor(short(&p)))?
                    .cumulative_difficulty
            }
            None => 0,
        };
        Ok(ChainPosition {
            height: block.height,
            cumulative_difficulty: base + block.steps as u128,
            ignore: false,
        })
    }

    fn parent(&self, block: &Block) -> Result<Option<Block>, ChainError> {
        match block.prev {
            Some(p) => Ok(Some(
                self.store.load_block(&p)?.ok_or_else(|| ChainError::MissingAncestor(short(&p)))?,
            )),
            None => Ok(None),
        }
    }

    /// Delta taking `ledger` (at `head`) to `target`: revert the old branch
    /// down to the common ancestor, then apply the new one.
    fn branch_delta(&self, ledger: &Arc<Ledger>, head: Option<&Block>, target: &Block) -> Result<LedgerDelta, ChainError> {
        let mut back = Vec::new();
        let mut forward = vec![target.clone()];
        let mut a = head.cloned();
        let mut b = self.parent(target)?;

        loop {
            match (a, b) {
                (None, None) => break,
                (Some(x), Some(y)) if x.hash() == y.hash() => break,
                (Some(x), Some(y)) if x.height > y.height => {
                    a = self.parent(&x)?;
                    b = Some(y);
                    back.push(x);
                }
                (Some(x), Some(y)) if y.height > x.height => {
                    a = Some(x);
                    b = self.parent(&y)?;
                    forward.push(y);
                }
                (Some(x), Some(y)) => {
                    a = self.parent(&x)?;
                    b = self.parent(&y)?;
                    back.push(x);
                    forward.push(y);
                }
                (Some(x), None) => {
                    a = self.parent(&x)?;
                    b = None;
                    back.push(x);
                }
                (None, Some(y)) => {
                    a = None;
                    b = self.parent(&y)?;
                    forward.push(y);
                }
            }
        }

        let mut delta = ledger.create_delta();
        for block in &back {
            delta.revert_block(block)?;
        }
        for block in forward.iter().rev() {
            delta.apply_block(block)?;
        }
        Ok(delta)
    }

    // ========================================================================
    // PEER-FACING SUMMARY
    // ========================================================================

    /// Highest known terminal, prune markers excluded
    pub fn summary_height(&self) -> Result<u64, ChainError> {
        let mut top = 0;
        for hash in self.store.terminals()? {
            if let Some(pos) = self.store.load_position(&hash)? {
                if !pos.ignore {
                    top = top.max(pos.height);
                }
            }
        }
        Ok(top)
    }

    /// Keep the competing terminals worth gossiping: known, not a prune
    /// marker, and at most trunc(max speed ratio) below the local maximum.
    pub fn gossip_filter(&self, terminals: &[Hash]) -> Result<Vec<Hash>, ChainError> {
        let window = (self.ctx.genesis.max_speed_ratio_fp / UNIT as u128) as u64;
        let floor = self.summary_height()?.saturating_sub(window);
        let mut kept = Vec::new();
        for hash in terminals {
            match self.store.load_position(hash)? {
                Some(pos) if !pos.ignore && pos.height >= floor => kept.push(*hash),
                _ => {}
            }
        }
        Ok(kept)
    }

    /// [`gossip_filter`](Self::gossip_filter) over every local terminal
    pub fn gossip_terminals(&self) -> Result<Vec<Hash>, ChainError> {
        let terminals = self.store.terminals()?;
        self.gossip_filter(&terminals)
    }
}
