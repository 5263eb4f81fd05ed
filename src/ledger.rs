//! Ledger Engine
//!
//! Балансы и применённые транзакции. Ledger меняется только через commit
//! готового `LedgerDelta`.
//!
//! A [`LedgerDelta`] is a working copy over a shared, immutable base
//! snapshot. Walking back (revert) and forward (apply) only touches the
//! delta. Overdraft and double spend flip `valid` off for good, they are
//! never raised as errors.

use crate::types::{short, AccountId, Block, Hash};
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{Signed, Zero};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("delta head {head} does not match block link {expected}")]
    HeadMismatch { head: String, expected: String },
    #[error("cannot compose: first delta ends at {first_head}, second starts at {second_initial}")]
    CompositionMismatch { first_head: String, second_initial: String },
    #[error("invalid delta cannot be committed")]
    InvalidDelta,
    #[error("commit would overdraw {0}")]
    Overdraft(String),
}

fn label(hash: &Option<Hash>) -> String {
    hash.as_ref().map_or_else(|| "none".to_string(), short)
}

fn signed(x: &BigUint) -> BigInt {
    BigInt::from_biguint(Sign::Plus, x.clone())
}

// ============================================================================
// LEDGER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    balances: HashMap<AccountId, BigUint>,
    applied: HashSet<Hash>,
    head: Option<Hash>,
    height: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &AccountId) -> BigUint {
        self.balances.get(account).cloned().unwrap_or_default()
    }

    pub fn balances(&self) -> &HashMap<AccountId, BigUint> {
        &self.balances
    }

    pub fn is_applied(&self, tx: &Hash) -> bool {
        self.applied.contains(tx)
    }

    pub fn head(&self) -> Option<Hash> {
        self.head
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Empty delta starting at the current head
    pub fn create_delta(self: &Arc<Self>) -> LedgerDelta {
        LedgerDelta {
            base: Arc::clone(self),
            changes: HashMap::new(),
            applied: HashSet::new(),
            reverted: HashSet::new(),
            initial_hash: self.head,
            initial_height: self.height,
            head_hash: self.head,
            head_height: self.height,
            valid: true,
        }
    }

    /// All-or-nothing: nothing changes unless every check passes.
    pub fn commit(&mut self, delta: &LedgerDelta) -> Result<(), LedgerError> {
        if !delta.valid {
            return Err(LedgerError::InvalidDelta);
        }
        if delta.initial_hash != self.head {
            return Err(LedgerError::HeadMismatch { head: label(&self.head), expected: label(&delta.initial_hash) });
        }

        let mut updated = Vec::with_capacity(delta.changes.len());
        for (account, change) in &delta.changes {
            let next = signed(&self.balance(account)) + change;
            let next = next.to_biguint().ok_or_else(|| LedgerError::Overdraft(hex::encode(&account[..4])))?;
            updated.push((*account, next));
        }

        for (account, balance) in updated {
            if balance.is_zero() {
                self.balances.remove(&account);
            } else {
                self.balances.insert(account, balance);
            }
        }
        for tx in &delta.reverted {
            self.applied.remove(tx);
        }
        self.applied.extend(delta.applied.iter().copied());
        self.head = delta.head_hash;
        self.height = delta.head_height;
        Ok(())
    }
}

// ============================================================================
// DELTA
// ============================================================================

#[derive(Debug, Clone)]
pub struct LedgerDelta {
    base: Arc<Ledger>,
    /// Signed balance changes, zero entries pruned
    changes: HashMap<AccountId, BigInt>,
    applied: HashSet<Hash>,
    reverted: HashSet<Hash>,
    initial_hash: Option<Hash>,
    initial_height: u64,
    head_hash: Option<Hash>,
    head_height: u64,
    valid: bool,
}

impl LedgerDelta {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn head_hash(&self) -> Option<Hash> {
        self.head_hash
    }

    pub fn head_height(&self) -> u64 {
        self.head_height
    }

    pub fn initial_hash(&self) -> Option<Hash> {
        self.initial_hash
    }

    pub fn initial_height(&self) -> u64 {
        self.initial_height
    }

    pub fn changes(&self) -> &HashMap<AccountId, BigInt> {
        &self.changes
    }

    pub fn applied(&self) -> &HashSet<Hash> {
        &self.applied
    }

    pub fn reverted(&self) -> &HashSet<Hash> {
        &self.reverted
    }

    /// Base balance plus pending change; may be negative
    pub fn balance(&self, account: &AccountId) -> BigInt {
        let change = self.changes.get(account).cloned().unwrap_or_default();
        signed(&self.base.balance(account)) + change
    }

    pub fn is_tx_applied(&self, tx: &Hash) -> bool {
        self.applied.contains(tx) || (self.base.is_applied(tx) && !self.reverted.contains(tx))
    }

    fn adjust(&mut self, account: &AccountId, amount: BigInt) {
        let entry = self.changes.entry(*account).or_default();
        *entry += amount;
        if entry.is_zero() {
            self.changes.remove(account);
        }
        if self.balance(account).is_negative() {
            self.valid = false;
        }
    }

    fn credit(&mut self, account: &AccountId, amount: &BigUint) {
        self.adjust(account, signed(amount));
    }

    fn debit(&mut self, account: &AccountId, amount: &BigUint) {
        self.adjust(account, -signed(amount));
    }

    fn mark_applied(&mut self, tx: Hash) {
        if self.is_tx_applied(&tx) {
            self.valid = false;
        }
        if !self.reverted.remove(&tx) {
            self.applied.insert(tx);
        }
    }

    fn mark_reverted(&mut self, tx: Hash) {
        if !self.is_tx_applied(&tx) {
            self.valid = false;
        }
        if !self.applied.remove(&tx) {
            self.reverted.insert(tx);
        }
    }

    /// Walk forward by one block. The block must extend the delta head.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        if self.head_hash != block.prev {
            return Err(LedgerError::HeadMismatch { head: label(&self.head_hash), expected: label(&block.prev) });
        }
        self.credit(&block.author, &block.reward);
        for tx in &block.transactions {
            self.mark_applied(tx.id());
            self.debit(&tx.source, &(&tx.amount + &tx.fee));
            self.credit(&tx.destination, &tx.amount);
            self.credit(&block.author, &tx.fee);
        }
        self.head_hash = Some(block.hash());
        self.head_height = block.height;
        Ok(())
    }

    /// Walk back by one block. The block must be the delta head.
    pub fn revert_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        let hash = block.hash();
        if self.head_hash != Some(hash) {
            return Err(LedgerError::HeadMismatch { head: label(&self.head_hash), expected: short(&hash) });
        }
        for tx in block.transactions.iter().rev() {
            self.mark_reverted(tx.id());
            self.debit(&block.author, &tx.fee);
            self.debit(&tx.destination, &tx.amount);
            self.credit(&tx.source, &(&tx.amount + &tx.fee));
        }
        self.debit(&block.author, &block.reward);
        self.head_hash = block.prev;
        self.head_height = block.height.saturating_sub(1);
        Ok(())
    }

    /// `self` followed by `next`, as one delta over `self`'s base
    pub fn chain_after(&self, next: &LedgerDelta) -> Result<LedgerDelta, LedgerError> {
        if self.head_hash != next.initial_hash {
            return Err(LedgerError::CompositionMismatch {
                first_head: label(&self.head_hash),
                second_initial: label(&next.initial_hash),
            });
        }
        let mut changes = self.changes.clone();
        for (account, change) in &next.changes {
            let entry = changes.entry(*account).or_default();
            *entry += change;
            if entry.is_zero() {
                changes.remove(account);
            }
        }
        let applied = self
            .applied
            .difference(&next.reverted)
            .chain(next.applied.difference(&self.reverted))
            .copied()
            .collect();
        let reverted = self
            .reverted
            .difference(&next.applied)
            .chain(next.reverted.difference(&self.applied))
            .copied()
            .collect();
        let mut composed = LedgerDelta {
            base: Arc::clone(&self.base),
            changes,
            applied,
            reverted,
            initial_hash: self.initial_hash,
            initial_height: self.initial_height,
            head_hash: next.head_hash,
            head_height: next.head_height,
            valid: self.valid && next.valid,
        };
        let accounts: Vec<AccountId> = composed.changes.keys().copied().collect();
        if accounts.iter().any(|a| composed.balance(a).is_negative()) {
            composed.valid = false;
        }
        Ok(composed)
    }

    /// Undo `self`: runs from its head back to its initial point, over a
    /// base that already includes `self`.
    pub fn reverse(&self) -> LedgerDelta {
        let mut base = (*self.base).clone();
        for (account, change) in &self.changes {
            let next = signed(&base.balance(account)) + change;
            match next.to_biguint() {
                Some(b) if !b.is_zero() => {
                    base.balances.insert(*account, b);
                }
                _ => {
                    base.balances.remove(account);
                }
            }
        }
        for tx in &self.reverted {
            base.applied.remove(tx);
        }
        base.applied.extend(self.applied.iter().copied());
        base.head = self.head_hash;
        base.height = self.head_height;

        LedgerDelta {
            base: Arc::new(base),
            changes: self.changes.iter().map(|(a, c)| (*a, -c)).collect(),
            applied: self.reverted.clone(),
            reverted: self.applied.clone(),
            initial_hash: self.head_hash,
            initial_height: self.head_height,
            head_hash: self.initial_hash,
            head_height: self.initial_height,
            valid: self.valid,
        }
    }
}
