//! Block validation
//!
//! ```text
//! Incomplete ──structure──▶ StructurallyValid ──consensus──▶ ConsensusValid
//!      │                           │
//!      └────────────▶ Rejected(reason) ◀──┘
//! ```
//!
//! The consensus step rebuilds the controller from the predecessor, derives
//! the challenge from the VRF seed and recomputes the step count. Every field
//! the block carries forward must match the recomputation exactly.

use crate::config::ConsensusContext;
use crate::controller::{ControllerSnapshot, DifficultyController};
use crate::crypto::{sha256, Verifier};
use crate::fixed::UNIT;
use crate::stake::StakeOracle;
use crate::types::{short, Block, Hash, PublicKey, Signature, Transaction};
use crate::vdf::SlothVdf;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::collections::HashSet;
use thiserror::Error;

/// Rejection class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Consensus,
    Ledger,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    // Structural
    #[error("height must be positive")]
    ZeroHeight,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("proof is {len} bytes, expected {width}")]
    ProofWidth { len: usize, width: usize },
    #[error("bootstrap proof is {len} bytes, expected {width}")]
    BootstrapProofWidth { len: usize, width: usize },
    #[error("{count} transactions, at most {max} allowed")]
    TooManyTransactions { count: usize, max: usize },

    // Topology
    #[error("height 1 must not reference a predecessor")]
    GenesisWithPredecessor,
    #[error("height 1 must not carry a VRF seed")]
    GenesisWithVrfSeed,
    #[error("missing predecessor reference")]
    MissingPredecessor,
    #[error("missing VRF seed")]
    MissingVrfSeed,
    #[error("predecessor {0} not found")]
    UnknownPredecessor(String),
    #[error("height {got}, expected {expected}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("VRF seed is not the author's signature over the predecessor")]
    BadVrfSeed,

    // Time
    #[error("timestamp {got} not after predecessor {prev}")]
    TimestampNotAfterPredecessor { prev: u64, got: u64 },
    #[error("timestamp {got} too far ahead of local clock {now}")]
    TimestampInFuture { now: u64, got: u64 },

    // Difficulty
    #[error("required steps {0} do not fit in 64 bits")]
    StepsOutOfRange(String),
    #[error("steps {got}, expected {expected}")]
    StepsMismatch { expected: u64, got: u64 },
    #[error("controller field {field} does not match recomputation")]
    ControllerMismatch { field: &'static str },
    #[error("block reward does not match")]
    RewardMismatch,

    // Proofs
    #[error("bootstrap period requires a bootstrap proof")]
    MissingBootstrapProof,
    #[error("bootstrap proof outside the bootstrap period")]
    UnexpectedBootstrapProof,
    #[error("bootstrap proof does not verify")]
    BadBootstrapProof,
    #[error("VDF proof does not verify")]
    BadProof,

    // Transactions
    #[error("transaction {id}: {reason}")]
    BadTransaction { id: String, reason: &'static str },
    #[error("transaction {0} appears twice")]
    DuplicateTransaction(String),

    // Ledger
    #[error("ledger delta invalid: overdraft or double spend")]
    LedgerInvalid,
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        use ValidationError::*;
        match self {
            ZeroHeight
            | MissingTimestamp
            | ProofWidth { .. }
            | BootstrapProofWidth { .. }
            | TooManyTransactions { .. } => ErrorKind::Structural,
            LedgerInvalid => ErrorKind::Ledger,
            _ => ErrorKind::Consensus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    Incomplete,
    StructurallyValid,
    ConsensusValid,
    Rejected(ValidationError),
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidationState::ConsensusValid | ValidationState::Rejected(_))
    }
}

/// Local wall clock in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Fixed-point seconds between two millisecond timestamps, at least 1 ms
pub fn block_time(prev_ms: u64, ms: u64) -> BigUint {
    let elapsed = ms.saturating_sub(prev_ms).max(1);
    BigUint::from(elapsed) * UNIT / 1000u32
}

// ============================================================================
// TEMPLATE
// ============================================================================

/// Everything the next block on top of `prev` must satisfy, minus the
/// timestamp-dependent controller update.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: u64,
    pub prev: Option<Hash>,
    pub prev_timestamp_ms: Option<u64>,
    pub author: PublicKey,
    pub vrf_seed: Option<Signature>,
    /// VDF input, `proof_width` bytes
    pub challenge: Vec<u8>,
    pub steps: u64,
    /// Secondary proof steps during bootstrap
    pub bootstrap_steps: Option<u64>,
    /// Seeded from the predecessor, no sample applied yet
    pub controller: DifficultyController,
}

impl BlockTemplate {
    pub fn new(
        ctx: &ConsensusContext,
        stake: &dyn StakeOracle,
        prev: Option<&Block>,
        author: PublicKey,
        vrf_seed: Option<Signature>,
    ) -> Result<Self, ValidationError> {
        let controller = match prev {
            Some(p) => DifficultyController::from_snapshot(&ctx.controller, &ctx.genesis, &p.controller_snapshot()),
            None => DifficultyController::genesis(&ctx.controller, &ctx.genesis),
        };

        let digest = match &vrf_seed {
            Some(seed) => sha256(seed),
            None => sha256(ctx.chain_id.as_bytes()),
        };
        let seed = BigUint::from_bytes_be(&digest.repeat(4));
        let challenge: Vec<u8> = digest.iter().copied().cycle().take(ctx.vdf.proof_width).collect();

        let required = controller.consensus_difficulty(&stake.stake_of(&author), &stake.total_stake(), &seed);
        let steps = required
            .to_u64()
            .ok_or_else(|| ValidationError::StepsOutOfRange(required.to_string()))?;
        let bootstrap_steps = if controller.is_bootstrap_period() {
            let b = controller.bootstrap_difficulty();
            Some(b.to_u64().ok_or_else(|| ValidationError::StepsOutOfRange(b.to_string()))?)
        } else {
            None
        };

        Ok(Self {
            height: prev.map_or(1, |p| p.height + 1),
            prev: prev.map(Block::hash),
            prev_timestamp_ms: prev.map(|p| p.timestamp_ms),
            author,
            vrf_seed,
            challenge,
            steps,
            bootstrap_steps,
            controller,
        })
    }

    /// Controller after this block's sample
    pub fn controller_after(&self, timestamp_ms: u64) -> DifficultyController {
        let elapsed = match self.prev_timestamp_ms {
            Some(prev) => block_time(prev, timestamp_ms),
            None => self.controller.target_block_time(),
        };
        let mut c = self.controller.clone();
        c.add_block_sample(&elapsed, self.steps);
        c
    }

    pub fn seal(
        &self,
        timestamp_ms: u64,
        proof: Vec<u8>,
        bootstrap_proof: Option<Vec<u8>>,
        transactions: Vec<Transaction>,
    ) -> Block {
        let after = self.controller_after(timestamp_ms);
        let ControllerSnapshot { block_time_factor, moving_max_speed, moving_min_speed, .. } = after.snapshot();
        Block {
            height: self.height,
            prev: self.prev,
            author: self.author,
            timestamp_ms,
            steps: self.steps,
            proof,
            bootstrap_proof,
            vrf_seed: self.vrf_seed.clone(),
            block_time_factor,
            moving_max_speed,
            moving_min_speed,
            reward: after.block_reward().clone(),
            transactions,
        }
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct BlockValidator<'a> {
    ctx: &'a ConsensusContext,
    vdf: &'a SlothVdf,
    verifier: &'a dyn Verifier,
    stake: &'a dyn StakeOracle,
}

impl<'a> BlockValidator<'a> {
    pub fn new(
        ctx: &'a ConsensusContext,
        vdf: &'a SlothVdf,
        verifier: &'a dyn Verifier,
        stake: &'a dyn StakeOracle,
    ) -> Self {
        Self { ctx, vdf, verifier, stake }
    }

    /// Run the state machine to a terminal state
    pub fn validate(&self, block: &Block, prev: Option<&Block>, now_ms: u64) -> ValidationState {
        let mut state = ValidationState::Incomplete;
        while !state.is_terminal() {
            state = self.step(state, block, prev, now_ms);
        }
        state
    }

    /// One transition
    pub fn step(&self, state: ValidationState, block: &Block, prev: Option<&Block>, now_ms: u64) -> ValidationState {
        let result = match state {
            ValidationState::Incomplete => self.check_structure(block).map(|_| ValidationState::StructurallyValid),
            ValidationState::StructurallyValid => {
                self.check_consensus(block, prev, now_ms).map(|_| ValidationState::ConsensusValid)
            }
            terminal => return terminal,
        };
        result.unwrap_or_else(ValidationState::Rejected)
    }

    pub fn check_structure(&self, block: &Block) -> Result<(), ValidationError> {
        let width = self.ctx.vdf.proof_width;
        if block.height == 0 {
            return Err(ValidationError::ZeroHeight);
        }
        if block.timestamp_ms == 0 {
            return Err(ValidationError::MissingTimestamp);
        }
        if block.proof.len() != width {
            return Err(ValidationError::ProofWidth { len: block.proof.len(), width });
        }
        if let Some(bp) = &block.bootstrap_proof {
            if bp.len() != width {
                return Err(ValidationError::BootstrapProofWidth { len: bp.len(), width });
            }
        }
        if block.transactions.len() > self.ctx.max_transactions_per_block {
            return Err(ValidationError::TooManyTransactions {
                count: block.transactions.len(),
                max: self.ctx.max_transactions_per_block,
            });
        }
        Ok(())
    }

    fn check_topology(&self, block: &Block, prev: Option<&Block>) -> Result<(), ValidationError> {
        if block.height == 1 {
            if block.prev.is_some() {
                return Err(ValidationError::GenesisWithPredecessor);
            }
            if block.vrf_seed.is_some() {
                return Err(ValidationError::GenesisWithVrfSeed);
            }
            return Ok(());
        }

        let prev_hash = block.prev.ok_or(ValidationError::MissingPredecessor)?;
        let seed = block.vrf_seed.as_ref().ok_or(ValidationError::MissingVrfSeed)?;
        let prev = match prev {
            Some(p) if p.hash() == prev_hash => p,
            _ => return Err(ValidationError::UnknownPredecessor(short(&prev_hash))),
        };
        if block.height != prev.height + 1 {
            return Err(ValidationError::HeightMismatch { expected: prev.height + 1, got: block.height });
        }
        if !self.verifier.verify(&block.author, &prev_hash, seed) {
            return Err(ValidationError::BadVrfSeed);
        }
        if block.timestamp_ms <= prev.timestamp_ms {
            return Err(ValidationError::TimestampNotAfterPredecessor { prev: prev.timestamp_ms, got: block.timestamp_ms });
        }
        Ok(())
    }

    fn check_consensus(&self, block: &Block, prev: Option<&Block>, now_ms: u64) -> Result<(), ValidationError> {
        self.check_topology(block, prev)?;

        let horizon = now_ms.saturating_add(self.ctx.controller.target_block_time_ms);
        if block.timestamp_ms > horizon {
            return Err(ValidationError::TimestampInFuture { now: now_ms, got: block.timestamp_ms });
        }

        let template = BlockTemplate::new(self.ctx, self.stake, prev, block.author, block.vrf_seed.clone())?;
        if block.steps != template.steps {
            return Err(ValidationError::StepsMismatch { expected: template.steps, got: block.steps });
        }

        let after = template.controller_after(block.timestamp_ms);
        if block.block_time_factor != *after.block_time_factor() {
            return Err(ValidationError::ControllerMismatch { field: "block_time_factor" });
        }
        if block.moving_max_speed != *after.moving_max_speed() {
            return Err(ValidationError::ControllerMismatch { field: "moving_max_speed" });
        }
        if block.moving_min_speed != *after.moving_min_speed() {
            return Err(ValidationError::ControllerMismatch { field: "moving_min_speed" });
        }
        if block.height != after.height() {
            return Err(ValidationError::ControllerMismatch { field: "height" });
        }
        if block.reward != *after.block_reward() {
            return Err(ValidationError::RewardMismatch);
        }

        self.check_proofs(block, &template)?;
        self.check_transactions(block)
    }

    fn check_proofs(&self, block: &Block, template: &BlockTemplate) -> Result<(), ValidationError> {
        let width = self.ctx.vdf.proof_width;
        let main_challenge = match (template.bootstrap_steps, &block.bootstrap_proof) {
            (Some(steps), Some(bp)) => {
                if !self.vdf.verify_bytes(&template.challenge, steps, bp, width) {
                    return Err(ValidationError::BadBootstrapProof);
                }
                bp.as_slice()
            }
            (Some(_), None) => return Err(ValidationError::MissingBootstrapProof),
            (None, Some(_)) => return Err(ValidationError::UnexpectedBootstrapProof),
            (None, None) => template.challenge.as_slice(),
        };
        if !self.vdf.verify_bytes(main_challenge, block.steps, &block.proof, width) {
            return Err(ValidationError::BadProof);
        }
        Ok(())
    }

    fn check_transactions(&self, block: &Block) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for tx in &block.transactions {
            let id = tx.id();
            let bad = |reason| ValidationError::BadTransaction { id: short(&id), reason };
            if tx.amount.is_zero() {
                return Err(bad("zero amount"));
            }
            if tx.source == tx.destination {
                return Err(bad("source equals destination"));
            }
            if !self.verifier.verify(&tx.source, &tx.signing_message(), &tx.signature) {
                return Err(bad("bad signature"));
            }
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateTransaction(short(&id)));
            }
        }
        Ok(())
    }
}
