use crate::controller::ControllerSnapshot;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];  // Ed25519
pub type Signature = Vec<u8>;   // Ed25519: 64 bytes
pub type AccountId = PublicKey;

/// First 8 hex chars, for logs
pub fn short(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

fn update_big(hasher: &mut Sha3_256, value: &BigUint) {
    let bytes = value.to_bytes_le();
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(&bytes);
}

fn update_optional(hasher: &mut Sha3_256, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            hasher.update([1u8]);
            update_bytes(hasher, b);
        }
        None => hasher.update([0u8]),
    }
}

fn update_bytes(hasher: &mut Sha3_256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Balance transfer. Amounts are fixed-point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: BigUint,
    pub fee: BigUint,
    pub nonce: u64,
    /// Source's signature over [`signing_message`](Self::signing_message)
    pub signature: Signature,
}

impl Transaction {
    pub fn signing_message(&self) -> Hash {
        let mut hasher = Sha3_256::new();
        hasher.update(b"pulsar/tx");
        hasher.update(self.source);
        hasher.update(self.destination);
        update_big(&mut hasher, &self.amount);
        update_big(&mut hasher, &self.fee);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }

    /// Content hash, signature included
    pub fn id(&self) -> Hash {
        let mut hasher = Sha3_256::new();
        hasher.update(self.signing_message());
        update_bytes(&mut hasher, &self.signature);
        hasher.finalize().into()
    }
}

// =============================================================================
// BLOCKS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// None only at height 1
    pub prev: Option<Hash>,
    pub author: PublicKey,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// VDF steps of `proof`
    pub steps: u64,
    pub proof: Vec<u8>,
    /// Secondary proof, present only during the bootstrap period
    pub bootstrap_proof: Option<Vec<u8>>,
    /// Author's signature over the predecessor hash
    pub vrf_seed: Option<Signature>,
    pub block_time_factor: BigUint,
    pub moving_max_speed: BigUint,
    pub moving_min_speed: BigUint,
    pub reward: BigUint,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha3_256::new();
        hasher.update(b"pulsar/block");
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.prev.unwrap_or([0u8; 32]));
        hasher.update(self.author);
        hasher.update(self.timestamp_ms.to_le_bytes());
        hasher.update(self.steps.to_le_bytes());
        update_bytes(&mut hasher, &self.proof);
        update_optional(&mut hasher, self.bootstrap_proof.as_deref());
        update_optional(&mut hasher, self.vrf_seed.as_deref());
        update_big(&mut hasher, &self.block_time_factor);
        update_big(&mut hasher, &self.moving_max_speed);
        update_big(&mut hasher, &self.moving_min_speed);
        update_big(&mut hasher, &self.reward);
        hasher.update((self.transactions.len() as u32).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(tx.id());
        }
        hasher.finalize().into()
    }

    /// Controller state after this block
    pub fn controller_snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            height: self.height,
            block_time_factor: self.block_time_factor.clone(),
            moving_max_speed: self.moving_max_speed.clone(),
            moving_min_speed: self.moving_min_speed.clone(),
        }
    }
}

// =============================================================================
// PRUNE MARKERS
// =============================================================================

/// Stands in for a batch of abandoned branch tips
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneMarker {
    pub predecessors: Vec<Hash>,
}

impl PruneMarker {
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha3_256::new();
        hasher.update(b"pulsar/marker");
        hasher.update((self.predecessors.len() as u32).to_le_bytes());
        for p in &self.predecessors {
            hasher.update(p);
        }
        hasher.finalize().into()
    }
}

/// Anything that can sit in the chain graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainOp {
    Block(Block),
    Marker(PruneMarker),
}

impl ChainOp {
    pub fn hash(&self) -> Hash {
        match self {
            ChainOp::Block(b) => b.hash(),
            ChainOp::Marker(m) => m.hash(),
        }
    }

    pub fn predecessors(&self) -> Vec<Hash> {
        match self {
            ChainOp::Block(b) => b.prev.into_iter().collect(),
            ChainOp::Marker(m) => m.predecessors.clone(),
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            ChainOp::Block(b) => Some(b),
            ChainOp::Marker(_) => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, ChainOp::Marker(_))
    }
}

/// Derived from causal history, stored beside the op, not part of its hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPosition {
    pub height: u64,
    /// Sum of VDF steps from genesis
    pub cumulative_difficulty: u128,
    /// Excluded from peer-facing height summaries
    pub ignore: bool,
}
