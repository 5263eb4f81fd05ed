pub mod chain;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod db;
pub mod fixed;
pub mod fork_choice;
pub mod ledger;
pub mod producer;
pub mod prune;
pub mod stake;
pub mod types;
pub mod validator;
pub mod vdf;

pub use types::*;

// Core
pub use config::{ConfigError, ConsensusContext, ControllerParams, GenesisParams, PruneParams, VdfParams};
pub use controller::{ControllerSnapshot, DifficultyController};
pub use crypto::{sha256, sha3, Ed25519Verifier, Keypair, Signer, Verifier};
pub use fixed::UNIT;
pub use vdf::{decode_le, encode_le, CodecError, SlothVdf, VdfError};

// Validation and chain selection
pub use fork_choice::{ForkChoice, ForkChoiceError};
pub use validator::{BlockTemplate, BlockValidator, ErrorKind, ValidationError, ValidationState};

// State
pub use chain::{Chain, ChainError, Verdict};
pub use db::{MemoryStore, ObjectStore, Storage, StoreError};
pub use ledger::{Ledger, LedgerDelta, LedgerError};
pub use prune::Pruner;
pub use stake::{FlatStake, StakeOracle, StakeTable};

// Production
pub use producer::{Producer, ProducerError};
