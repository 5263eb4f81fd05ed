//! Block producer
//!
//! Считает VDF следующего блока на blocking-потоке. Новая голова, которую
//! fork choice предпочитает строящемуся блоку, отменяет работу, и она
//! начинается заново поверх новой головы.

use crate::chain::{Chain, ChainError, Verdict};
use crate::crypto::{Keypair, Signer};
use crate::types::{short, Block, Transaction};
use crate::validator::{now_ms, BlockTemplate, ValidationError};
use crate::vdf::{decode_le, encode_le, CodecError, SlothVdf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("template: {0}")]
    Template(#[from] ValidationError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("worker: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Proofs of one block
struct Work {
    proof: Vec<u8>,
    bootstrap_proof: Option<Vec<u8>>,
}

/// Bootstrap proof over the challenge, then the main proof over whichever
/// of the two is the input. None once cancelled.
fn compute(
    vdf: &SlothVdf,
    template: &BlockTemplate,
    width: usize,
    cancel: &CancellationToken,
) -> Result<Option<Work>, CodecError> {
    let bootstrap_proof = match template.bootstrap_steps {
        Some(steps) => {
            let challenge = decode_le(&template.challenge, width)?;
            let Some(proof) = vdf.generate_cancellable(&challenge, steps, cancel) else {
                return Ok(None);
            };
            Some(encode_le(&proof, width)?)
        }
        None => None,
    };
    let input = bootstrap_proof.as_deref().unwrap_or(&template.challenge);
    let challenge = decode_le(input, width)?;
    let Some(proof) = vdf.generate_cancellable(&challenge, template.steps, cancel) else {
        return Ok(None);
    };
    Ok(Some(Work { proof: encode_le(&proof, width)?, bootstrap_proof }))
}

pub struct Producer {
    chain: Arc<Chain>,
    keypair: Arc<Keypair>,
    limit: Option<u64>,
}

impl Producer {
    pub fn new(chain: Arc<Chain>, keypair: Arc<Keypair>) -> Self {
        Self { chain, keypair, limit: None }
    }

    /// Stop once the chain reaches `height`
    pub fn with_limit(mut self, height: u64) -> Self {
        self.limit = Some(height);
        self
    }

    fn template(&self, head: Option<&Block>) -> Result<BlockTemplate, ProducerError> {
        let seed = head.map(|h| self.keypair.sign(&h.hash()));
        Ok(BlockTemplate::new(
            self.chain.context(),
            self.chain.stake(),
            head,
            self.keypair.public_key(),
            seed,
        )?)
    }

    /// Produce until `shutdown` fires or the height limit is reached.
    /// Returns the number of blocks this producer got accepted as head.
    pub async fn run(self, shutdown: CancellationToken) -> Result<u64, ProducerError> {
        let (tx, mut heads) = watch::channel::<Option<Block>>(None);
        self.chain.register_new_head_callback(move |block, is_head| {
            if is_head {
                tx.send_replace(Some(block.clone()));
            }
        });

        let width = self.chain.context().vdf.proof_width;
        let mut produced = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(produced);
            }
            let head = self.chain.current_head();
            if let (Some(limit), Some(h)) = (self.limit, &head) {
                if h.height >= limit {
                    info!(height = h.height, produced, "height limit reached");
                    return Ok(produced);
                }
            }
            heads.mark_unchanged();

            let template = Arc::new(self.template(head.as_ref())?);
            // stands in for the block being built when comparing heads
            let provisional = template.seal(now_ms(), vec![0u8; width], None, Vec::new());
            debug!(height = template.height, steps = template.steps, "computing proof");

            let cancel = shutdown.child_token();
            let mut worker = {
                let vdf = self.chain.vdf().clone();
                let template = Arc::clone(&template);
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || compute(&vdf, &template, width, &cancel))
            };

            let work = loop {
                tokio::select! {
                    result = &mut worker => break result??,
                    changed = heads.changed() => {
                        if changed.is_err() {
                            cancel.cancel();
                            return Ok(produced);
                        }
                        let newest = heads.borrow_and_update().clone();
                        if let Some(new_head) = newest {
                            if self.chain.prefers(&new_head, &provisional)? {
                                debug!(height = new_head.height, hash = %short(&new_head.hash()), "new head, restarting proof");
                                cancel.cancel();
                                break None;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        cancel.cancel();
                        return Ok(produced);
                    }
                }
            };
            let Some(work) = work else {
                continue;
            };

            let timestamp = match template.prev_timestamp_ms {
                Some(prev) => now_ms().max(prev + 1),
                None => now_ms(),
            };
            let block = template.seal(timestamp, work.proof, work.bootstrap_proof, self.transactions());
            let hash = block.hash();
            match self.chain.submit_candidate_block(block)? {
                Verdict::ConsensusValid { new_head: true } => {
                    produced += 1;
                    info!(height = template.height, hash = %short(&hash), steps = template.steps, "produced block");
                }
                Verdict::ConsensusValid { new_head: false } => {
                    debug!(height = template.height, hash = %short(&hash), "produced block lost fork choice");
                }
                Verdict::Rejected(reason) => {
                    warn!(height = template.height, %reason, "own block rejected");
                }
            }
        }
    }

    /// Transaction pool is outside this crate
    fn transactions(&self) -> Vec<Transaction> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusContext;
    use crate::crypto::Ed25519Verifier;
    use crate::db::MemoryStore;
    use crate::fixed::units;
    use crate::stake::StakeTable;
    use std::time::Duration;

    fn setup() -> (Arc<Chain>, Arc<Keypair>) {
        let ctx = ConsensusContext::devnet();
        let key = Arc::new(Keypair::from_seed(&[5u8; 32]));
        let stake = StakeTable::new().with(key.public_key(), units(30_000)).with([9u8; 32], units(10_000));
        let chain =
            Chain::new(ctx, Arc::new(Ed25519Verifier), Arc::new(stake), Arc::new(MemoryStore::new())).unwrap();
        (Arc::new(chain), key)
    }

    #[test]
    fn test_compute_matches_validator_input() {
        let (chain, key) = setup();
        let producer = Producer::new(chain.clone(), key);
        let template = producer.template(None).unwrap();
        assert!(template.bootstrap_steps.is_some());
        let width = chain.context().vdf.proof_width;
        let work = compute(chain.vdf(), &template, width, &CancellationToken::new()).unwrap().unwrap();
        let bp = work.bootstrap_proof.unwrap();
        assert!(chain.vdf().verify_bytes(&template.challenge, template.bootstrap_steps.unwrap(), &bp, width));
        assert!(chain.vdf().verify_bytes(&bp, template.steps, &work.proof, width));
    }

    #[test]
    fn test_compute_cancelled() {
        let (chain, key) = setup();
        let template = Producer::new(chain.clone(), key).template(None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let width = chain.context().vdf.proof_width;
        assert!(compute(chain.vdf(), &template, width, &cancel).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_produces_up_to_limit() {
        let (chain, key) = setup();
        let producer = Producer::new(chain.clone(), key.clone()).with_limit(5);
        let produced = tokio::time::timeout(Duration::from_secs(60), producer.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(produced, 5);
        assert_eq!(chain.height(), 5);
        let head = chain.current_head().unwrap();
        assert_eq!(head.author, key.public_key());
        assert!(head.bootstrap_proof.is_none());
        assert!(chain.balance(&key.public_key()) > units(0));
    }

    #[tokio::test]
    async fn test_shutdown_stops() {
        let (chain, key) = setup();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let produced = Producer::new(chain.clone(), key).run(shutdown).await.unwrap();
        assert_eq!(produced, 0);
        assert!(chain.current_head().is_none());
    }
}
