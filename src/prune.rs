//! Pruning of superseded branches
//!
//! Каждые `frequency` блоков старые неканонические терминалы сворачиваются
//! в маркеры. Маркер ссылается на до `batch_max` терминалов и сам становится
//! терминалом, так что следующие проходы сворачивают и маркеры.

use crate::config::PruneParams;
use crate::db::{ObjectStore, StoreError};
use crate::types::{ChainOp, ChainPosition, Hash, PruneMarker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One pruning candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub hash: Hash,
    pub height: u64,
    pub is_marker: bool,
}

impl Candidate {
    /// Markers first, then height, then hash
    fn sort_key(&self) -> (bool, u64, Hash) {
        (!self.is_marker, self.height, self.hash)
    }
}

/// Split sorted candidates into batches of at most `batch_max`; batches
/// smaller than `batch_min` are dropped and wait for a later pass.
pub fn plan_batches(mut candidates: Vec<Candidate>, params: &PruneParams) -> Vec<Vec<Candidate>> {
    candidates.sort_by_key(Candidate::sort_key);
    candidates
        .chunks(params.batch_max.max(1))
        .filter(|batch| batch.len() >= params.batch_min)
        .map(<[Candidate]>::to_vec)
        .collect()
}

pub struct Pruner {
    params: PruneParams,
    last_pruned: AtomicU64,
    lock: Mutex<()>,
}

impl Pruner {
    pub fn new(params: PruneParams) -> Self {
        Self { params, last_pruned: AtomicU64::new(0), lock: Mutex::new(()) }
    }

    pub fn last_pruned(&self) -> u64 {
        self.last_pruned.load(Ordering::Acquire)
    }

    pub fn should_run(&self, synchronized: bool, height: u64) -> bool {
        synchronized
            && self.params.frequency > 0
            && height % self.params.frequency == 0
            && height > self.last_pruned()
    }

    /// Run one pass if due. A pass already in progress makes this a no-op.
    /// Returns the markers written.
    pub fn maybe_prune(
        &self,
        store: &dyn ObjectStore,
        head: &Hash,
        height: u64,
        synchronized: bool,
    ) -> Result<Vec<PruneMarker>, StoreError> {
        if !self.should_run(synchronized, height) {
            return Ok(Vec::new());
        }
        let Ok(_guard) = self.lock.try_lock() else {
            debug!(height, "prune pass already running");
            return Ok(Vec::new());
        };
        // re-check under the lock
        if height <= self.last_pruned() {
            return Ok(Vec::new());
        }

        let markers = self.prune(store, head, height)?;
        self.last_pruned.store(height, Ordering::Release);
        Ok(markers)
    }

    fn prune(&self, store: &dyn ObjectStore, head: &Hash, height: u64) -> Result<Vec<PruneMarker>, StoreError> {
        let horizon = height.saturating_sub(self.params.frequency);
        let mut candidates = Vec::new();
        for hash in store.terminals()? {
            if hash == *head {
                continue;
            }
            let (Some(op), Some(pos)) = (store.load(&hash)?, store.load_position(&hash)?) else {
                continue;
            };
            if pos.height < horizon {
                candidates.push(Candidate { hash, height: pos.height, is_marker: op.is_marker() });
            }
        }

        let mut markers = Vec::new();
        for batch in plan_batches(candidates, &self.params) {
            let top = batch.iter().map(|c| c.height).max().unwrap_or(0);
            let marker = PruneMarker { predecessors: batch.iter().map(|c| c.hash).collect() };
            store.put(
                &ChainOp::Marker(marker.clone()),
                ChainPosition { height: top, cumulative_difficulty: 0, ignore: true },
            )?;
            debug!(members = batch.len(), height = top, "pruned batch");
            markers.push(marker);
        }
        Ok(markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::Block;
    use num_bigint::BigUint;

    fn params() -> PruneParams {
        PruneParams { frequency: 16, batch_max: 128, batch_min: 8 }
    }

    fn cand(n: u8, height: u64, is_marker: bool) -> Candidate {
        Candidate { hash: [n; 32], height, is_marker }
    }

    #[test]
    fn test_plan_order_and_sizes() {
        let mut cands: Vec<Candidate> = (0..10u8).map(|i| cand(i + 10, 20 - i as u64, false)).collect();
        cands.push(cand(1, 50, true));
        let batches = plan_batches(cands, &params());
        assert_eq!(batches.len(), 1);
        let b = &batches[0];
        assert_eq!(b.len(), 11);
        assert!(b[0].is_marker);
        assert!(b[1..].windows(2).all(|w| w[0].height <= w[1].height));
    }

    #[test]
    fn test_plan_caps_and_skips_small_tail() {
        let cands: Vec<Candidate> = (0..135u32).map(|i| cand((i % 250) as u8, i as u64, false)).collect();
        let batches = plan_batches(cands, &params());
        // 128 + 7: the tail is below the minimum
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 128);

        let few: Vec<Candidate> = (0..7u8).map(|i| cand(i, 1, false)).collect();
        assert!(plan_batches(few, &params()).is_empty());
    }

    #[test]
    fn test_ties_break_on_hash() {
        let cands = vec![cand(9, 5, false), cand(3, 5, false)];
        let p = PruneParams { frequency: 16, batch_max: 128, batch_min: 1 };
        let batches = plan_batches(cands, &p);
        assert_eq!(batches[0][0].hash, [3; 32]);
    }

    fn block(height: u64, prev: Option<Hash>, salt: u8) -> Block {
        Block {
            height,
            prev,
            author: [salt; 32],
            timestamp_ms: height,
            steps: 2,
            proof: vec![salt],
            bootstrap_proof: None,
            vrf_seed: None,
            block_time_factor: BigUint::from(1u32),
            moving_max_speed: BigUint::from(1u32),
            moving_min_speed: BigUint::from(1u32),
            reward: BigUint::from(0u32),
            transactions: vec![],
        }
    }

    fn put(store: &MemoryStore, b: &Block) {
        let pos = ChainPosition { height: b.height, cumulative_difficulty: b.height as u128 * 2, ignore: false };
        store.put(&ChainOp::Block(b.clone()), pos).unwrap();
    }

    /// Canonical chain of `len` blocks with a one-block stale sibling at
    /// every height from 2 to `len`.
    fn forest(len: u64) -> (MemoryStore, Hash) {
        let store = MemoryStore::new();
        let g = block(1, None, 0);
        put(&store, &g);
        let mut tip = g;
        for h in 2..=len {
            put(&store, &block(h, Some(tip.hash()), 1));
            let next = block(h, Some(tip.hash()), 0);
            put(&store, &next);
            tip = next;
        }
        (store, tip.hash())
    }

    #[test]
    fn test_trigger_conditions() {
        let pruner = Pruner::new(params());
        assert!(!pruner.should_run(false, 32));
        assert!(!pruner.should_run(true, 33));
        assert!(pruner.should_run(true, 32));
        let (store, head) = forest(32);
        pruner.maybe_prune(&store, &head, 32, true).unwrap();
        assert_eq!(pruner.last_pruned(), 32);
        assert!(!pruner.should_run(true, 32));
        assert!(pruner.should_run(true, 48));
    }

    #[test]
    fn test_prune_writes_marker() {
        let (store, head) = forest(32);
        let pruner = Pruner::new(params());
        let markers = pruner.maybe_prune(&store, &head, 32, true).unwrap();
        // stale siblings at heights 2..=15
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].predecessors.len(), 14);

        let id = ChainOp::Marker(markers[0].clone()).hash();
        let pos = store.load_position(&id).unwrap().unwrap();
        assert!(pos.ignore);
        assert_eq!(pos.height, 15);

        let terminals = store.terminals().unwrap();
        assert!(terminals.contains(&id));
        assert!(terminals.contains(&head));
        // siblings at 16..=32, the marker and the head
        assert_eq!(terminals.len(), 17 + 2);
    }

    #[test]
    fn test_busy_lock_skips() {
        let (store, head) = forest(32);
        let pruner = Pruner::new(params());
        let _held = pruner.lock.lock().unwrap();
        assert!(pruner.maybe_prune(&store, &head, 32, true).unwrap().is_empty());
        assert_eq!(pruner.last_pruned(), 0);
    }
}
