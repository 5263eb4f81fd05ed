//! Property tests: VDF, codec, ledger conservation

use num_bigint::BigUint;
use proptest::prelude::*;
use pulsar::{decode_le, encode_le, Block, Ledger, SlothVdf, Transaction};
use std::sync::Arc;

const DEVNET_PRIME: &str = "170141183460469231731687303715884105727";

fn vdf() -> SlothVdf {
    SlothVdf::from_decimal(DEVNET_PRIME).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_vdf_roundtrip(challenge in any::<u128>(), steps in 0u64..200) {
        let vdf = vdf();
        let x = BigUint::from(challenge) % vdf.prime();
        let proof = vdf.generate(&x, steps);
        prop_assert!(vdf.verify(&x, steps, &proof));
    }

    #[test]
    fn prop_vdf_tampered_proof_fails(
        challenge in proptest::collection::vec(any::<u8>(), 16),
        steps in 1u64..100,
        byte in 0usize..15,
        flip in 1u8..=255,
    ) {
        let vdf = vdf();
        let mut proof = vdf.generate_bytes(&challenge, steps, 16).unwrap();
        prop_assert!(vdf.verify_bytes(&challenge, steps, &proof, 16));
        // low bytes only: the tampered value stays below 2^127 either way
        proof[byte] ^= flip;
        prop_assert!(!vdf.verify_bytes(&challenge, steps, &proof, 16));
    }

    #[test]
    fn prop_codec_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..=32), width in prop::sample::select(vec![8usize, 16, 32])) {
        let value = BigUint::from_bytes_le(&bytes);
        match encode_le(&value, width) {
            Ok(encoded) => {
                prop_assert_eq!(encoded.len(), width);
                prop_assert_eq!(decode_le(&encoded, width).unwrap(), value);
            }
            Err(_) => prop_assert!(value.bits() > (width * 8) as u64),
        }
    }

    #[test]
    fn prop_apply_then_revert_conserves(
        transfers in proptest::collection::vec((0u8..4, 0u8..4, 1u32..50, 0u32..5), 0..12),
        blocks in 1usize..5,
    ) {
        let ledger = Arc::new(Ledger::new());
        let genesis = block(1, None, 0, 1_000, vec![]);
        let mut setup = ledger.create_delta();
        setup.apply_block(&genesis).unwrap();
        let mut base = Ledger::new();
        base.commit(&setup).unwrap();
        let base = Arc::new(base);
        let before = base.balances().clone();

        let mut chain = vec![genesis];
        let per_block = transfers.len() / blocks + 1;
        for (i, chunk) in transfers.chunks(per_block).enumerate() {
            let txs = chunk
                .iter()
                .enumerate()
                .filter(|(_, (s, d, _, _))| s != d)
                .map(|(n, (s, d, amount, fee))| Transaction {
                    source: [*s; 32],
                    destination: [*d; 32],
                    amount: BigUint::from(*amount),
                    fee: BigUint::from(*fee),
                    nonce: (i * 100 + n) as u64,
                    signature: vec![],
                })
                .collect();
            let prev = chain.last().map(Block::hash);
            chain.push(block(i as u64 + 2, prev, (i % 4) as u8, 10, txs));
        }

        let mut delta = base.create_delta();
        for b in &chain[1..] {
            delta.apply_block(b).unwrap();
        }
        for b in chain[1..].iter().rev() {
            delta.revert_block(b).unwrap();
        }
        prop_assert!(delta.changes().is_empty());

        // validity does not matter for the arithmetic: invalid deltas are
        // never committed, valid ones must land back where they started
        if delta.is_valid() {
            let mut after = (*base).clone();
            after.commit(&delta).unwrap();
            prop_assert_eq!(after.balances(), &before);
        }
    }
}

fn block(height: u64, prev: Option<[u8; 32]>, author: u8, reward: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        height,
        prev,
        author: [author; 32],
        timestamp_ms: height * 1_000,
        steps: 2,
        proof: vec![0u8; 16],
        bootstrap_proof: None,
        vrf_seed: None,
        block_time_factor: BigUint::from(1u32),
        moving_max_speed: BigUint::from(1u32),
        moving_min_speed: BigUint::from(1u32),
        reward: BigUint::from(reward),
        transactions,
    }
}
