//! Pulsar devnet node
//!
//! Один узел, одна цепь: genesis → N блоков, затем выход (или Ctrl+C).

use clap::Parser;
use pulsar::{
    fixed, Chain, ConsensusContext, Ed25519Verifier, Keypair, MemoryStore, ObjectStore, Producer, Signer,
    StakeTable, Storage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pulsar", version, about = "Pulsar single-node devnet")]
struct Args {
    /// Stop after this height
    #[arg(short, long, default_value = "16")]
    blocks: u64,

    /// JSON consensus parameters (devnet defaults if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// sled data directory (in-memory store if omitted)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Hex seed of the producer key (fresh random key if omitted)
    #[arg(long)]
    seed: Option<String>,

    /// Producer stake in whole units
    #[arg(long, default_value = "30000")]
    stake: u64,

    /// Stake held by everyone else, in whole units
    #[arg(long, default_value = "10000")]
    other_stake: u64,
}

fn load_seed(hex_seed: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hex_seed).map_err(|e| format!("seed: {e}"))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| "seed must be 32 bytes".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulsar=info")),
        )
        .init();

    let args = Args::parse();

    let ctx = match &args.config {
        Some(path) => match ConsensusContext::load(path) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                return;
            }
        },
        None => ConsensusContext::devnet(),
    };

    let keypair = match args.seed.as_deref().map(load_seed) {
        Some(Ok(seed)) => Keypair::from_seed(&seed),
        Some(Err(e)) => {
            error!("{}", e);
            return;
        }
        None => Keypair::generate(),
    };
    let keypair = Arc::new(keypair);
    let stake = StakeTable::new()
        .with(keypair.public_key(), fixed::units(args.stake))
        .with([0u8; 32], fixed::units(args.other_stake));

    let store: Arc<dyn ObjectStore> = match &args.data_dir {
        Some(dir) => match Storage::open(dir) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to open store at {}: {}", dir.display(), e);
                return;
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let chain = match Chain::new(ctx, Arc::new(Ed25519Verifier), Arc::new(stake), store) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            error!("Failed to open chain: {}", e);
            return;
        }
    };
    chain.mark_synchronized();

    info!(
        "Starting Pulsar devnet ({}), producer {}, height {}",
        chain.context().chain_id,
        hex::encode(&keypair.public_key()[..8]),
        chain.height()
    );

    let shutdown = CancellationToken::new();
    let producer = Producer::new(chain.clone(), keypair.clone()).with_limit(args.blocks);

    tokio::select! {
        result = producer.run(shutdown.clone()) => match result {
            Ok(produced) => info!("Produced {} blocks", produced),
            Err(e) => error!("Producer failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    }

    info!(
        "Head at height {}, producer balance {}",
        chain.height(),
        fixed::display(&chain.balance(&keypair.public_key()))
    );
}
