//! Autonomous traffic generator for exchange testing
//!
//! Synthesizes remote peers against a live engine:
//! - Generates random blocks at a configurable rate
//! - Synthetic peers send wantlist messages over the known blocks
//! - Occasionally cancels a want before it is served
//!
//! Everything drives the public engine API; no network is involved.
//! Enable with: SKIFF_TRAFFIC=1

use libp2p::PeerId;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::message::BlockSwapMessage;
use crate::storage::{Block, BlockStore};

/// Traffic generator configuration
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Number of synthetic peers
    pub peers: usize,
    /// Wantlist messages per minute across all peers
    pub message_rate: u32,
    /// Blocks to generate per minute
    pub upload_rate: u32,
    /// Block size in bytes
    pub block_size: usize,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            message_rate: 30,      // 30 messages/min
            upload_rate: 10,       // 10 blocks/min
            block_size: 64 * 1024, // 64 KiB blocks
        }
    }
}

/// Check if the traffic generator should be enabled
pub fn is_enabled() -> bool {
    std::env::var("SKIFF_TRAFFIC")
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

/// Get traffic config from environment variables
///
/// Environment variables:
/// - SKIFF_TRAFFIC_PEERS: Number of synthetic peers (default: 4)
/// - SKIFF_TRAFFIC_RATE: Wantlist messages per minute (default: 30)
/// - SKIFF_TRAFFIC_UPLOAD_RATE: Blocks per minute to generate (default: 10)
/// - SKIFF_TRAFFIC_BLOCK_SIZE: Block size in bytes (default: 65536)
pub fn config_from_env() -> TrafficConfig {
    let defaults = TrafficConfig::default();

    TrafficConfig {
        peers: std::env::var("SKIFF_TRAFFIC_PEERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.peers),
        message_rate: std::env::var("SKIFF_TRAFFIC_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.message_rate),
        upload_rate: std::env::var("SKIFF_TRAFFIC_UPLOAD_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.upload_rate),
        block_size: std::env::var("SKIFF_TRAFFIC_BLOCK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.block_size),
    }
}

/// Start the traffic generator tasks
pub fn start(config: TrafficConfig, store: Arc<BlockStore>, engine: Arc<Engine>) {
    info!(
        peers = config.peers,
        message_rate = config.message_rate,
        upload_rate = config.upload_rate,
        "traffic generator starting"
    );

    // CIDs every loop knows about
    let known_cids: Arc<RwLock<Vec<cid::Cid>>> = Arc::new(RwLock::new(Vec::new()));

    let upload_config = config.clone();
    let upload_store = store.clone();
    let upload_engine = engine.clone();
    let upload_cids = known_cids.clone();
    tokio::spawn(async move {
        block_upload_loop(upload_config, upload_store, upload_engine, upload_cids).await;
    });

    tokio::spawn(async move {
        want_loop(config, engine, known_cids).await;
    });
}

/// Generate random blocks, store them and announce them to the engine
async fn block_upload_loop(
    config: TrafficConfig,
    store: Arc<BlockStore>,
    engine: Arc<Engine>,
    known_cids: Arc<RwLock<Vec<cid::Cid>>>,
) {
    let base_interval = Duration::from_secs(60) / config.upload_rate.max(1);

    loop {
        let data: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..config.block_size).map(|_| rng.gen::<u8>()).collect()
        };

        match Block::new(data) {
            Ok(block) => {
                let cid = block.cid;
                match store.put(block.clone()) {
                    Ok(()) => {
                        known_cids.write().await.push(cid);
                        engine.add_block(&block);
                    }
                    Err(e) => {
                        warn!("failed to store generated block: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("failed to create block: {}", e);
            }
        }

        sleep(jittered(base_interval)).await;
    }
}

/// Synthetic peers advertise wants over the known blocks
async fn want_loop(
    config: TrafficConfig,
    engine: Arc<Engine>,
    known_cids: Arc<RwLock<Vec<cid::Cid>>>,
) {
    let peers: Vec<PeerId> = (0..config.peers.max(1)).map(|_| PeerId::random()).collect();
    let base_interval = Duration::from_secs(60) / config.message_rate.max(1);

    loop {
        let cids = known_cids.read().await.clone();

        if !cids.is_empty() {
            // build the whole message before any await point
            let (peer, message) = {
                let mut rng = rand::thread_rng();
                let peer = peers[rng.gen_range(0..peers.len())];

                let mut message = BlockSwapMessage::new(false);
                let wants = rng.gen_range(1..=4usize.min(cids.len()));
                for _ in 0..wants {
                    let cid = cids[rng.gen_range(0..cids.len())];
                    // roughly one in ten entries retracts instead of asking
                    if rng.gen_ratio(1, 10) {
                        message.cancel(cid);
                    } else {
                        message.want(cid, rng.gen_range(1..100));
                    }
                }
                (peer, message)
            };

            let _ = engine.message_received(peer, &message);
        }

        sleep(jittered(base_interval)).await;
    }
}

/// Add random jitter (0-50% of the base interval)
fn jittered(base: Duration) -> Duration {
    let window = (base.as_millis() as u64 / 2).max(1);
    base + Duration::from_millis(rand::random::<u64>() % window)
}
