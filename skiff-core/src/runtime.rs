//! Node wiring and lifecycle
//!
//! Builds the block store and decision engine, drains the outbox, and
//! manages shutdown.

use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::Engine;
use crate::message::BlockSwapMessage;
use crate::metrics::Metrics;
use crate::storage::BlockStore;
use crate::traffic;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the Skiff node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    let store = Arc::new(BlockStore::new());
    let metrics = Metrics::new();
    let shutdown = CancellationToken::new();

    let engine = Arc::new(Engine::new(
        store.clone(),
        config.disconnect_policy,
        metrics.clone(),
        shutdown.child_token(),
    ));

    info!(
        data_dir = %config.data_dir.display(),
        policy = %config.disconnect_policy,
        "engine started"
    );

    // Local delivery loop standing in for the transport: pull envelopes,
    // record the send, acknowledge.
    let delivery_engine = engine.clone();
    let outbox = engine.outbox();
    let delivery = tokio::spawn(async move {
        while let Some(envelope) = outbox.next().await {
            let peer = envelope.peer;
            let size = envelope.block.size();

            let mut message = BlockSwapMessage::new(false);
            message.add_block(envelope.block.clone());
            let _ = delivery_engine.message_sent(peer, &message);
            envelope.sent();

            debug!(peer = %peer, size, "delivered block");
        }
        debug!("delivery loop stopped");
    });

    if traffic::is_enabled() {
        traffic::start(traffic::config_from_env(), store.clone(), engine.clone());
    }

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    shutdown.cancel();
    let _ = delivery.await;

    info!(
        envelopes = metrics.envelopes_dispatched(),
        bytes_sent = metrics.bytes_sent(),
        "node stopped"
    );
    Ok(())
}
