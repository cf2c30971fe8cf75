//! Exchange metrics for benchmarking and monitoring
//!
//! Thread-safe metrics collection using atomic types

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters for the block exchange
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // peer gauge
    active_peers: AtomicUsize,

    // block transfer counters
    blocks_sent: AtomicU64,
    blocks_received: AtomicU64,

    // byte transfer counters
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // envelope flow
    envelopes_dispatched: AtomicU64,
    dispatch_misses: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                active_peers: AtomicUsize::new(0),
                blocks_sent: AtomicU64::new(0),
                blocks_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                envelopes_dispatched: AtomicU64::new(0),
                dispatch_misses: AtomicU64::new(0),
            }),
        }
    }

    // peer gauge

    pub fn peer_connected(&self) {
        self.inner.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        self.inner.active_peers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_peers(&self) -> usize {
        self.inner.active_peers.load(Ordering::Relaxed)
    }

    // block transfer counters

    pub fn block_sent(&self, size: usize) {
        self.inner.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn block_received(&self, size: usize) {
        self.inner.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn blocks_sent(&self) -> u64 {
        self.inner.blocks_sent.load(Ordering::Relaxed)
    }

    pub fn blocks_received(&self) -> u64 {
        self.inner.blocks_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    // envelope flow

    /// An envelope was prepared and handed towards the transport
    pub fn envelope_dispatched(&self) {
        self.inner
            .envelopes_dispatched
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A queued send was dropped because its block was gone at dispatch
    pub fn dispatch_miss(&self) {
        self.inner.dispatch_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelopes_dispatched(&self) -> u64 {
        self.inner.envelopes_dispatched.load(Ordering::Relaxed)
    }

    pub fn dispatch_misses(&self) -> u64 {
        self.inner.dispatch_misses.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
