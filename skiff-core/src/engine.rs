//! Block-exchange decision engine
//!
//! The engine is the server side of the BlockSwap protocol. It keeps a
//! ledger per remote peer recording that peer's advertised wantlist and the
//! bytes exchanged with it, schedules outgoing block sends across all peers
//! through the [`PeerRequestQueue`], and hands prepared [`Envelope`]s to the
//! transport through a pull-style [`Outbox`].
//!
//! A single dedicated worker drains the queue. It only commits to fetching a
//! block once a consumer has asked for an envelope, so at most one prepared
//! envelope ever sits between the engine and the transport; anything not yet
//! prepared can still be cancelled by an incoming message.

use cid::Cid;
use libp2p::PeerId;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ledger::Ledger;
use crate::message::BlockSwapMessage;
use crate::metrics::Metrics;
use crate::prq::PeerRequestQueue;
use crate::storage::{Block, BlockStore};
use crate::wantlist::Entry;

const LOCK_POISONED: &str = "engine lock poisoned";

/// Reserved error slot: the engine's bookkeeping methods currently always
/// succeed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {}

/// What to do with a peer's state when it disconnects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Keep the ledger and queued sends; the peer may reconnect
    #[default]
    Retain,
    /// Drop the ledger and cancel the peer's queued sends
    Release,
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retain" => Ok(Self::Retain),
            "release" => Ok(Self::Release),
            other => Err(format!("unknown disconnect policy: {}", other)),
        }
    }
}

impl fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retain => write!(f, "retain"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// A block packaged for one recipient. The transport must call [`sent`]
/// exactly once, whether or not transmission succeeded, so the underlying
/// task is retired.
///
/// [`sent`]: Envelope::sent
pub struct Envelope {
    pub peer: PeerId,
    pub block: Block,
    sent: Box<dyn FnOnce() + Send>,
}

impl Envelope {
    /// Notify the engine that this envelope left the building
    pub fn sent(self) {
        (self.sent)()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("peer", &self.peer)
            .field("block", &self.block.cid)
            .field("size", &self.block.size())
            .finish()
    }
}

/// Pull handle over the engine's outgoing envelopes
///
/// Each `next` call signals readiness to the worker, which only then
/// prepares an envelope. Yields `None` after the engine shuts down.
#[derive(Clone)]
pub struct Outbox {
    requests: mpsc::Sender<oneshot::Sender<Envelope>>,
}

impl Outbox {
    pub async fn next(&self) -> Option<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }
}

struct EngineState {
    // ledgers are created lazily on first reference and never evicted,
    // except under the release disconnect policy
    ledgers: HashMap<PeerId, Ledger>,
    prq: PeerRequestQueue,
}

/// The decision engine
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    store: Arc<BlockStore>,
    work_tx: mpsc::Sender<()>,
    envelope_requests: mpsc::Sender<oneshot::Sender<Envelope>>,
    policy: DisconnectPolicy,
    metrics: Metrics,
}

impl Engine {
    /// Create an engine and spawn its worker. The worker runs until
    /// `shutdown` is cancelled. Must be called within a tokio runtime.
    pub fn new(
        store: Arc<BlockStore>,
        policy: DisconnectPolicy,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        let state = Arc::new(Mutex::new(EngineState {
            ledgers: HashMap::new(),
            prq: PeerRequestQueue::new(),
        }));

        // the work signal coalesces: any number of pushes between two pops
        // produce at most one wake
        let (work_tx, work_rx) = mpsc::channel(1);
        let (envelope_requests, request_rx) = mpsc::channel(1);

        let worker = TaskWorker {
            state: state.clone(),
            store: store.clone(),
            work_rx,
            work_tx: work_tx.clone(),
            requests: request_rx,
            shutdown,
            metrics: metrics.clone(),
        };
        tokio::spawn(worker.run());

        Self {
            state,
            store,
            work_tx,
            envelope_requests,
            policy,
            metrics,
        }
    }

    /// Ingest a message from `from`: update its ledger, queue sends for
    /// wanted keys we hold, and account received payload bytes.
    pub fn message_received(
        &self,
        from: PeerId,
        message: &BlockSwapMessage,
    ) -> Result<(), EngineError> {
        if message.is_empty() {
            debug!(peer = %from, "received empty message");
        }

        let mut new_work = false;
        {
            let mut guard = self.state.lock().expect(LOCK_POISONED);
            let state = &mut *guard;
            if !state.ledgers.contains_key(&from) {
                self.metrics.peer_connected();
            }
            let ledger = state.ledgers.entry(from).or_insert_with(|| Ledger::new(from));

            // a full message is a resync: the sender asserts this is its
            // complete want set
            let stale: Vec<Cid> = if message.full() {
                ledger.reset_wantlist().iter().map(|e| e.key).collect()
            } else {
                Vec::new()
            };

            for entry in message.wantlist() {
                if entry.cancel {
                    debug!(peer = %from, key = %entry.key, "cancel");
                    ledger.cancel_want(&entry.key);
                    state.prq.remove(&entry.key, &from);
                } else {
                    trace!(peer = %from, key = %entry.key, priority = entry.priority, "wants");
                    ledger.wants(entry.key, entry.priority);
                    // only queue sends for blocks we hold right now
                    if self.store.has(&entry.key) {
                        state.prq.push(
                            &Entry {
                                key: entry.key,
                                priority: entry.priority,
                            },
                            from,
                        );
                        new_work = true;
                    }
                }
            }

            // retire queued sends for keys the resync dropped
            for key in stale {
                if ledger.wantlist_contains(&key).is_none() {
                    state.prq.remove(&key, &from);
                }
            }

            for block in message.blocks() {
                trace!(peer = %from, key = %block.cid, size = block.size(), "received block");
                ledger.received_bytes(block.size());
                self.metrics.block_received(block.size());
            }
        }

        if new_work {
            self.signal_work();
        }
        Ok(())
    }

    /// Record a message we transmitted to `to`. Every block it carried
    /// satisfies a want: account the bytes, drop the want, retire any queued
    /// send for it.
    pub fn message_sent(&self, to: PeerId, message: &BlockSwapMessage) -> Result<(), EngineError> {
        let mut guard = self.state.lock().expect(LOCK_POISONED);
        let state = &mut *guard;
        if !state.ledgers.contains_key(&to) {
            self.metrics.peer_connected();
        }
        let ledger = state.ledgers.entry(to).or_insert_with(|| Ledger::new(to));

        for block in message.blocks() {
            ledger.sent_bytes(block.size());
            ledger.cancel_want(&block.cid);
            state.prq.remove(&block.cid, &to);
            self.metrics.block_sent(block.size());
        }
        Ok(())
    }

    /// A block just became available locally. Queue a send to every peer
    /// whose wantlist mentions it.
    pub fn add_block(&self, block: &Block) {
        let mut new_work = false;
        {
            let mut guard = self.state.lock().expect(LOCK_POISONED);
            let state = &mut *guard;
            for (peer, ledger) in state.ledgers.iter() {
                if let Some(entry) = ledger.wantlist_contains(&block.cid) {
                    state.prq.push(entry, *peer);
                    new_work = true;
                }
            }
        }

        if new_work {
            self.signal_work();
        }
    }

    /// Snapshot of a peer's wantlist, best priority first. Empty for unknown
    /// peers.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Entry> {
        let guard = self.state.lock().expect(LOCK_POISONED);
        guard
            .ledgers
            .get(peer)
            .map(|l| l.wantlist().sorted_entries())
            .unwrap_or_default()
    }

    /// Peers with an active ledger
    pub fn peers(&self) -> Vec<PeerId> {
        let guard = self.state.lock().expect(LOCK_POISONED);
        guard.ledgers.keys().copied().collect()
    }

    /// Total payload bytes sent to `peer`
    pub fn bytes_sent_to(&self, peer: &PeerId) -> u64 {
        let guard = self.state.lock().expect(LOCK_POISONED);
        guard
            .ledgers
            .get(peer)
            .map(|l| l.accounting().bytes_sent)
            .unwrap_or(0)
    }

    /// Total payload bytes received from `peer`
    pub fn bytes_received_from(&self, peer: &PeerId) -> u64 {
        let guard = self.state.lock().expect(LOCK_POISONED);
        guard
            .ledgers
            .get(peer)
            .map(|l| l.accounting().bytes_recv)
            .unwrap_or(0)
    }

    /// Number of live queued sends, including any the worker holds
    pub fn pending_sends(&self) -> usize {
        self.state.lock().expect(LOCK_POISONED).prq.len()
    }

    /// Handle for the transport to pull outgoing envelopes
    pub fn outbox(&self) -> Outbox {
        Outbox {
            requests: self.envelope_requests.clone(),
        }
    }

    /// Peer connection closed. What happens to its state depends on the
    /// configured [`DisconnectPolicy`].
    pub fn peer_disconnected(&self, peer: &PeerId) {
        match self.policy {
            DisconnectPolicy::Retain => {
                trace!(peer = %peer, "peer disconnected, ledger retained");
            }
            DisconnectPolicy::Release => {
                debug!(peer = %peer, "peer disconnected, releasing ledger");
                let mut guard = self.state.lock().expect(LOCK_POISONED);
                let state = &mut *guard;
                if state.ledgers.remove(peer).is_some() {
                    self.metrics.peer_disconnected();
                }
                state.prq.remove_peer(peer);
            }
        }
    }

    fn signal_work(&self) {
        // non-blocking: a full slot means a wake is already pending
        let _ = self.work_tx.try_send(());
    }
}

/// Background producer: drains the queue, fetches blocks, fills envelope
/// requests from the outbox
struct TaskWorker {
    state: Arc<Mutex<EngineState>>,
    store: Arc<BlockStore>,
    work_rx: mpsc::Receiver<()>,
    work_tx: mpsc::Sender<()>,
    requests: mpsc::Receiver<oneshot::Sender<Envelope>>,
    shutdown: CancellationToken,
    metrics: Metrics,
}

enum NextEnvelope {
    Ready(Envelope),
    /// The consumer dropped its request before work arrived
    Abandoned,
    Shutdown,
}

impl TaskWorker {
    async fn run(mut self) {
        loop {
            // wait for a consumer before committing to any work
            let mut reply = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let envelope = match self.next_envelope(&mut reply).await {
                NextEnvelope::Ready(envelope) => envelope,
                NextEnvelope::Abandoned => continue,
                NextEnvelope::Shutdown => break,
            };
            self.metrics.envelope_dispatched();

            if let Err(envelope) = reply.send(envelope) {
                // consumer stopped waiting; retire the task anyway so it
                // cannot leak
                envelope.sent();
            }
        }
        debug!("task worker stopped");
    }

    async fn next_envelope(&mut self, reply: &mut oneshot::Sender<Envelope>) -> NextEnvelope {
        loop {
            // don't pop work for a consumer that already gave up
            if reply.is_closed() {
                return NextEnvelope::Abandoned;
            }

            let task = self.state.lock().expect(LOCK_POISONED).prq.pop();
            let Some(task) = task else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return NextEnvelope::Shutdown,
                    _ = reply.closed() => return NextEnvelope::Abandoned,
                    signal = self.work_rx.recv() => match signal {
                        Some(()) => continue,
                        None => return NextEnvelope::Shutdown,
                    },
                }
            };

            if task.is_trashed() {
                self.state.lock().expect(LOCK_POISONED).prq.done(&task);
                continue;
            }

            let block = match self.store.get(task.key()) {
                Ok(block) => block,
                Err(err) => {
                    // the block vanished between queueing and dispatch;
                    // retire the task without penalizing the peer
                    debug!(key = %task.key(), %err, "block unavailable at dispatch");
                    self.metrics.dispatch_miss();
                    self.state.lock().expect(LOCK_POISONED).prq.done(&task);
                    continue;
                }
            };

            let peer = *task.target();
            let state = self.state.clone();
            let work_tx = self.work_tx.clone();
            let sent = move || {
                state.lock().expect(LOCK_POISONED).prq.done(&task);
                // completing work may have made the queue non-empty again
                let _ = work_tx.try_send(());
            };

            return NextEnvelope::Ready(Envelope {
                peer,
                block,
                sent: Box::new(sent),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_engine(policy: DisconnectPolicy) -> (Engine, Arc<BlockStore>, CancellationToken) {
        let store = Arc::new(BlockStore::new());
        let shutdown = CancellationToken::new();
        let engine = Engine::new(store.clone(), policy, Metrics::new(), shutdown.clone());
        (engine, store, shutdown)
    }

    fn want_message(entries: &[(&Block, i32)], full: bool) -> BlockSwapMessage {
        let mut msg = BlockSwapMessage::new(full);
        for (block, priority) in entries {
            msg.want(block.cid, *priority);
        }
        msg
    }

    #[tokio::test]
    async fn test_ledger_created_on_first_message() {
        let (engine, _store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();

        assert!(engine.peers().is_empty());
        engine
            .message_received(peer, &BlockSwapMessage::new(false))
            .unwrap();
        assert_eq!(engine.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_wantlist_snapshot_sorted() {
        let (engine, _store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();
        let low = Block::new(b"low".to_vec()).unwrap();
        let high = Block::new(b"high".to_vec()).unwrap();

        engine
            .message_received(peer, &want_message(&[(&low, 1), (&high, 9)], true))
            .unwrap();

        let snapshot = engine.wantlist_for_peer(&peer);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, high.cid);
        assert_eq!(snapshot[1].key, low.cid);

        assert!(engine.wantlist_for_peer(&PeerId::random()).is_empty());
    }

    #[tokio::test]
    async fn test_no_task_for_blocks_we_lack() {
        let (engine, _store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();
        let block = Block::new(b"missing".to_vec()).unwrap();

        engine
            .message_received(peer, &want_message(&[(&block, 5)], true))
            .unwrap();

        // want recorded, but nothing queued since the store lacks the block
        assert_eq!(engine.wantlist_for_peer(&peer).len(), 1);
        assert_eq!(engine.pending_sends(), 0);
    }

    #[tokio::test]
    async fn test_received_blocks_are_accounted() {
        let (engine, _store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();
        let block = Block::new(vec![0u8; 37]).unwrap();

        let mut msg = BlockSwapMessage::new(false);
        msg.add_block(block);
        engine.message_received(peer, &msg).unwrap();

        assert_eq!(engine.bytes_received_from(&peer), 37);
        assert_eq!(engine.bytes_sent_to(&peer), 0);
    }

    #[tokio::test]
    async fn test_message_sent_accounts_and_clears_want() {
        let (engine, store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();
        let block = Block::new(vec![1u8; 64]).unwrap();
        store.put(block.clone()).unwrap();

        engine
            .message_received(peer, &want_message(&[(&block, 5)], true))
            .unwrap();
        assert_eq!(engine.pending_sends(), 1);

        let mut sent = BlockSwapMessage::new(false);
        sent.add_block(block.clone());
        engine.message_sent(peer, &sent).unwrap();

        assert_eq!(engine.bytes_sent_to(&peer), 64);
        assert!(engine.wantlist_for_peer(&peer).is_empty());
        assert_eq!(engine.pending_sends(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_retain_keeps_ledger() {
        let (engine, _store, _shutdown) = new_engine(DisconnectPolicy::Retain);
        let peer = PeerId::random();
        let block = Block::new(b"kept".to_vec()).unwrap();

        engine
            .message_received(peer, &want_message(&[(&block, 1)], true))
            .unwrap();
        engine.peer_disconnected(&peer);

        assert_eq!(engine.peers(), vec![peer]);
        assert_eq!(engine.wantlist_for_peer(&peer).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_release_drops_state() {
        let (engine, store, _shutdown) = new_engine(DisconnectPolicy::Release);
        let peer = PeerId::random();
        let block = Block::new(b"dropped".to_vec()).unwrap();
        store.put(block.clone()).unwrap();

        engine
            .message_received(peer, &want_message(&[(&block, 1)], true))
            .unwrap();
        assert_eq!(engine.pending_sends(), 1);

        engine.peer_disconnected(&peer);

        assert!(engine.peers().is_empty());
        assert_eq!(engine.pending_sends(), 0);
    }

    #[tokio::test]
    async fn test_active_peers_gauge_tracks_ledgers() {
        let store = Arc::new(BlockStore::new());
        let metrics = Metrics::new();
        let engine = Engine::new(
            store,
            DisconnectPolicy::Release,
            metrics.clone(),
            CancellationToken::new(),
        );
        let peer = PeerId::random();
        let other = PeerId::random();

        assert_eq!(metrics.active_peers(), 0);

        engine
            .message_received(peer, &BlockSwapMessage::new(false))
            .unwrap();
        engine
            .message_received(other, &BlockSwapMessage::new(false))
            .unwrap();
        // a second message from a known peer does not bump the gauge
        engine
            .message_received(peer, &BlockSwapMessage::new(false))
            .unwrap();
        assert_eq!(metrics.active_peers(), 2);

        engine.peer_disconnected(&peer);
        assert_eq!(metrics.active_peers(), 1);

        // releasing an unknown peer leaves the gauge alone
        engine.peer_disconnected(&PeerId::random());
        assert_eq!(metrics.active_peers(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_outbox() {
        let (engine, _store, shutdown) = new_engine(DisconnectPolicy::Retain);
        let outbox = engine.outbox();

        shutdown.cancel();

        let next = timeout(Duration::from_secs(1), outbox.next()).await;
        assert_eq!(next.expect("outbox should close").map(|e| e.peer), None);
    }

    #[test]
    fn test_disconnect_policy_parses() {
        assert_eq!(
            "retain".parse::<DisconnectPolicy>().unwrap(),
            DisconnectPolicy::Retain
        );
        assert_eq!(
            "release".parse::<DisconnectPolicy>().unwrap(),
            DisconnectPolicy::Release
        );
        assert!("drop".parse::<DisconnectPolicy>().is_err());
    }
}
