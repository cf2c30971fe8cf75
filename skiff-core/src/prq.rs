//! Peer request queue
//!
//! Two-level priority scheduler over pending block sends. The outer level
//! rotates across peers: the next task comes from the peer whose best queued
//! task has the highest priority, ties going to the peer that has waited
//! longest since it was last serviced. The inner level orders one peer's
//! tasks by priority, ties broken by ascending key bytes.
//!
//! Tasks are handles, not copies. Pushing a (peer, key) pair that already has
//! a live task updates that task in place, so at most one live task exists
//! per pair. A task that has been popped stays in the index until it is
//! marked done; cancelling it in that window sets a trash flag the worker
//! checks before dispatch.

use cid::Cid;
use libp2p::PeerId;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::wantlist::Entry;

/// One intended block send: deliver `key` to `target`
#[derive(Debug)]
pub struct Task {
    target: PeerId,
    key: Cid,
    trash: AtomicBool,
}

impl Task {
    fn new(target: PeerId, key: Cid) -> Arc<Self> {
        Arc::new(Self {
            target,
            key,
            trash: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &PeerId {
        &self.target
    }

    pub fn key(&self) -> &Cid {
        &self.key
    }

    /// Whether the task was cancelled after being handed to the worker
    pub fn is_trashed(&self) -> bool {
        self.trash.load(Ordering::Acquire)
    }

    fn set_trashed(&self, trashed: bool) {
        self.trash.store(trashed, Ordering::Release);
    }
}

/// Inner ordering: highest priority first, then ascending key bytes
#[derive(Clone, Debug, PartialEq, Eq)]
struct TaskRank {
    priority: i32,
    key: Cid,
}

impl Ord for TaskRank {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.key.to_bytes().cmp(&other.key.to_bytes()))
    }
}

impl PartialOrd for TaskRank {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Outer ordering: highest top-of-queue priority first, then the peer that
/// has gone longest without service, then peer bytes for determinism
#[derive(Clone, Debug, PartialEq, Eq)]
struct PeerRank {
    priority: i32,
    since: Instant,
    peer: PeerId,
}

impl Ord for PeerRank {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.since.cmp(&other.since))
            .then_with(|| self.peer.to_bytes().cmp(&other.peer.to_bytes()))
    }
}

impl PartialOrd for PeerRank {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Partner {
    queue: BTreeMap<TaskRank, Arc<Task>>,
    last_serviced: Instant,
}

impl Partner {
    fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            last_serviced: Instant::now(),
        }
    }

    fn rank(&self, peer: PeerId) -> Option<PeerRank> {
        self.queue.keys().next().map(|top| PeerRank {
            priority: top.priority,
            since: self.last_serviced,
            peer,
        })
    }
}

struct IndexEntry {
    task: Arc<Task>,
    priority: i32,
    active: bool,
}

/// Priority scheduler over tasks keyed by (peer, block key)
pub struct PeerRequestQueue {
    partners: HashMap<PeerId, Partner>,
    // only partners with queued tasks appear here
    schedule: BTreeSet<PeerRank>,
    index: HashMap<(PeerId, Cid), IndexEntry>,
}

impl PeerRequestQueue {
    pub fn new() -> Self {
        Self {
            partners: HashMap::new(),
            schedule: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    /// Queue a send of `entry.key` to `to`. If a live task already exists for
    /// the pair its priority is updated in place; a task cancelled while in
    /// flight is revived, since the peer has asked for the block again.
    pub fn push(&mut self, entry: &Entry, to: PeerId) {
        let idx = (to, entry.key);

        if let Some(existing) = self.index.get(&idx) {
            let (active, old_priority) = (existing.active, existing.priority);
            if active {
                let existing = self.index.get_mut(&idx).expect("entry just seen");
                existing.priority = entry.priority;
                existing.task.set_trashed(false);
                return;
            }
            if old_priority != entry.priority {
                self.unschedule(&to);
                let partner = self
                    .partners
                    .get_mut(&to)
                    .expect("queued task without partner");
                let task = partner
                    .queue
                    .remove(&TaskRank {
                        priority: old_priority,
                        key: entry.key,
                    })
                    .expect("index entry without queued task");
                partner.queue.insert(
                    TaskRank {
                        priority: entry.priority,
                        key: entry.key,
                    },
                    task,
                );
                let existing = self.index.get_mut(&idx).expect("entry just seen");
                existing.priority = entry.priority;
                self.reschedule(&to);
            }
            return;
        }

        let task = Task::new(to, entry.key);
        self.unschedule(&to);
        let partner = self.partners.entry(to).or_insert_with(Partner::new);
        partner.queue.insert(
            TaskRank {
                priority: entry.priority,
                key: entry.key,
            },
            task.clone(),
        );
        self.index.insert(
            idx,
            IndexEntry {
                task,
                priority: entry.priority,
                active: false,
            },
        );
        self.reschedule(&to);
    }

    /// Take the best task across all peers, or `None` if nothing is queued.
    /// The returned task is active: it stays in the index until [`done`] so a
    /// concurrent cancel can still reach it.
    ///
    /// [`done`]: PeerRequestQueue::done
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        let first = self.schedule.pop_first()?;
        let partner = self
            .partners
            .get_mut(&first.peer)
            .expect("scheduled peer without partner");
        let (_, task) = partner
            .queue
            .pop_first()
            .expect("scheduled peer with empty queue");
        partner.last_serviced = Instant::now();

        if let Some(rank) = partner.rank(first.peer) {
            self.schedule.insert(rank);
        }

        let entry = self
            .index
            .get_mut(&(first.peer, *task.key()))
            .expect("popped task without index entry");
        entry.active = true;

        Some(task)
    }

    /// Cancel the task for (key, peer). A task still queued is deleted; one
    /// already handed to the worker is marked trash and retired there.
    pub fn remove(&mut self, key: &Cid, peer: &PeerId) {
        let idx = (*peer, *key);
        let Some(existing) = self.index.get(&idx) else {
            return;
        };
        if existing.active {
            existing.task.set_trashed(true);
            return;
        }

        let existing = self.index.remove(&idx).expect("entry just seen");
        self.unschedule(peer);
        let partner = self
            .partners
            .get_mut(peer)
            .expect("queued task without partner");
        partner.queue.remove(&TaskRank {
            priority: existing.priority,
            key: *key,
        });
        self.reschedule(peer);
    }

    /// Retire an active task. No-op if the task was already retired or its
    /// slot has been reused.
    pub fn done(&mut self, task: &Arc<Task>) {
        let idx = (*task.target(), *task.key());
        if let Some(existing) = self.index.get(&idx) {
            if existing.active && Arc::ptr_eq(&existing.task, task) {
                self.index.remove(&idx);
            }
        }
    }

    /// Drop everything queued for a peer. Tasks already in flight are marked
    /// trash and retired by the worker.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.unschedule(peer);
        if let Some(partner) = self.partners.remove(peer) {
            for task in partner.queue.values() {
                self.index.remove(&(*peer, *task.key()));
            }
        }
        for ((p, _), entry) in self.index.iter() {
            if p == peer {
                entry.task.set_trashed(true);
            }
        }
    }

    /// Number of live tasks, including active ones
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether a live task exists for (key, peer)
    pub fn contains(&self, key: &Cid, peer: &PeerId) -> bool {
        self.index.contains_key(&(*peer, *key))
    }

    fn unschedule(&mut self, peer: &PeerId) {
        if let Some(partner) = self.partners.get(peer) {
            if let Some(rank) = partner.rank(*peer) {
                self.schedule.remove(&rank);
            }
        }
    }

    fn reschedule(&mut self, peer: &PeerId) {
        if let Some(partner) = self.partners.get(peer) {
            if let Some(rank) = partner.rank(*peer) {
                self.schedule.insert(rank);
            }
        }
    }
}

impl Default for PeerRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
