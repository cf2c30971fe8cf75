//! Per-partner exchange ledger
//!
//! Records what one remote peer currently wants and how many bytes have been
//! exchanged with it in each direction. Not internally synchronized; the
//! engine's lock protects it.

use cid::Cid;
use libp2p::PeerId;
use std::time::Instant;

use crate::wantlist::{Entry, Wantlist};

/// Cumulative byte counters for one partner. Saturating so a long-lived
/// session cannot wrap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Accounting {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Local record of one partner's current wants and exchange totals
#[derive(Debug)]
pub struct Ledger {
    partner: PeerId,
    wantlist: Wantlist,
    accounting: Accounting,
    created_at: Instant,
}

impl Ledger {
    pub fn new(partner: PeerId) -> Self {
        Self {
            partner,
            wantlist: Wantlist::new(),
            accounting: Accounting::default(),
            created_at: Instant::now(),
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    /// Record that the partner wants `key` at `priority`
    pub fn wants(&mut self, key: Cid, priority: i32) {
        self.wantlist.add(key, priority);
    }

    /// Drop a want. Returns whether it was present.
    pub fn cancel_want(&mut self, key: &Cid) -> bool {
        self.wantlist.remove(key)
    }

    pub fn wantlist_contains(&self, key: &Cid) -> Option<&Entry> {
        self.wantlist.contains(key)
    }

    pub fn wantlist(&self) -> &Wantlist {
        &self.wantlist
    }

    /// Replace the wantlist with an empty one. Used when the partner sends a
    /// complete resync.
    pub fn reset_wantlist(&mut self) -> Wantlist {
        std::mem::take(&mut self.wantlist)
    }

    pub fn received_bytes(&mut self, n: usize) {
        self.accounting.bytes_recv = self.accounting.bytes_recv.saturating_add(n as u64);
    }

    pub fn sent_bytes(&mut self, n: usize) {
        self.accounting.bytes_sent = self.accounting.bytes_sent.saturating_add(n as u64);
    }

    pub fn accounting(&self) -> Accounting {
        self.accounting
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_sha2::block_cid;

    #[test]
    fn test_wants_and_cancel() {
        let mut ledger = Ledger::new(PeerId::random());
        let key = block_cid(b"a").unwrap();

        ledger.wants(key, 4);
        assert_eq!(ledger.wantlist_contains(&key).unwrap().priority, 4);

        assert!(ledger.cancel_want(&key));
        assert!(ledger.wantlist_contains(&key).is_none());
        assert!(!ledger.cancel_want(&key));
    }

    #[test]
    fn test_reset_wantlist() {
        let mut ledger = Ledger::new(PeerId::random());
        let a = block_cid(b"a").unwrap();
        let b = block_cid(b"b").unwrap();

        ledger.wants(a, 1);
        ledger.wants(b, 2);

        let old = ledger.reset_wantlist();
        assert_eq!(old.len(), 2);
        assert!(ledger.wantlist().is_empty());
    }

    #[test]
    fn test_accounting() {
        let mut ledger = Ledger::new(PeerId::random());

        ledger.sent_bytes(100);
        ledger.sent_bytes(50);
        ledger.received_bytes(7);

        let acct = ledger.accounting();
        assert_eq!(acct.bytes_sent, 150);
        assert_eq!(acct.bytes_recv, 7);
    }

    #[test]
    fn test_accounting_saturates() {
        let mut ledger = Ledger::new(PeerId::random());

        ledger.sent_bytes(usize::MAX);
        ledger.sent_bytes(usize::MAX);
        ledger.sent_bytes(usize::MAX);

        assert_eq!(ledger.accounting().bytes_sent, u64::MAX);
    }
}
