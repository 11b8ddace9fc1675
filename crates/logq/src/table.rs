//! The transaction table and its bookkeeping queues.
//!
//! Transactions live in an ordered map keyed by vxid — the arena that also
//! backs parent/child edges, which are stored as vxid handles rather than
//! pointers. Two FIFOs track transactions still waiting for `End` and
//! transactions holding ring references; a small LIFO pool recycles retired
//! shells so their grown buffers amortise allocation.
//!
//! The FIFOs store `(vxid, seq)` pairs and drop entries lazily: an entry is
//! stale once the transaction is gone, recycled under a new seq, or no longer
//! in the state the queue tracks. `seq` is a per-creation stamp, so a
//! recycled shell can never alias an old queue entry.

use crate::store::{RecordStore, StorePos};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Transaction type, learned from `Begin`/`Link` payloads.
///
/// Once set to a non-`Unknown` value it may only be reasserted to the same
/// value; anything else is a diagnosed drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxType {
    Unknown,
    Session,
    Request,
    EsiRequest,
    BackendRequest,
}

impl TxType {
    /// Parses the type word of a `Begin`/`Link` payload.
    pub(crate) fn parse_word(word: &str) -> Option<TxType> {
        match word {
            "sess" => Some(TxType::Session),
            "req" => Some(TxType::Request),
            "esireq" => Some(TxType::EsiRequest),
            "bereq" => Some(TxType::BackendRequest),
            _ => None,
        }
    }

    /// The payload spelling of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            TxType::Unknown => "unknown",
            TxType::Session => "sess",
            TxType::Request => "req",
            TxType::EsiRequest => "esireq",
            TxType::BackendRequest => "bereq",
        }
    }
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transaction under assembly.
#[derive(Debug)]
pub(crate) struct Tx {
    pub vxid: u32,
    /// Creation stamp; distinguishes shell incarnations in the lazy queues.
    pub seq: u64,
    pub t_start: Instant,
    pub complete: bool,
    pub ready: bool,
    pub ty: TxType,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub n_child_ready: u32,
    /// Transitive descendant count.
    pub n_descend: u32,
    pub store: RecordStore,
    /// Persistent assembler position; records before it have been scanned.
    pub scan: StorePos,
}

impl Tx {
    fn fresh(vxid: u32, seq: u64, now: Instant) -> Self {
        Tx {
            vxid,
            seq,
            t_start: now,
            complete: false,
            ready: false,
            ty: TxType::Unknown,
            parent: None,
            children: Vec::new(),
            n_child_ready: 0,
            n_descend: 0,
            store: RecordStore::default(),
            scan: StorePos::default(),
        }
    }

    /// Reinitialises a recycled shell. The store buffer and the child list
    /// keep their capacity.
    fn reset(&mut self, vxid: u32, seq: u64, now: Instant) {
        self.vxid = vxid;
        self.seq = seq;
        self.t_start = now;
        self.complete = false;
        self.ready = false;
        self.ty = TxType::Unknown;
        self.parent = None;
        self.children.clear();
        self.n_child_ready = 0;
        self.n_descend = 0;
        self.store.clear();
        self.scan = StorePos::default();
    }

    #[inline]
    pub fn n_child(&self) -> u32 {
        self.children.len() as u32
    }
}

/// Table size snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Transactions currently keyed in the table.
    pub transactions: usize,
    /// Transactions still waiting for `End`.
    pub incomplete: usize,
    /// Retired shells pooled for reuse.
    pub pooled: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TxTable {
    map: BTreeMap<u32, Tx>,
    incomplete: VecDeque<(u32, u64)>,
    n_incomplete: usize,
    shmlist: VecDeque<(u32, u64)>,
    cache: Vec<Tx>,
    next_seq: u64,
}

impl TxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            transactions: self.map.len(),
            incomplete: self.n_incomplete,
            pooled: self.cache.len(),
        }
    }

    #[inline]
    pub fn n_incomplete(&self) -> usize {
        self.n_incomplete
    }

    pub fn get(&self, vxid: u32) -> Option<&Tx> {
        self.map.get(&vxid)
    }

    pub fn get_mut(&mut self, vxid: u32) -> Option<&mut Tx> {
        self.map.get_mut(&vxid)
    }

    /// Fetches a transaction that must exist.
    pub fn tx(&self, vxid: u32) -> &Tx {
        self.map.get(&vxid).expect("transaction missing from table")
    }

    /// Mutably fetches a transaction that must exist.
    pub fn tx_mut(&mut self, vxid: u32) -> &mut Tx {
        self.map
            .get_mut(&vxid)
            .expect("transaction missing from table")
    }

    /// Returns the transaction for `vxid`, creating it lazily on first
    /// mention. New transactions enter the incomplete queue with their start
    /// time stamped to `now`; shells come out of the pool when one is free.
    pub fn lookup_or_insert(&mut self, vxid: u32, now: Instant) -> &mut Tx {
        debug_assert_ne!(vxid, 0, "vxid 0 is reserved and never keyed");
        if !self.map.contains_key(&vxid) {
            let seq = self.next_seq;
            self.next_seq += 1;
            let tx = match self.cache.pop() {
                Some(mut shell) => {
                    shell.reset(vxid, seq, now);
                    shell
                }
                None => Tx::fresh(vxid, seq, now),
            };
            self.incomplete.push_back((vxid, seq));
            self.n_incomplete += 1;
            self.map.insert(vxid, tx);
        }
        self.map.get_mut(&vxid).expect("present or just inserted")
    }

    /// Marks a transaction complete and drops it from the incomplete
    /// accounting. Its queue entry goes stale and is skipped lazily.
    pub fn mark_complete(&mut self, vxid: u32) {
        let tx = self.tx_mut(vxid);
        debug_assert!(!tx.complete);
        tx.complete = true;
        debug_assert!(self.n_incomplete > 0);
        self.n_incomplete -= 1;
    }

    /// The oldest transaction still waiting for `End`, if any.
    pub fn oldest_incomplete(&mut self) -> Option<u32> {
        while let Some(&(vxid, seq)) = self.incomplete.front() {
            match self.map.get(&vxid) {
                Some(tx) if tx.seq == seq && !tx.complete => return Some(vxid),
                _ => {
                    self.incomplete.pop_front();
                }
            }
        }
        None
    }

    /// Enqueues a transaction that just acquired its first ring chunk.
    pub fn push_ring_ref(&mut self, vxid: u32, seq: u64) {
        self.shmlist.push_back((vxid, seq));
    }

    /// The transaction holding the oldest ring reference, if any.
    pub fn oldest_ring_ref(&mut self) -> Option<u32> {
        while let Some(&(vxid, seq)) = self.shmlist.front() {
            match self.map.get(&vxid) {
                Some(tx) if tx.seq == seq && tx.store.has_chunks() => return Some(vxid),
                _ => {
                    self.shmlist.pop_front();
                }
            }
        }
        None
    }

    /// Removes a transaction from the table for retirement.
    pub fn remove(&mut self, vxid: u32) -> Tx {
        self.map.remove(&vxid).expect("retiring unknown transaction")
    }

    /// Pools a retired shell for reuse, up to `pool_size`; beyond that the
    /// shell is dropped.
    pub fn recycle(&mut self, tx: Tx, pool_size: usize) {
        if self.cache.len() < pool_size {
            self.cache.push(tx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tx> {
        self.map.values()
    }

    /// Live shmlist entries for one transaction incarnation (invariant
    /// checking).
    #[cfg(debug_assertions)]
    pub fn ring_ref_entries(&self, vxid: u32, seq: u64) -> usize {
        self.shmlist
            .iter()
            .filter(|&&(v, s)| v == vxid && s == seq)
            .count()
    }
}
