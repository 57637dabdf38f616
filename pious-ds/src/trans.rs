// Per-transaction server state. Writes are buffered here as a redo list
// until commit; reads performed by the owning transaction overlay that list
// on top of cached data so a transaction always sees its own updates.

use pious_base::{FHandle, TransId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct WriteRec {
    pub fhandle: FHandle,
    pub offset: i64,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TransState {
    Running,
    Prepared,
    Aborted,
}

pub(crate) struct TransEntry {
    pub state: TransState,
    /// Sequence number the next operation must carry.
    pub expected_sn: i32,
    pub redo: Vec<WriteRec>,
    /// An operation of this transaction is parked on a lock.
    pub blocked: bool,
}

impl TransEntry {
    fn new() -> TransEntry {
        TransEntry {
            state: TransState::Running,
            expected_sn: 0,
            redo: Vec::new(),
            blocked: false,
        }
    }

    /// Overlay this transaction's buffered writes onto `buf`, which holds
    /// file content starting at `offset`. Records apply in write order so
    /// later writes win.
    pub(crate) fn overlay(&self, fhandle: FHandle, offset: i64, buf: &mut [u8]) {
        let end = offset + buf.len() as i64;
        for rec in &self.redo {
            if rec.fhandle != fhandle {
                continue;
            }
            let rec_end = rec.offset + rec.data.len() as i64;
            let lo = rec.offset.max(offset);
            let hi = rec_end.min(end);
            if lo >= hi {
                continue;
            }
            let src = (lo - rec.offset) as usize..(hi - rec.offset) as usize;
            let dst = (lo - offset) as usize..(hi - offset) as usize;
            buf[dst].copy_from_slice(&rec.data[src]);
        }
    }

    /// File length as this transaction sees it: the stored length extended
    /// by any buffered write past it.
    pub(crate) fn effective_len(&self, fhandle: FHandle, stored_len: i64) -> i64 {
        self.redo
            .iter()
            .filter(|r| r.fhandle == fhandle)
            .map(|r| r.offset + r.data.len() as i64)
            .fold(stored_len, i64::max)
    }
}

#[derive(Default)]
pub(crate) struct TransTable {
    entries: HashMap<TransId, TransEntry>,
}

impl TransTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_or_insert(&mut self, transid: TransId) -> &mut TransEntry {
        self.entries.entry(transid).or_insert_with(TransEntry::new)
    }

    pub(crate) fn get_mut(&mut self, transid: &TransId) -> Option<&mut TransEntry> {
        self.entries.get_mut(transid)
    }

    pub(crate) fn remove(&mut self, transid: &TransId) -> Option<TransEntry> {
        self.entries.remove(transid)
    }

    pub(crate) fn ids(&self) -> Vec<TransId> {
        self.entries.keys().copied().collect()
    }
}
