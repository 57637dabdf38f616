// Two-phase locking over byte ranges. The table only records granted locks;
// a request that cannot be granted is reported as blocked and parked by the
// dispatch loop, which retries it whenever a transaction releases. No lock
// is released before its owner commits or aborts (strict 2PL).

use pious_base::{ByteRange, FHandle, TransId};
use pious_msg::LockKind;
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct Lock {
    range: ByteRange,
    kind: LockKind,
    owner: TransId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LockOutcome {
    Granted,
    Blocked,
}

#[derive(Default)]
pub(crate) struct LockTable {
    files: HashMap<FHandle, Vec<Lock>>,
}

fn conflicts(lock: &Lock, owner: TransId, range: &ByteRange, kind: LockKind) -> bool {
    lock.owner != owner
        && lock.range.overlaps(range)
        && (kind == LockKind::Write || lock.kind == LockKind::Write)
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Try to take `kind` over `range` for `owner`. A zero-byte range
    /// acquires nothing. Re-acquiring a range the owner already covers with
    /// a sufficient kind is a no-op; a read lock upgrades to write when no
    /// other holder overlaps.
    pub(crate) fn acquire(
        &mut self,
        owner: TransId,
        fhandle: FHandle,
        range: ByteRange,
        kind: LockKind,
    ) -> LockOutcome {
        if range.is_empty() {
            return LockOutcome::Granted;
        }
        let locks = self.files.entry(fhandle).or_default();
        if locks.iter().any(|l| conflicts(l, owner, &range, kind)) {
            return LockOutcome::Blocked;
        }
        let covered = locks.iter().any(|l| {
            l.owner == owner
                && l.range.contains(&range)
                && (l.kind == LockKind::Write || kind == LockKind::Read)
        });
        if !covered {
            locks.push(Lock { range, kind, owner });
        }
        LockOutcome::Granted
    }

    /// Owners whose granted locks keep `owner` from acquiring; used by the
    /// deadlock-avoidance victim check.
    pub(crate) fn conflict_holders(
        &self,
        owner: TransId,
        fhandle: FHandle,
        range: ByteRange,
        kind: LockKind,
    ) -> Vec<TransId> {
        let mut holders: Vec<TransId> = self
            .files
            .get(&fhandle)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| conflicts(l, owner, &range, kind))
                    .map(|l| l.owner)
                    .collect()
            })
            .unwrap_or_default();
        holders.sort();
        holders.dedup();
        holders
    }

    /// Atomic release of everything `owner` holds, at commit or abort.
    pub(crate) fn release_all(&mut self, owner: TransId) {
        self.files.retain(|_, locks| {
            locks.retain(|l| l.owner != owner);
            !locks.is_empty()
        });
    }

    pub(crate) fn holds_any(&self, owner: TransId) -> bool {
        self.files
            .values()
            .any(|locks| locks.iter().any(|l| l.owner == owner))
    }
}
