use serde::{Deserialize, Serialize};
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use test_log::test;

/// Globally-unique transaction identifier.
///
/// Field order matters: the derived `Ord` compares time stamp first, so that
/// the server scheduler can treat "smaller" as "older" for fair scheduling.
/// A client retrying an operation the server aborted must present the same
/// id, which keeps the retried transaction's age and lets it eventually win
/// contention; ids are never reused in any other case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TransId {
    pub sec: i64,
    pub usec: i64,
    pub host: u64,
    pub pid: i64,
}

impl TransId {
    /// Bucket index in `0..maxval`, or 0 when `maxval <= 0`.
    pub fn hash_bucket(&self, maxval: i64) -> i64 {
        if maxval <= 0 {
            0
        } else {
            self.usec.rem_euclid(maxval)
        }
    }
}

/// Source of fresh transaction ids for one process.
///
/// Wall-clock microseconds are monotonicised so two ids assigned within the
/// same microsecond still order correctly; host and process identity are
/// fixed at construction.
#[derive(Debug)]
pub struct TidClock {
    host: u64,
    pid: i64,
    last_sec: i64,
    last_usec: i64,
}

impl TidClock {
    pub fn new(host: u64, pid: i64) -> Self {
        TidClock {
            host,
            pid,
            last_sec: 0,
            last_usec: -1,
        }
    }

    /// A clock identified by this OS process. The host component is drawn
    /// from a per-process random hash state, which keeps ids from distinct
    /// processes distinct even when pids collide across hosts.
    pub fn for_process() -> Self {
        let state = std::collections::hash_map::RandomState::new();
        let mut h = state.build_hasher();
        std::process::id().hash(&mut h);
        Self::new(h.finish(), std::process::id() as i64)
    }

    pub fn assign(&mut self) -> TransId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut sec = now.as_secs() as i64;
        let mut usec = now.subsec_micros() as i64;
        if (sec, usec) <= (self.last_sec, self.last_usec) {
            sec = self.last_sec;
            usec = self.last_usec + 1;
            if usec > 999_999 {
                sec += 1;
                usec = 0;
            }
        }
        self.last_sec = sec;
        self.last_usec = usec;
        TransId {
            sec,
            usec,
            host: self.host,
            pid: self.pid,
        }
    }
}

#[test]
fn test_order_is_timestamp_first() {
    let a = TransId {
        sec: 5,
        usec: 10,
        host: 9,
        pid: 9,
    };
    let b = TransId {
        sec: 5,
        usec: 11,
        host: 1,
        pid: 1,
    };
    let c = TransId {
        sec: 6,
        usec: 0,
        host: 0,
        pid: 0,
    };
    assert!(a < b && b < c);
}

#[test]
fn test_assign_is_strictly_increasing() {
    let mut clock = TidClock::new(1, 2);
    let mut prev = clock.assign();
    for _ in 0..10_000 {
        let next = clock.assign();
        assert!(prev < next);
        prev = next;
    }
}

#[test]
fn test_hash_bucket() {
    let t = TransId {
        sec: 0,
        usec: 1234,
        host: 0,
        pid: 0,
    };
    assert_eq!(t.hash_bucket(100), 34);
    assert_eq!(t.hash_bucket(0), 0);
    assert_eq!(t.hash_bucket(-3), 0);
}
