use serde::{Deserialize, Serialize};

/// Outcome of an operation at a data server, stable across the wire.
///
/// Replies carry a single signed result channel (`rcode`) shared between
/// byte/integer counts and outcomes: counts are non-negative, `ReadOnly` is
/// the positive sentinel a prepare may return, every other non-`Ok` outcome
/// is negative. See [`StatusCode::rcode`] / [`StatusCode::from_rcode`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// Vote to commit with nothing written; commit need not be sent.
    ReadOnly,
    /// Transaction aborted; a normal outcome under contention.
    Abort,
    /// Commit/abort action not recorded in the transaction log.
    NotLog,
    BadFile,
    Access,
    Inval,
    NoEnt,
    Exist,
    Perm,
    Busy,
    NotDir,
    NotReg,
    NotEmpty,
    NameTooLong,
    NoSpc,
    Insuf,
    Timeout,
    Tport,
    SrcDest,
    Proto,
    Unxp,
    Fatal,
}

impl StatusCode {
    pub fn rcode(self) -> i64 {
        use StatusCode::*;
        match self {
            Ok => 0,
            ReadOnly => 1,
            Abort => -2,
            NotLog => -3,
            BadFile => -4,
            Access => -5,
            Inval => -6,
            NoEnt => -7,
            Exist => -8,
            Perm => -9,
            Busy => -10,
            NotDir => -11,
            NotReg => -12,
            NotEmpty => -13,
            NameTooLong => -14,
            NoSpc => -15,
            Insuf => -16,
            Timeout => -17,
            Tport => -18,
            SrcDest => -19,
            Proto => -20,
            Unxp => -21,
            Fatal => -22,
        }
    }

    /// Decode an `rcode` that is known not to carry a count. Counts (`> 1`)
    /// and unknown negatives decode to `None`.
    pub fn from_rcode(rcode: i64) -> Option<StatusCode> {
        use StatusCode::*;
        Some(match rcode {
            0 => Ok,
            1 => ReadOnly,
            -2 => Abort,
            -3 => NotLog,
            -4 => BadFile,
            -5 => Access,
            -6 => Inval,
            -7 => NoEnt,
            -8 => Exist,
            -9 => Perm,
            -10 => Busy,
            -11 => NotDir,
            -12 => NotReg,
            -13 => NotEmpty,
            -14 => NameTooLong,
            -15 => NoSpc,
            -16 => Insuf,
            -17 => Timeout,
            -18 => Tport,
            -19 => SrcDest,
            -20 => Proto,
            -21 => Unxp,
            -22 => Fatal,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Transport-layer failures: reported to the caller, no state mutated.
    pub fn is_transport(self) -> bool {
        use StatusCode::*;
        matches!(self, Tport | SrcDest | Timeout | Insuf)
    }

    /// Protocol-layer failures: a bug or a stale peer; the affected
    /// transaction is treated as aborted.
    pub fn is_protocol(self) -> bool {
        use StatusCode::*;
        matches!(self, Proto | Unxp)
    }

    /// Access failures: reported to the caller, no internal state damaged.
    pub fn is_access(self) -> bool {
        use StatusCode::*;
        matches!(
            self,
            BadFile
                | Access
                | Exist
                | NoEnt
                | Busy
                | NoSpc
                | NameTooLong
                | NotDir
                | NotReg
                | NotEmpty
                | Perm
                | Inval
        )
    }

    /// Normal transaction outcomes rather than failures.
    pub fn is_trans_outcome(self) -> bool {
        use StatusCode::*;
        matches!(self, Abort | ReadOnly | NotLog)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for StatusCode {}

#[cfg(test)]
mod test {
    use super::StatusCode;
    use test_log::test;

    #[test]
    fn test_rcode_round_trip() {
        for n in -32..=1_i64 {
            if let Some(sc) = StatusCode::from_rcode(n) {
                assert_eq!(sc.rcode(), n);
            }
        }
        assert_eq!(StatusCode::from_rcode(17), None);
        assert_eq!(StatusCode::from_rcode(-1), None);
    }

    #[test]
    fn test_layers_disjoint() {
        use StatusCode::*;
        for sc in [
            Ok, ReadOnly, Abort, NotLog, BadFile, Access, Inval, NoEnt, Exist, Perm, Busy, NotDir,
            NotReg, NotEmpty, NameTooLong, NoSpc, Insuf, Timeout, Tport, SrcDest, Proto, Unxp,
            Fatal,
        ] {
            let layers = [
                sc.is_transport(),
                sc.is_protocol(),
                sc.is_access(),
                sc.is_trans_outcome(),
            ];
            assert!(layers.iter().filter(|x| **x).count() <= 1, "{sc:?}");
        }
    }
}
