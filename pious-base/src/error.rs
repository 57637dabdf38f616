// Fault type for the local side of the system: storage plumbing, codec
// trouble, transport breakage. The outcome codes that travel on the wire
// (status.rs) are ordinary values, not faults - a data server voting to
// abort is the protocol working, not the process failing - so StatusCode
// only becomes an Error at the point a caller gives up on it, via the
// blanket conversion below.
//
// Every Error grabs a backtrace when it is born and announces itself to the
// tracing system, so there is a single place to break on (or grep for) any
// fault shortly after it exists, including ones propagated back to us from
// libraries underneath.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    #[allow(dead_code)]
    inner: DynBacktraceError,
}

impl Error {
    pub fn new<E>(source: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        error!(target: "pious", "{source}");
        Error {
            inner: DynBacktraceError::from(source),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(source: E) -> Error {
        Error::new(source)
    }
}

/// A one-off fault carrying nothing but its description; the common case
/// for invariant breakage in the lock, cache, and transport layers.
pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(std::io::Error::other(msg.into().into_owned()))
}

#[cfg(test)]
mod test {
    use super::{err, Error};
    use crate::StatusCode;
    use test_log::test;

    #[test]
    fn test_fault_construction() {
        let _e = err("segment store unavailable");
        let _e: Error = StatusCode::Tport.into();
        let _e: Error = std::io::Error::other("backing file lost").into();
    }
}
