use crate::Op;
use pious_base::{FHandle, Result, TransId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Read,
    Write,
}

/// File lookup behavior: whether a missing file may be created, and whether
/// an existing file is truncated to zero length.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CreateFlag {
    pub creat: bool,
    pub trunc: bool,
}

/// A transaction operation request. The first operation of a transaction
/// carries `transsn == 0` and each subsequent operation increments it by
/// exactly one; abort is exempt from the sequence rule.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransReq {
    pub transid: TransId,
    pub transsn: i32,
    pub body: TransReqBody,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransReqBody {
    Read {
        fhandle: FHandle,
        offset: i64,
        nbyte: i64,
        lock: LockKind,
    },
    Write {
        fhandle: FHandle,
        offset: i64,
        data: Vec<u8>,
    },
    /// Read signed integers from a file treated as an i64 array indexed
    /// from 0; works with `FaSint`, avoiding integer-size trouble between
    /// heterogeneous hosts.
    ReadSint {
        fhandle: FHandle,
        offset: i64,
        nint: i64,
    },
    WriteSint {
        fhandle: FHandle,
        offset: i64,
        vals: Vec<i64>,
    },
    /// Atomic read-increment-write under a write lock; replies with the
    /// pre-increment value. Shared file pointers are built on this.
    FaSint {
        fhandle: FHandle,
        offset: i64,
        increment: i64,
    },
    Prepare,
    Commit,
    Abort,
}

impl TransReqBody {
    pub fn op(&self) -> Op {
        match self {
            TransReqBody::Read { .. } => Op::Read,
            TransReqBody::Write { .. } => Op::Write,
            TransReqBody::ReadSint { .. } => Op::ReadSint,
            TransReqBody::WriteSint { .. } => Op::WriteSint,
            TransReqBody::FaSint { .. } => Op::FaSint,
            TransReqBody::Prepare => Op::Prepare,
            TransReqBody::Commit => Op::Commit,
            TransReqBody::Abort => Op::Abort,
        }
    }
}

/// Reply to a transaction operation. `rcode` is the shared result channel:
/// non-negative byte/integer counts for data operations, a packed
/// [`pious_base::StatusCode`] otherwise.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransReply {
    pub transid: TransId,
    pub transsn: i32,
    pub rcode: i64,
    pub body: TransReplyBody,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransReplyBody {
    None,
    Read(Vec<u8>),
    ReadSint(Vec<i64>),
    FaSint(i64),
}

/// A control operation request. Control operations are idempotent and are
/// matched to replies by the caller-chosen `cmsgid`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CntrlReq {
    pub cmsgid: i32,
    pub body: CntrlReqBody,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CntrlReqBody {
    Lookup {
        path: String,
        cflag: CreateFlag,
        mode: u32,
    },
    CacheFlush,
    Mkdir {
        path: String,
        mode: u32,
    },
    Rmdir {
        path: String,
    },
    Unlink {
        path: String,
    },
    Chmod {
        path: String,
        mode: u32,
    },
    Stat {
        path: String,
    },
    Ping,
    Reset,
    Shutdown,
}

impl CntrlReqBody {
    pub fn op(&self) -> Op {
        match self {
            CntrlReqBody::Lookup { .. } => Op::Lookup,
            CntrlReqBody::CacheFlush => Op::CacheFlush,
            CntrlReqBody::Mkdir { .. } => Op::Mkdir,
            CntrlReqBody::Rmdir { .. } => Op::Rmdir,
            CntrlReqBody::Unlink { .. } => Op::Unlink,
            CntrlReqBody::Chmod { .. } => Op::Chmod,
            CntrlReqBody::Stat { .. } => Op::Stat,
            CntrlReqBody::Ping => Op::Ping,
            CntrlReqBody::Reset => Op::Reset,
            CntrlReqBody::Shutdown => Op::Shutdown,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CntrlReply {
    pub cmsgid: i32,
    pub rcode: i64,
    pub body: CntrlReplyBody,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CntrlReplyBody {
    None,
    Lookup { fhandle: FHandle, amode: i32 },
    Stat { mode: u32 },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Trans(TransReq),
    Cntrl(CntrlReq),
}

impl Request {
    pub fn op(&self) -> Op {
        match self {
            Request::Trans(t) => t.body.op(),
            Request::Cntrl(c) => c.body.op(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Request> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Trans(TransReply),
    Cntrl(CntrlReply),
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Reply> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
