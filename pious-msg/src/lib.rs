// Wire protocol between client libraries and data servers.
//
// Every message is (destination, tag, body). The tag encodes the operation
// within a small contiguous window at the top of the i32 range, so that
// message-passing layers whose tag space is shared with user code only have
// to reserve OP_COUNT consecutive values. The body is a MessagePack-encoded
// request or reply sum type with owned payloads; nothing borrowed survives
// the decode step, so the dispatcher can pattern-match freely.

use serde::{Deserialize, Serialize};

mod transport;
mod vbuf;
mod wire;

#[cfg(test)]
mod test;

pub use transport::{ChannelEndpoint, ChannelRealm, Envelope, Transport};
pub use vbuf::VbufSpec;
pub use wire::{
    CntrlReply, CntrlReplyBody, CntrlReq, CntrlReqBody, CreateFlag, LockKind, Reply, Request,
    TransReply, TransReplyBody, TransReq, TransReqBody,
};

/// Name of a transport endpoint: a client process or a data server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SrcDest(pub i32);

/// Number of distinct operations, and thus of reserved message tags.
pub const OP_COUNT: i32 = 18;

/// First message tag of the reserved window.
pub const TAG_BASE: i32 = i32::MAX - (OP_COUNT - 1);

/// Operation codes. Transaction operations occupy 0..=7, control operations
/// 8..=17; the numbering is contiguous because tags are `TAG_BASE + code`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Op {
    Read = 0,
    Write = 1,
    ReadSint = 2,
    WriteSint = 3,
    FaSint = 4,
    Prepare = 5,
    Commit = 6,
    Abort = 7,
    Lookup = 8,
    CacheFlush = 9,
    Mkdir = 10,
    Rmdir = 11,
    Unlink = 12,
    Chmod = 13,
    Stat = 14,
    Ping = 15,
    Reset = 16,
    Shutdown = 17,
}

const ALL_OPS: [Op; OP_COUNT as usize] = [
    Op::Read,
    Op::Write,
    Op::ReadSint,
    Op::WriteSint,
    Op::FaSint,
    Op::Prepare,
    Op::Commit,
    Op::Abort,
    Op::Lookup,
    Op::CacheFlush,
    Op::Mkdir,
    Op::Rmdir,
    Op::Unlink,
    Op::Chmod,
    Op::Stat,
    Op::Ping,
    Op::Reset,
    Op::Shutdown,
];

impl Op {
    pub fn is_trans(self) -> bool {
        (self as i32) <= (Op::Abort as i32)
    }

    pub fn is_control(self) -> bool {
        !self.is_trans()
    }

    pub fn tag(self) -> i32 {
        TAG_BASE + self as i32
    }

    pub fn from_tag(tag: i32) -> Option<Op> {
        if !(TAG_BASE..=TAG_BASE + (OP_COUNT - 1)).contains(&tag) {
            return None;
        }
        Some(ALL_OPS[(tag - TAG_BASE) as usize])
    }
}
