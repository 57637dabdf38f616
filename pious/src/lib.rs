// Umbrella crate: one import for applications embedding a client, a data
// server, or both in one process.

pub use pious_base::{Error, Result, StatusCode, SysConfig, TransId};
pub use pious_ds::DataServer;
pub use pious_lib::{
    AccessMode, DirectResolver, DsInfo, FaultMode, Fd, Fstat, OpenSpec, Outcome, ParafileInfo,
    Pious, Resolver, View, Whence,
};
pub use pious_msg::{ChannelEndpoint, ChannelRealm, Op, SrcDest, Transport};
