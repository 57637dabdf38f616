use serde::{Deserialize, Serialize};

/// Server-local handle for an open backing file, derived from the file's
/// device and inode numbers. Opaque to clients; handles go stale when the
/// owning server restarts, so callers gain nothing from caching them across
/// server instantiations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FHandle {
    pub dev: u64,
    pub ino: u64,
}
