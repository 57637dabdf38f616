// Client library: presents parafiles - files declustered across data
// servers - to an application through read/write/seek primitives that are
// serializable with respect to concurrent clients.
//
// There is no process-global state. A Pious value is the library context:
// it owns the open-file table, the per-server transaction protocol state,
// the creation mask, the working directory, and the inconsistent-state
// latch; tests instantiate as many contexts as they need.
//
// Per-server transaction state is kept in an arena shared by every open
// file that touches the same server; entries are reference-counted by the
// files linking them and retired when the last such file closes.

use pious_base::{StatusCode, SysConfig, TidClock, TransId};
use pious_msg::{SrcDest, Transport};
use tracing::error;

mod client;
mod engine;
mod resolve;

#[cfg(test)]
mod test;

use engine::{AccessBuf, AccessKind};
pub use resolve::{DirectResolver, ParafileInfo, Resolver};

/// Result of a library call: either the value or the wire-stable outcome
/// taxonomy. Local transport faults surface as `Tport`/`Timeout`.
pub type Outcome<T> = std::result::Result<T, StatusCode>;

/// Open-file descriptor, an index into the context's file table.
pub type Fd = usize;

/// Logical mapping from linear byte addresses to (segment, offset).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum View {
    /// Linear view, file pointer shared by the group.
    Global,
    /// Linear view, per-client file pointer.
    Independent,
    /// One segment addressed directly at a caller-supplied index.
    Segmented,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FaultMode {
    /// Serializable but not crash-durable.
    Volatile,
    /// Serializable and logged at prepare time.
    Stable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessMode {
    RdOnly,
    WrOnly,
    RdWr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    Set,
    Cur,
}

/// A data server as named by the transport.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DsInfo {
    pub id: SrcDest,
}

/// Everything an open needs. `map` is the stripe-unit size for the linear
/// views and the segment index for the segmented view.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenSpec {
    pub group: String,
    pub path: String,
    pub view: View,
    pub map: i64,
    pub faultmode: FaultMode,
    pub access: AccessMode,
    pub creat: bool,
    pub trunc: bool,
    pub mode: u32,
    /// Segment count when the open creates the parafile.
    pub seg: usize,
    /// Servers to resolve against; empty selects the context default.
    pub dsv: Vec<DsInfo>,
}

impl OpenSpec {
    pub fn new(path: &str) -> OpenSpec {
        OpenSpec {
            group: "pious".to_string(),
            path: path.to_string(),
            view: View::Independent,
            map: 1,
            faultmode: FaultMode::Volatile,
            access: AccessMode::RdWr,
            creat: false,
            trunc: false,
            mode: 0o644,
            seg: 1,
            dsv: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fstat {
    pub pds_cnt: usize,
    pub seg_cnt: usize,
    pub view: View,
    pub map: i64,
    pub faultmode: FaultMode,
}

/// Transaction operation protocol state for one data server.
pub(crate) struct TransState {
    pub pdsid: SrcDest,
    /// Next sequence number to send; zero means the server has not
    /// participated in the current transaction.
    pub transsn: i32,
    /// Most recent send/receive result, packed as a wire rcode.
    pub rcode: i64,
    /// File table entries sharing this state.
    pub linkcnt: u32,
}

pub(crate) struct FtEntry {
    pub path: String,
    pub view: View,
    pub map: i64,
    pub faultmode: FaultMode,
    pub access: AccessMode,
    /// Local file pointer; the global view keeps the authoritative pointer
    /// at the low-order server.
    pub offset: i64,
    pub utrans_access: bool,
    pub utrans_offset: i64,
    /// Arena indices of the transaction state at each server hosting the
    /// parafile.
    pub tstate: Vec<usize>,
    pub pfinfo: ParafileInfo,
}

pub(crate) struct UTrans {
    pub id: TransId,
    pub faultmode: FaultMode,
}

pub struct Pious<T: Transport> {
    pub(crate) tp: T,
    pub(crate) cfg: SysConfig,
    pub(crate) resolver: DirectResolver,
    pub(crate) default_dsv: Vec<DsInfo>,
    pub(crate) files: Vec<Option<FtEntry>>,
    pub(crate) tstates: Vec<Option<TransState>>,
    /// Transaction id to present again after a server-side abort, so the
    /// retried transaction ages into scheduling priority.
    pub(crate) reuse: Option<TransId>,
    pub(crate) cmask: u32,
    pub(crate) cwd: String,
    pub(crate) utrans: Option<UTrans>,
    pub(crate) clock: TidClock,
    pub(crate) cmsgid: i32,
    pub(crate) badstate: bool,
}

impl<T: Transport> Pious<T> {
    pub fn new(tp: T, cfg: SysConfig, default_dsv: Vec<DsInfo>) -> Outcome<Pious<T>> {
        cfg.validate().map_err(|_| StatusCode::Inval)?;
        let files = (0..cfg.open_max).map(|_| None).collect();
        Ok(Pious {
            resolver: DirectResolver::new(&cfg),
            tp,
            cfg,
            default_dsv,
            files,
            tstates: Vec::new(),
            reuse: None,
            cmask: 0,
            cwd: String::new(),
            utrans: None,
            clock: TidClock::for_process(),
            cmsgid: 0,
            badstate: false,
        })
    }

    fn next_cmsgid(&mut self) -> i32 {
        self.cmsgid = self.cmsgid.wrapping_add(1);
        self.cmsgid
    }

    /// The inconsistent-state latch; once set, every call other than state
    /// queries fails with `Unxp` until the process restarts.
    pub fn badstate(&self) -> bool {
        self.badstate
    }

    /// Set the file-mode creation mask, returning the previous value.
    pub fn umask(&mut self, cmask: u32) -> u32 {
        std::mem::replace(&mut self.cmask, cmask & 0o777)
    }

    pub fn setcwd(&mut self, path: &str) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        self.cwd = path.trim_end_matches('/').to_string();
        Ok(())
    }

    pub fn getcwd(&self) -> &str {
        &self.cwd
    }

    fn full_path(&self, path: &str) -> String {
        if self.cwd.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd, path)
        }
    }

    fn tstate_insert(&mut self, pdsid: SrcDest) -> usize {
        if let Some(i) = self
            .tstates
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.pdsid == pdsid))
        {
            self.tstates[i].as_mut().unwrap().linkcnt += 1;
            return i;
        }
        let fresh = TransState {
            pdsid,
            transsn: 0,
            rcode: 0,
            linkcnt: 1,
        };
        match self.tstates.iter().position(|t| t.is_none()) {
            Some(i) => {
                self.tstates[i] = Some(fresh);
                i
            }
            None => {
                self.tstates.push(Some(fresh));
                self.tstates.len() - 1
            }
        }
    }

    fn live_tstates(&self) -> Vec<usize> {
        (0..self.tstates.len())
            .filter(|&i| self.tstates[i].is_some())
            .collect()
    }

    pub fn open(&mut self, spec: &OpenSpec) -> Outcome<Fd> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        match spec.view {
            View::Segmented => {
                if spec.map < 0 {
                    return Err(StatusCode::Inval);
                }
            }
            _ => {
                if spec.map <= 0 {
                    return Err(StatusCode::Inval);
                }
            }
        }
        let mut spec = spec.clone();
        if spec.dsv.is_empty() {
            spec.dsv = self.default_dsv.clone();
        }
        let full = self.full_path(&spec.path);
        let mode = spec.mode & !self.cmask & 0o777;
        let info = self.resolver.open(&self.tp, &spec, &full, mode)?;
        if spec.view == View::Segmented && spec.map as usize >= info.seg_cnt {
            return Err(StatusCode::Inval);
        }
        let need_read = spec.access != AccessMode::WrOnly;
        let need_write = spec.access != AccessMode::RdOnly;
        if (need_read && info.amode & 4 == 0) || (need_write && info.amode & 2 == 0) {
            return Err(StatusCode::Access);
        }
        let fd = self
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(StatusCode::Insuf)?;
        let tstate = info.pds_id.iter().map(|id| self.tstate_insert(*id)).collect();
        self.files[fd] = Some(FtEntry {
            path: full,
            view: spec.view,
            map: spec.map,
            faultmode: spec.faultmode,
            access: spec.access,
            offset: 0,
            utrans_access: false,
            utrans_offset: 0,
            tstate,
            pfinfo: info,
        });
        Ok(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        {
            let entry = self
                .files
                .get(fd)
                .and_then(|e| e.as_ref())
                .ok_or(StatusCode::BadFile)?;
            if self.utrans.is_some() && entry.utrans_access {
                return Err(StatusCode::Perm);
            }
        }
        let entry = self.files[fd].take().unwrap();
        for idx in entry.tstate {
            let ts = self.tstates[idx].as_mut().unwrap();
            ts.linkcnt -= 1;
            if ts.linkcnt == 0 {
                self.tstates[idx] = None;
            }
        }
        Ok(())
    }

    pub fn fstat(&self, fd: Fd) -> Outcome<Fstat> {
        let entry = self
            .files
            .get(fd)
            .and_then(|e| e.as_ref())
            .ok_or(StatusCode::BadFile)?;
        Ok(Fstat {
            pds_cnt: entry.pfinfo.pds_cnt,
            seg_cnt: entry.pfinfo.seg_cnt,
            view: entry.view,
            map: entry.map,
            faultmode: entry.faultmode,
        })
    }

    // ---- data access ----

    /// Read at the file pointer, advancing it by the bytes read.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Outcome<i64> {
        self.access_retry(AccessKind::Read, fd, &mut AccessBuf::Rd(buf), None)
            .map(|(n, _)| n)
    }

    /// Read at the file pointer; also returns the effective starting
    /// offset of the access.
    pub fn oread(&mut self, fd: Fd, buf: &mut [u8]) -> Outcome<(i64, i64)> {
        self.access_retry(AccessKind::Read, fd, &mut AccessBuf::Rd(buf), None)
    }

    /// Read at an explicit offset; the file pointer does not move.
    pub fn pread(&mut self, fd: Fd, buf: &mut [u8], offset: i64) -> Outcome<i64> {
        self.access_retry(AccessKind::Read, fd, &mut AccessBuf::Rd(buf), Some(offset))
            .map(|(n, _)| n)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Outcome<i64> {
        self.access_retry(AccessKind::Write, fd, &mut AccessBuf::Wr(buf), None)
            .map(|(n, _)| n)
    }

    pub fn owrite(&mut self, fd: Fd, buf: &[u8]) -> Outcome<(i64, i64)> {
        self.access_retry(AccessKind::Write, fd, &mut AccessBuf::Wr(buf), None)
    }

    pub fn pwrite(&mut self, fd: Fd, buf: &[u8], offset: i64) -> Outcome<i64> {
        self.access_retry(AccessKind::Write, fd, &mut AccessBuf::Wr(buf), Some(offset))
            .map(|(n, _)| n)
    }

    fn access_retry(
        &mut self,
        kind: AccessKind,
        fd: Fd,
        buf: &mut AccessBuf<'_>,
        offset: Option<i64>,
    ) -> Outcome<(i64, i64)> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let mut retry = if self.utrans.is_some() {
            1
        } else {
            self.cfg.retry_max
        };
        loop {
            match self.access_generic(kind, fd, buf, offset) {
                Ok(v) => return Ok(v),
                Err(sc) => {
                    if self.utrans.is_some() {
                        // Any failed access inside a user transaction aborts
                        // it; the access error is what the caller sees.
                        let _ = self.tabort();
                        return Err(sc);
                    }
                    retry -= 1;
                    if sc != StatusCode::Abort || retry == 0 || self.badstate {
                        return Err(sc);
                    }
                }
            }
        }
    }

    pub fn lseek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Outcome<i64> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let mut retry = if self.utrans.is_some() {
            1
        } else {
            self.cfg.retry_max
        };
        loop {
            match self.lseek_proxy(fd, offset, whence) {
                Ok(v) => return Ok(v),
                Err(sc) => {
                    if self.utrans.is_some() {
                        let _ = self.tabort();
                        return Err(sc);
                    }
                    retry -= 1;
                    if sc != StatusCode::Abort || retry == 0 || self.badstate {
                        return Err(sc);
                    }
                }
            }
        }
    }

    // ---- user transactions ----

    pub fn tbegin(&mut self, faultmode: FaultMode) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        if self.utrans.is_some() {
            return Err(StatusCode::Perm);
        }
        let id = match self.reuse.take() {
            Some(id) => id,
            None => self.clock.assign(),
        };
        for f in self.files.iter_mut().flatten() {
            f.utrans_access = false;
            f.utrans_offset = f.offset;
        }
        for ts in self.tstates.iter_mut().flatten() {
            ts.transsn = 0;
        }
        self.utrans = Some(UTrans { id, faultmode });
        Ok(())
    }

    /// Commit the user transaction: prepare first when it is stable, then
    /// commit at every participating server. Any error means the
    /// transaction aborted or the system state is inconsistent.
    pub fn tend(&mut self) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let ut = match self.utrans.take() {
            None => return Ok(()),
            Some(ut) => ut,
        };
        let idxs = self.live_tstates();
        let mut acode = None;
        if ut.faultmode == FaultMode::Stable {
            acode = self.prepare_all(ut.id, &idxs);
        }
        if acode.is_none() {
            match self.commit_all(ut.id, &idxs) {
                None | Some(StatusCode::NotLog) => {}
                Some(sc) => {
                    error!(target: "pious", "commit incomplete: {sc}; file state inconsistent");
                    self.badstate = true;
                    acode = Some(sc);
                }
            }
        } else {
            match self.abort_all(ut.id, &idxs) {
                None | Some(StatusCode::NotLog) => self.restore_pointers(),
                Some(_) => self.badstate = true,
            }
        }
        match acode {
            None => Ok(()),
            Some(sc) => {
                if sc == StatusCode::Abort {
                    self.reuse = Some(ut.id);
                }
                match sc {
                    StatusCode::Abort
                    | StatusCode::Insuf
                    | StatusCode::Timeout
                    | StatusCode::Tport
                    | StatusCode::Fatal => Err(sc),
                    StatusCode::SrcDest | StatusCode::Proto => {
                        self.badstate = true;
                        Err(StatusCode::Unxp)
                    }
                    _ => Err(StatusCode::Unxp),
                }
            }
        }
    }

    /// Abort the user transaction, undoing its effects and restoring the
    /// file pointers captured at tbegin.
    pub fn tabort(&mut self) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let ut = match self.utrans.take() {
            None => return Ok(()),
            Some(ut) => ut,
        };
        let idxs = self.live_tstates();
        match self.abort_all(ut.id, &idxs) {
            None | Some(StatusCode::NotLog) => {
                self.restore_pointers();
                Ok(())
            }
            Some(sc) => {
                self.badstate = true;
                match sc {
                    StatusCode::Insuf | StatusCode::Timeout | StatusCode::Tport
                    | StatusCode::Fatal => Err(sc),
                    _ => Err(StatusCode::Unxp),
                }
            }
        }
    }

    fn restore_pointers(&mut self) {
        for f in self.files.iter_mut().flatten() {
            if f.utrans_access {
                f.offset = f.utrans_offset;
            }
        }
    }

    // ---- parafile control ----

    pub fn unlink(&mut self, dsv: &[DsInfo], path: &str) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        let full = self.full_path(path);
        self.resolver.unlink(&self.tp, &dsv, &full)
    }

    pub fn chmod(&mut self, dsv: &[DsInfo], path: &str, mode: u32) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        let full = self.full_path(path);
        self.resolver.chmod(&self.tp, &dsv, &full, mode & 0o777)
    }

    /// Create a directory on the data servers for parafiles to live under.
    pub fn mkdir(&mut self, dsv: &[DsInfo], path: &str, mode: u32) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        let full = self.full_path(path);
        self.resolver.mkdir(&self.tp, &dsv, &full, mode & !self.cmask & 0o777)
    }

    /// Remove an empty directory from the data servers.
    pub fn rmdir(&mut self, dsv: &[DsInfo], path: &str) -> Outcome<()> {
        if self.badstate {
            return Err(StatusCode::Unxp);
        }
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        let full = self.full_path(path);
        self.resolver.rmdir(&self.tp, &dsv, &full)
    }

    /// Probe that each data server is alive and answering.
    pub fn ping(&mut self, dsv: &[DsInfo]) -> Outcome<()> {
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        for ds in &dsv {
            let cm = self.next_cmsgid();
            client::ping(&self.tp, ds.id, cm)?;
        }
        Ok(())
    }

    /// Ask each data server to flush its cache and exit its dispatch loop.
    pub fn shutdown(&mut self, dsv: &[DsInfo]) -> Outcome<()> {
        let dsv = if dsv.is_empty() {
            self.default_dsv.clone()
        } else {
            dsv.to_vec()
        };
        for ds in &dsv {
            let cm = self.next_cmsgid();
            client::shutdown(&self.tp, ds.id, cm)?;
        }
        Ok(())
    }
}
