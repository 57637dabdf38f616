// The data-server dispatch loop: a single-threaded cooperative engine that
// receives one typed message at a time, runs the transaction operation
// protocol, and either executes the operation or parks it on the lock it
// needs. Parked operations are re-considered whenever a transaction releases
// and when their deadlock-avoidance deadline expires.
//
// Transaction operation protocol, per (client, transaction):
//   - the first operation carries transsn == 0;
//   - each subsequent operation carries transsn exactly one greater than the
//     last one this server handled;
//   - at most one transactional operation is outstanding at a time;
//   - abort is exempt: it may arrive at any moment and resets the expected
//     sequence to zero by retiring the transaction entirely.
//
// Deadlock avoidance: a parked operation whose deadline expires is aborted
// only when some conflicting lock holder is older than it. Completed
// operations are never revoked, so the oldest contender always survives and
// a client that retries with the same (aging) transaction id must
// eventually win its locks.

use crate::cache::{BlockKey, Cache};
use crate::lock::{LockOutcome, LockTable};
use crate::sfile::SFile;
use crate::trans::{TransState, TransTable, WriteRec};
use crate::wlog::WriteLog;
use pious_base::{err, ByteRange, FHandle, Result, StatusCode, SysConfig, TransId};
use pious_msg::{
    CntrlReply, CntrlReplyBody, CntrlReq, CntrlReqBody, Envelope, LockKind, Op, Reply, Request,
    SrcDest, TransReply, TransReplyBody, TransReq, TransReqBody, Transport,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct BlockedOp {
    client: SrcDest,
    req: TransReq,
    deadline: Instant,
}

pub struct DataServer<T: Transport> {
    tp: T,
    cfg: SysConfig,
    sfile: SFile,
    locks: LockTable,
    cache: Cache,
    trans: TransTable,
    wlog: WriteLog,
    blocked: Vec<BlockedOp>,
    badstate: bool,
    running: bool,
}

fn lock_params(body: &TransReqBody) -> Option<(FHandle, ByteRange, LockKind)> {
    match body {
        TransReqBody::Read {
            fhandle,
            offset,
            nbyte,
            lock,
        } => Some((*fhandle, ByteRange::new(*offset, *nbyte), *lock)),
        TransReqBody::Write {
            fhandle,
            offset,
            data,
        } => Some((
            *fhandle,
            ByteRange::new(*offset, data.len() as i64),
            LockKind::Write,
        )),
        TransReqBody::ReadSint {
            fhandle,
            offset,
            nint,
        } => Some((
            *fhandle,
            ByteRange::new(offset * 8, nint * 8),
            LockKind::Read,
        )),
        TransReqBody::WriteSint {
            fhandle,
            offset,
            vals,
        } => Some((
            *fhandle,
            ByteRange::new(offset * 8, vals.len() as i64 * 8),
            LockKind::Write,
        )),
        TransReqBody::FaSint {
            fhandle, offset, ..
        } => Some((*fhandle, ByteRange::new(offset * 8, 8), LockKind::Write)),
        TransReqBody::Prepare | TransReqBody::Commit | TransReqBody::Abort => None,
    }
}

fn is_buffered_write(body: &TransReqBody) -> bool {
    matches!(
        body,
        TransReqBody::Write { .. } | TransReqBody::WriteSint { .. } | TransReqBody::FaSint { .. }
    )
}

/// Execute a granted data operation against the cache with the owning
/// transaction's buffered writes overlaid; writes only extend the redo set.
fn exec_data_op(
    sfile: &SFile,
    cache: &mut Cache,
    entry: &mut crate::trans::TransEntry,
    body: TransReqBody,
) -> std::result::Result<(i64, TransReplyBody), StatusCode> {
    match body {
        TransReqBody::Read {
            fhandle,
            offset,
            nbyte,
            ..
        } => {
            let eff = entry.effective_len(fhandle, cache.len(sfile, fhandle)?);
            let n = (eff - offset).clamp(0, nbyte);
            let mut buf = vec![0u8; n as usize];
            cache.read(sfile, fhandle, offset, &mut buf)?;
            entry.overlay(fhandle, offset, &mut buf);
            Ok((n, TransReplyBody::Read(buf)))
        }
        TransReqBody::Write {
            fhandle,
            offset,
            data,
        } => {
            let n = data.len() as i64;
            entry.redo.push(WriteRec {
                fhandle,
                offset,
                data,
            });
            Ok((n, TransReplyBody::None))
        }
        TransReqBody::ReadSint {
            fhandle,
            offset,
            nint,
        } => {
            let eff = entry.effective_len(fhandle, cache.len(sfile, fhandle)?);
            let avail = ((eff - offset * 8) / 8).clamp(0, nint);
            let mut buf = vec![0u8; (avail * 8) as usize];
            cache.read(sfile, fhandle, offset * 8, &mut buf)?;
            entry.overlay(fhandle, offset * 8, &mut buf);
            let vals = buf
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Ok((avail, TransReplyBody::ReadSint(vals)))
        }
        TransReqBody::WriteSint {
            fhandle,
            offset,
            vals,
        } => {
            let mut data = Vec::with_capacity(vals.len() * 8);
            for v in &vals {
                data.extend_from_slice(&v.to_le_bytes());
            }
            entry.redo.push(WriteRec {
                fhandle,
                offset: offset * 8,
                data,
            });
            Ok((vals.len() as i64, TransReplyBody::None))
        }
        TransReqBody::FaSint {
            fhandle,
            offset,
            increment,
        } => {
            // Read-increment-write under the write lock taken by the caller;
            // a slot past end of file reads as zero and the write extends.
            let mut buf = [0u8; 8];
            cache.read(sfile, fhandle, offset * 8, &mut buf)?;
            entry.overlay(fhandle, offset * 8, &mut buf);
            let val = i64::from_le_bytes(buf);
            entry.redo.push(WriteRec {
                fhandle,
                offset: offset * 8,
                data: (val + increment).to_le_bytes().to_vec(),
            });
            Ok((0, TransReplyBody::FaSint(val)))
        }
        TransReqBody::Prepare | TransReqBody::Commit | TransReqBody::Abort => {
            Err(StatusCode::Unxp)
        }
    }
}

impl<T: Transport> DataServer<T> {
    pub fn new(tp: T, root: PathBuf, cfg: SysConfig) -> Result<DataServer<T>> {
        cfg.validate()?;
        let wlog = WriteLog::new(root.join(".log")).map_err(|sc| err(format!("log dir: {sc}")))?;
        let cache = Cache::new(cfg.block_size, cfg.cache_blocks_effective());
        Ok(DataServer {
            tp,
            cfg,
            sfile: SFile::new(root),
            locks: LockTable::new(),
            cache,
            trans: TransTable::new(),
            wlog,
            blocked: Vec::new(),
            badstate: false,
            running: false,
        })
    }

    /// Run the dispatch loop until a shutdown request arrives.
    pub fn run(&mut self) -> Result<()> {
        info!(target: "pious", server = self.tp.local().0, "data server up");
        self.running = true;
        while self.running {
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));
            if let Some(env) = self.tp.recv(None, None, timeout)? {
                self.dispatch(env)?;
            }
            self.expire_blocked()?;
        }
        if let Err(sc) = self.cache.flush_all(&self.sfile) {
            error!(target: "pious", "final cache flush failed: {sc}");
        }
        info!(target: "pious", server = self.tp.local().0, "data server down");
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.blocked.iter().map(|b| b.deadline).min()
    }

    fn dispatch(&mut self, env: Envelope) -> Result<()> {
        let req = match Request::decode(&env.bytes) {
            Ok(req) => req,
            Err(_) => {
                warn!(target: "pious", src = env.src.0, tag = env.tag, "undecodable request dropped");
                return Ok(());
            }
        };
        match req {
            Request::Cntrl(c) => self.handle_cntrl(env.src, c),
            Request::Trans(t) => self.handle_trans(env.src, t),
        }
    }

    fn send_trans_reply(
        &mut self,
        dst: SrcDest,
        op: Op,
        transid: TransId,
        transsn: i32,
        rcode: i64,
        body: TransReplyBody,
    ) -> Result<()> {
        let rep = Reply::Trans(TransReply {
            transid,
            transsn,
            rcode,
            body,
        });
        if let Err(e) = self.tp.send(dst, op.tag(), rep.encode()?) {
            warn!(target: "pious", dst = dst.0, "reply not delivered: {e:?}");
        }
        Ok(())
    }

    fn send_cntrl_reply(
        &mut self,
        dst: SrcDest,
        op: Op,
        cmsgid: i32,
        rcode: i64,
        body: CntrlReplyBody,
    ) -> Result<()> {
        let rep = Reply::Cntrl(CntrlReply {
            cmsgid,
            rcode,
            body,
        });
        if let Err(e) = self.tp.send(dst, op.tag(), rep.encode()?) {
            warn!(target: "pious", dst = dst.0, "reply not delivered: {e:?}");
        }
        Ok(())
    }

    fn handle_trans(&mut self, client: SrcDest, req: TransReq) -> Result<()> {
        let op = req.body.op();
        if self.badstate {
            return self.send_trans_reply(
                client,
                op,
                req.transid,
                req.transsn,
                StatusCode::Fatal.rcode(),
                TransReplyBody::None,
            );
        }
        if op == Op::Abort {
            return self.do_abort(client, req);
        }
        let (state, was_blocked, expected_sn) = {
            let entry = self.trans.get_or_insert(req.transid);
            (entry.state, entry.blocked, entry.expected_sn)
        };
        if state == TransState::Aborted {
            self.trans.remove(&req.transid);
            return self.send_trans_reply(
                client,
                op,
                req.transid,
                req.transsn,
                StatusCode::Abort.rcode(),
                TransReplyBody::None,
            );
        }
        if was_blocked || req.transsn != expected_sn {
            warn!(target: "pious", ?op, transsn = req.transsn, expected = expected_sn,
                  blocked = was_blocked, "transaction protocol violation");
            return self.send_trans_reply(
                client,
                op,
                req.transid,
                req.transsn,
                StatusCode::Proto.rcode(),
                TransReplyBody::None,
            );
        }
        match op {
            Op::Prepare => self.do_prepare(client, req),
            Op::Commit => self.do_commit(client, req),
            _ => self.do_data(client, req),
        }
    }

    fn do_data(&mut self, client: SrcDest, req: TransReq) -> Result<()> {
        let (fhandle, range, kind) = match lock_params(&req.body) {
            Some(p) => p,
            None => return Err(err("data op without lock parameters")),
        };
        let sc = if range.start < 0 || range.len < 0 {
            Some(StatusCode::Inval)
        } else if !self.sfile.known(fhandle) {
            Some(StatusCode::BadFile)
        } else if is_buffered_write(&req.body) && !self.sfile.writable(fhandle).unwrap_or(false) {
            Some(StatusCode::Access)
        } else {
            None
        };
        if let Some(sc) = sc {
            let entry = self.trans.get_mut(&req.transid).unwrap();
            entry.expected_sn = req.transsn + 1;
            return self.send_trans_reply(
                client,
                req.body.op(),
                req.transid,
                req.transsn,
                sc.rcode(),
                TransReplyBody::None,
            );
        }
        match self.locks.acquire(req.transid, fhandle, range, kind) {
            LockOutcome::Granted => self.run_granted(BlockedOp {
                client,
                req,
                deadline: Instant::now(),
            }),
            LockOutcome::Blocked => {
                debug!(target: "pious", transsn = req.transsn, "operation blocked on lock");
                let entry = self.trans.get_mut(&req.transid).unwrap();
                entry.blocked = true;
                self.blocked.push(BlockedOp {
                    client,
                    req,
                    deadline: Instant::now() + self.cfg.deadlock_timeout,
                });
                Ok(())
            }
        }
    }

    /// Execute and answer a data operation whose lock is held.
    fn run_granted(&mut self, op: BlockedOp) -> Result<()> {
        let BlockedOp { client, req, .. } = op;
        let transid = req.transid;
        let transsn = req.transsn;
        let opcode = req.body.op();
        let entry = self.trans.get_mut(&transid).unwrap();
        entry.blocked = false;
        entry.expected_sn = transsn + 1;
        let (rcode, body) = match exec_data_op(&self.sfile, &mut self.cache, entry, req.body) {
            Ok((rcode, body)) => (rcode, body),
            Err(sc) => {
                if matches!(sc, StatusCode::Unxp | StatusCode::Fatal) {
                    error!(target: "pious", "unexpected failure executing operation: {sc}");
                    self.badstate = true;
                }
                (sc.rcode(), TransReplyBody::None)
            }
        };
        self.send_trans_reply(client, opcode, transid, transsn, rcode, body)
    }

    fn do_prepare(&mut self, client: SrcDest, req: TransReq) -> Result<()> {
        let transid = req.transid;
        let entry = self.trans.get_mut(&transid).unwrap();
        if entry.redo.is_empty() {
            // Read-only vote to commit: no commit or abort will follow, so
            // the transaction retires here.
            self.trans.remove(&transid);
            self.locks.release_all(transid);
            self.send_trans_reply(
                client,
                Op::Prepare,
                transid,
                req.transsn,
                StatusCode::ReadOnly.rcode(),
                TransReplyBody::None,
            )?;
            return self.retry_blocked();
        }
        let rcode = match self.wlog.record(&transid, &entry.redo) {
            Ok(()) => {
                entry.state = TransState::Prepared;
                entry.expected_sn = req.transsn + 1;
                StatusCode::Ok.rcode()
            }
            Err(sc) => {
                warn!(target: "pious", "prepare could not log redo set: {sc}");
                sc.rcode()
            }
        };
        self.send_trans_reply(
            client,
            Op::Prepare,
            transid,
            req.transsn,
            rcode,
            TransReplyBody::None,
        )
    }

    fn do_commit(&mut self, client: SrcDest, req: TransReq) -> Result<()> {
        let transid = req.transid;
        let entry = self.trans.remove(&transid).unwrap();
        let stable = entry.state == TransState::Prepared;
        let mut touched: Vec<BlockKey> = Vec::new();
        let mut rcode = StatusCode::Ok.rcode();
        for rec in &entry.redo {
            match self.cache.write(&self.sfile, rec.fhandle, rec.offset, &rec.data) {
                Ok(mut keys) => touched.append(&mut keys),
                Err(sc) => {
                    error!(target: "pious", "commit could not apply buffered write: {sc}");
                    self.badstate = true;
                    rcode = StatusCode::Fatal.rcode();
                    break;
                }
            }
        }
        if !self.badstate && stable {
            if let Err(sc) = self.cache.flush_blocks(&self.sfile, &touched) {
                error!(target: "pious", "commit could not force blocks: {sc}");
                self.badstate = true;
                rcode = StatusCode::Fatal.rcode();
            } else if self.wlog.truncate(&transid).is_err() {
                rcode = StatusCode::NotLog.rcode();
            }
        }
        self.locks.release_all(transid);
        self.send_trans_reply(
            client,
            Op::Commit,
            transid,
            req.transsn,
            rcode,
            TransReplyBody::None,
        )?;
        self.retry_blocked()
    }

    fn do_abort(&mut self, client: SrcDest, req: TransReq) -> Result<()> {
        let transid = req.transid;
        // A parked operation of this transaction is answered first; abort is
        // not subject to the one-outstanding rule.
        let mut parked = Vec::new();
        let mut i = 0;
        while i < self.blocked.len() {
            if self.blocked[i].req.transid == transid {
                parked.push(self.blocked.remove(i));
            } else {
                i += 1;
            }
        }
        for op in parked {
            self.send_trans_reply(
                op.client,
                op.req.body.op(),
                transid,
                op.req.transsn,
                StatusCode::Abort.rcode(),
                TransReplyBody::None,
            )?;
        }
        let rcode = match self.trans.remove(&transid) {
            Some(entry) if entry.state == TransState::Prepared => {
                match self.wlog.truncate(&transid) {
                    Ok(()) => StatusCode::Ok.rcode(),
                    Err(_) => StatusCode::NotLog.rcode(),
                }
            }
            _ => StatusCode::Ok.rcode(),
        };
        self.locks.release_all(transid);
        self.send_trans_reply(
            client,
            Op::Abort,
            transid,
            req.transsn,
            rcode,
            TransReplyBody::None,
        )?;
        self.retry_blocked()
    }

    /// Deadlock avoidance for parked operations whose deadline passed.
    fn expire_blocked(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut i = 0;
        while i < self.blocked.len() {
            if self.blocked[i].deadline > now {
                i += 1;
                continue;
            }
            let transid = self.blocked[i].req.transid;
            let (fhandle, range, kind) = lock_params(&self.blocked[i].req.body).unwrap();
            let holders = self.locks.conflict_holders(transid, fhandle, range, kind);
            if holders.is_empty() {
                // Became grantable without a release notification; run it.
                let op = self.blocked.remove(i);
                self.locks.acquire(transid, fhandle, range, kind);
                self.run_granted(op)?;
                i = 0;
            } else if holders.iter().any(|h| *h < transid) {
                // The younger side of the conflict aborts; the waiter's
                // client retries under the same id and ages into priority.
                warn!(target: "pious", "deadlock timeout, aborting blocked transaction");
                let op = self.blocked.remove(i);
                self.trans.remove(&transid);
                self.locks.release_all(transid);
                self.send_trans_reply(
                    op.client,
                    op.req.body.op(),
                    transid,
                    op.req.transsn,
                    StatusCode::Abort.rcode(),
                    TransReplyBody::None,
                )?;
                self.retry_blocked()?;
                i = 0;
            } else {
                // Every conflicting holder is younger; they will finish or
                // abort on their own timers. Keep waiting.
                self.blocked[i].deadline = now + self.cfg.deadlock_timeout;
                i += 1;
            }
        }
        Ok(())
    }

    /// Re-try parked operations, oldest parked first, after a release.
    fn retry_blocked(&mut self) -> Result<()> {
        let mut progress = true;
        while progress {
            progress = false;
            let mut i = 0;
            while i < self.blocked.len() {
                let transid = self.blocked[i].req.transid;
                let (fhandle, range, kind) = lock_params(&self.blocked[i].req.body).unwrap();
                if self.locks.acquire(transid, fhandle, range, kind) == LockOutcome::Granted {
                    let op = self.blocked.remove(i);
                    self.run_granted(op)?;
                    progress = true;
                } else {
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let parked = std::mem::take(&mut self.blocked);
        for op in parked {
            self.send_trans_reply(
                op.client,
                op.req.body.op(),
                op.req.transid,
                op.req.transsn,
                StatusCode::Abort.rcode(),
                TransReplyBody::None,
            )?;
        }
        for transid in self.trans.ids() {
            self.locks.release_all(transid);
            self.trans.remove(&transid);
        }
        self.badstate = false;
        Ok(())
    }

    fn handle_cntrl(&mut self, client: SrcDest, creq: CntrlReq) -> Result<()> {
        let op = creq.body.op();
        let cmsgid = creq.cmsgid;
        if self.badstate && !matches!(op, Op::Ping | Op::Stat | Op::Reset | Op::Shutdown) {
            return self.send_cntrl_reply(
                client,
                op,
                cmsgid,
                StatusCode::Fatal.rcode(),
                CntrlReplyBody::None,
            );
        }
        let unit = |r: std::result::Result<(), StatusCode>| match r {
            Ok(()) => (StatusCode::Ok.rcode(), CntrlReplyBody::None),
            Err(sc) => (sc.rcode(), CntrlReplyBody::None),
        };
        let (rcode, body) = match creq.body {
            CntrlReqBody::Lookup { path, cflag, mode } => {
                match self.sfile.lookup(&path, cflag, mode) {
                    Ok((fhandle, amode)) => (
                        StatusCode::Ok.rcode(),
                        CntrlReplyBody::Lookup { fhandle, amode },
                    ),
                    Err(sc) => (sc.rcode(), CntrlReplyBody::None),
                }
            }
            CntrlReqBody::CacheFlush => unit(self.cache.flush_all(&self.sfile)),
            CntrlReqBody::Mkdir { path, mode } => unit(self.sfile.mkdir(&path, mode)),
            CntrlReqBody::Rmdir { path } => unit(self.sfile.rmdir(&path)),
            CntrlReqBody::Unlink { path } => match self.sfile.unlink(&path) {
                Ok(stale) => {
                    for fhandle in stale {
                        self.cache.drop_file(fhandle);
                    }
                    (StatusCode::Ok.rcode(), CntrlReplyBody::None)
                }
                Err(sc) => (sc.rcode(), CntrlReplyBody::None),
            },
            CntrlReqBody::Chmod { path, mode } => unit(self.sfile.chmod(&path, mode)),
            CntrlReqBody::Stat { path } => match self.sfile.stat(&path) {
                Ok(mode) => (StatusCode::Ok.rcode(), CntrlReplyBody::Stat { mode }),
                Err(sc) => (sc.rcode(), CntrlReplyBody::None),
            },
            CntrlReqBody::Ping => (StatusCode::Ok.rcode(), CntrlReplyBody::None),
            CntrlReqBody::Reset => {
                self.reset()?;
                (StatusCode::Ok.rcode(), CntrlReplyBody::None)
            }
            CntrlReqBody::Shutdown => {
                let rcode = match self.cache.flush_all(&self.sfile) {
                    Ok(()) => StatusCode::Ok.rcode(),
                    Err(sc) => sc.rcode(),
                };
                self.running = false;
                (rcode, CntrlReplyBody::None)
            }
        };
        self.send_cntrl_reply(client, op, cmsgid, rcode, body)
    }
}
