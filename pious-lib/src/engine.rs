// The access engine: translates one logical read/write/seek on an open
// parafile into a coordinated sequence of per-server transaction operations.
//
// For linear views, data bytes are ordered by round-robin stripe units
// across the segment files. An access computes, per touched segment, the
// (segment_file_offset, byte_count) slice and a vector buffer descriptor
// mapping that slice back into the caller's buffer, then pipelines requests
// round-robin across the servers so that at most one transactional request
// is outstanding per server. When the segment count is not a multiple of
// the server count and the accessed range wraps past the last segment, the
// pipeline runs in two phases at the wrap; otherwise two operations could
// land concurrently at one server, violating the operation protocol.

use crate::client::{self, Outcome};
use crate::{AccessMode, FaultMode, Fd, Pious, View, Whence};
use pious_base::{FHandle, StatusCode, TransId};
use pious_msg::{LockKind, SrcDest, Transport, VbufSpec};
use tracing::{debug, warn};

/// Largest file offset the engine will form; keeps the striping arithmetic
/// clear of i64 overflow.
pub(crate) const MAX_OFFSET: i64 = i64::MAX / 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AccessKind {
    Read,
    Write,
}

pub(crate) enum AccessBuf<'a> {
    Rd(&'a mut [u8]),
    Wr(&'a [u8]),
}

impl AccessBuf<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            AccessBuf::Rd(b) => b.len(),
            AccessBuf::Wr(b) => b.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct FileArg {
    pub offset: i64,
    pub nbyte: i64,
}

/// Per-segment access layout for one logical read or write.
#[derive(Clone, Debug)]
pub(crate) struct StripePlan {
    pub seg_first: usize,
    pub seg_access: usize,
    /// Indexed by segment number; only touched entries are meaningful.
    pub vbuf: Vec<VbufSpec>,
    pub farg: Vec<FileArg>,
}

fn filler() -> VbufSpec {
    VbufSpec {
        blksz: 1,
        stride: 1,
        first_off: 0,
        firstblk_netsz: 0,
    }
}

impl StripePlan {
    /// Striping arithmetic for the linear (global/independent) views.
    pub(crate) fn linear(eoff: i64, nbyte: i64, su_sz: i64, seg_cnt: usize) -> StripePlan {
        let segs = seg_cnt as i64;
        let su_off_first = eoff % su_sz;
        let sz_first = nbyte.min(su_sz - su_off_first);
        let (su_access, sz_last) = if nbyte - sz_first == 0 {
            (1, sz_first)
        } else {
            let rem = (nbyte - sz_first) % su_sz;
            (
                2 + (nbyte - sz_first - 1) / su_sz,
                if rem == 0 { su_sz } else { rem },
            )
        };
        let seg_access = segs.min(su_access) as usize;
        let seg_of_first = ((eoff / su_sz) % segs) as usize;
        let seg_of_last = ((seg_of_first as i64 + su_access - 1) % segs) as usize;

        let mut vbuf = vec![filler(); seg_cnt];
        let mut farg = vec![FileArg::default(); seg_cnt];
        let mut segnmbr = seg_of_first;
        let mut foff_base = (eoff / (su_sz * segs)) * su_sz;
        let mut bufptr = 0i64;
        for i in 0..seg_access {
            let netsz = if i == 0 { su_sz - su_off_first } else { su_sz };
            vbuf[segnmbr] = VbufSpec {
                blksz: su_sz,
                stride: segs,
                first_off: bufptr,
                firstblk_netsz: netsz,
            };
            bufptr += netsz;

            // Stripe units this access touches in this segment file.
            let su_seg_touch = 1 + (su_access - 1 - i as i64) / segs;

            let offset = if i == 0 {
                foff_base + su_off_first
            } else {
                foff_base
            };
            let nbyte_seg = if su_seg_touch == 1 {
                if segnmbr == seg_of_first {
                    sz_first
                } else if segnmbr == seg_of_last {
                    sz_last
                } else {
                    su_sz
                }
            } else {
                let head = if segnmbr == seg_of_first { sz_first } else { su_sz };
                let tail = if segnmbr == seg_of_last { sz_last } else { su_sz };
                head + tail + (su_seg_touch - 2) * su_sz
            };
            farg[segnmbr] = FileArg {
                offset,
                nbyte: nbyte_seg,
            };

            segnmbr = (segnmbr + 1) % seg_cnt;
            if segnmbr == 0 {
                // Stripe-unit wraparound.
                foff_base += su_sz;
            }
        }
        StripePlan {
            seg_first: seg_of_first,
            seg_access,
            vbuf,
            farg,
        }
    }

    /// The segmented view touches exactly one segment, contiguously.
    pub(crate) fn segmented(seg_cnt: usize, seg: usize, eoff: i64, nbyte: i64) -> StripePlan {
        let mut vbuf = vec![filler(); seg_cnt];
        let mut farg = vec![FileArg::default(); seg_cnt];
        vbuf[seg] = VbufSpec::contiguous(0, nbyte);
        farg[seg] = FileArg {
            offset: eoff,
            nbyte,
        };
        StripePlan {
            seg_first: seg,
            seg_access: 1,
            vbuf,
            farg,
        }
    }
}

/// Effective bytes transferred by a linear access, given the per-segment
/// byte counts the servers accepted: the longest full stripe accepted by
/// every touched segment, plus the residuals in segment-major order up to
/// the first short segment, minus the offset into the first stripe unit.
pub(crate) fn effective_bytes(
    eoff: i64,
    su_sz: i64,
    seg_cnt: usize,
    seg_first: usize,
    seg_access: usize,
    seg_byte: &[i64],
) -> i64 {
    let su_off_first = eoff % su_sz;
    let full_stripe = if seg_access < seg_cnt {
        0
    } else {
        let mut fs = (seg_byte[seg_first] + su_off_first) / su_sz;
        for (i, n) in seg_byte.iter().enumerate() {
            if i != seg_first {
                fs = fs.min(n / su_sz);
            }
        }
        fs
    };
    let mut rembyte = 0;
    let mut segnmbr = seg_first;
    for i in 0..seg_access {
        let part = if i == 0 {
            (seg_byte[segnmbr] + su_off_first - full_stripe * su_sz).min(su_sz)
        } else {
            (seg_byte[segnmbr] - full_stripe * su_sz).min(su_sz)
        };
        rembyte += part;
        if part < su_sz {
            break;
        }
        segnmbr = (segnmbr + 1) % seg_cnt;
    }
    full_stripe * seg_cnt as i64 * su_sz + rembyte - su_off_first
}

impl<T: Transport> Pious<T> {
    pub(crate) fn sn_postincr(&mut self, idx: usize) -> i32 {
        let ts = self.tstates[idx].as_mut().unwrap();
        let sn = ts.transsn;
        ts.transsn += 1;
        sn
    }

    pub(crate) fn sn_peek(&self, idx: usize) -> i32 {
        self.tstates[idx].as_ref().unwrap().transsn
    }

    pub(crate) fn sn_reset(&mut self, idx: usize) {
        self.tstates[idx].as_mut().unwrap().transsn = 0;
    }

    /// Generic access underlying every read and write variant. Returns the
    /// effective byte count and the effective starting offset.
    pub(crate) fn access_generic(
        &mut self,
        kind: AccessKind,
        fd: Fd,
        buf: &mut AccessBuf<'_>,
        offset: Option<i64>,
    ) -> Outcome<(i64, i64)> {
        let entry = self
            .files
            .get(fd)
            .and_then(|e| e.as_ref())
            .ok_or(StatusCode::BadFile)?;
        if let Some(o) = offset {
            if !(0..=MAX_OFFSET).contains(&o) {
                return Err(StatusCode::Inval);
            }
        }
        if let Some(ut) = &self.utrans {
            // A user transaction and the files it touches must agree on
            // fault tolerance.
            if entry.faultmode != ut.faultmode {
                return Err(StatusCode::Perm);
            }
        }
        match (kind, entry.access) {
            (AccessKind::Read, AccessMode::WrOnly) | (AccessKind::Write, AccessMode::RdOnly) => {
                return Err(StatusCode::BadFile)
            }
            _ => {}
        }

        let view = entry.view;
        let map = entry.map;
        let faultmode = entry.faultmode;
        let seg_cnt = entry.pfinfo.seg_cnt;
        let pds_id = entry.pfinfo.pds_id.clone();
        let seg_fh = entry.pfinfo.seg_fhandle.clone();
        let sptr_fh = entry.pfinfo.sptr_fhandle;
        let sptr_idx = entry.pfinfo.sptr_idx;
        let tstate = entry.tstate.clone();
        let local_offset = entry.offset;

        // STEP 1: transaction identity and per-server operation state.
        let utrans_active = self.utrans.is_some();
        let transid = if let Some(ut) = &self.utrans {
            let id = ut.id;
            self.files[fd].as_mut().unwrap().utrans_access = true;
            id
        } else {
            // Independent access: reset this file's per-server sequence
            // state, then pick an id, preferring one the servers aborted.
            for &i in &tstate {
                self.sn_reset(i);
            }
            match self.reuse.take() {
                Some(id) => id,
                None => self.clock.assign(),
            }
        };

        let mut aerr: Option<StatusCode> = None;

        // STEP 2: effective offset, and byte count clamped against it.
        let nbyte_orig = buf.len() as i64;
        let mut nbyte = nbyte_orig;
        let mut eoff = 0i64;
        match offset {
            Some(o) => eoff = o,
            None if view != View::Global => eoff = local_offset,
            None => {
                // Reserve nbyte on the shared pointer up front; if fewer
                // bytes transfer, the pointer is rewritten below. This saves
                // a message in the common full-transfer case.
                let sn = self.sn_postincr(tstate[0]);
                match client::fa_sint(
                    &self.tp,
                    pds_id[0],
                    transid,
                    sn,
                    sptr_fh,
                    sptr_idx,
                    nbyte,
                ) {
                    Ok(v) => eoff = v,
                    Err(sc) => {
                        if sc == StatusCode::Abort {
                            self.sn_reset(tstate[0]);
                        }
                        aerr = Some(sc);
                    }
                }
            }
        }
        if aerr.is_none() {
            if eoff < 0 {
                aerr = Some(StatusCode::Unxp);
            } else if MAX_OFFSET - eoff < nbyte {
                nbyte = MAX_OFFSET - eoff;
            }
        }

        // STEP 3: per-segment access layout.
        let plan = if aerr.is_none() && nbyte > 0 {
            Some(match view {
                View::Segmented => StripePlan::segmented(seg_cnt, map as usize, eoff, nbyte),
                _ => StripePlan::linear(eoff, nbyte, map, seg_cnt),
            })
        } else {
            None
        };

        // STEP 4: pipeline the per-segment operations across the servers.
        let mut seg_byte = vec![0i64; seg_cnt];
        if let Some(plan) = &plan {
            if aerr.is_none() {
                aerr = self.pipeline(
                    kind, buf, plan, transid, &pds_id, &seg_fh, &tstate, &mut seg_byte,
                );
            }
        }

        // STEP 5: effective byte count; rewrite the shared pointer if the
        // reservation was wrong.
        let mut ebyte = 0i64;
        if aerr.is_none() {
            if nbyte == 0 {
                ebyte = 0;
            } else if view == View::Segmented {
                ebyte = seg_byte[map as usize];
            } else {
                let plan = plan.as_ref().unwrap();
                ebyte = effective_bytes(
                    eoff,
                    map,
                    seg_cnt,
                    plan.seg_first,
                    plan.seg_access,
                    &seg_byte,
                );
            }
            if offset.is_none() && view == View::Global && ebyte != nbyte_orig {
                let sn = self.sn_postincr(tstate[0]);
                match client::write_sint(
                    &self.tp,
                    pds_id[0],
                    transid,
                    sn,
                    sptr_fh,
                    sptr_idx,
                    &[eoff + ebyte],
                ) {
                    Ok(1) => {}
                    Ok(_) => aerr = Some(StatusCode::Unxp),
                    Err(sc) => {
                        if sc == StatusCode::Abort {
                            self.sn_reset(tstate[0]);
                        }
                        aerr = Some(sc);
                    }
                }
            }
        }

        // STEP 6: close out an independent transaction.
        if !utrans_active {
            if aerr.is_none() && faultmode == FaultMode::Stable {
                aerr = self.prepare_all(transid, &tstate);
            }
            if aerr.is_none() {
                match self.commit_all(transid, &tstate) {
                    None | Some(StatusCode::NotLog) => {}
                    Some(sc) => {
                        self.badstate = true;
                        aerr = Some(sc);
                    }
                }
            } else {
                match self.abort_all(transid, &tstate) {
                    None | Some(StatusCode::NotLog) => {}
                    Some(_) => self.badstate = true,
                }
            }
        }

        // STEP 7: fold the outcome.
        match aerr {
            None => {
                if offset.is_none() && view != View::Global {
                    // Shared pointers were updated inside the transaction;
                    // local pointers move here.
                    self.files[fd].as_mut().unwrap().offset += ebyte;
                }
                Ok((ebyte, eoff))
            }
            Some(sc) => {
                if sc == StatusCode::Abort {
                    self.reuse = Some(transid);
                }
                match sc {
                    StatusCode::Abort
                    | StatusCode::Insuf
                    | StatusCode::Timeout
                    | StatusCode::Tport
                    | StatusCode::Fatal => Err(sc),
                    StatusCode::BadFile | StatusCode::SrcDest | StatusCode::Proto => {
                        warn!(target: "pious", "protocol-class failure; latching bad state");
                        self.badstate = true;
                        Err(StatusCode::Unxp)
                    }
                    _ => Err(StatusCode::Unxp),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline(
        &mut self,
        kind: AccessKind,
        buf: &mut AccessBuf<'_>,
        plan: &StripePlan,
        transid: TransId,
        pds_id: &[SrcDest],
        seg_fh: &[FHandle],
        tstate: &[usize],
        seg_byte: &mut [i64],
    ) -> Option<StatusCode> {
        let seg_cnt = plan.vbuf.len();
        let pds_cnt = pds_id.len();
        let phase_cnt = if seg_cnt % pds_cnt == 0 || plan.seg_first + plan.seg_access <= seg_cnt {
            1
        } else {
            2
        };
        let mut aerr: Option<StatusCode> = None;
        let mut stop_early = false;
        for phase in 0..phase_cnt {
            if aerr.is_some() || stop_early {
                break;
            }
            let (phase_first, phase_access) = if phase_cnt == 1 {
                (plan.seg_first, plan.seg_access)
            } else if phase == 0 {
                (plan.seg_first, seg_cnt - plan.seg_first)
            } else {
                (0, plan.seg_access - (seg_cnt - plan.seg_first))
            };

            let mut seg_send = phase_first;
            let mut seg_recv = phase_first;
            let mut sendcnt = 0usize;
            let mut recvcnt = 0usize;
            let fill = pds_cnt.min(phase_access);

            // Fill the pipe.
            for _ in 0..fill {
                if aerr.is_some() {
                    break;
                }
                match self.pipe_send(kind, buf, plan, transid, pds_id, seg_fh, tstate, seg_send) {
                    Ok(()) => {
                        sendcnt += 1;
                        seg_send = (seg_send + 1) % seg_cnt;
                    }
                    Err(sc) => aerr = Some(sc),
                }
            }

            // Steady state: alternate receive and send.
            for _ in 0..phase_access.saturating_sub(fill) {
                if aerr.is_some() || stop_early {
                    break;
                }
                let stop_sz = plan.vbuf[seg_recv].firstblk_netsz;
                match self.pipe_recv(kind, buf, plan, transid, pds_id, tstate, seg_recv) {
                    Ok(n) => {
                        seg_byte[seg_recv] = n;
                        recvcnt += 1;
                        seg_recv = (seg_recv + 1) % seg_cnt;
                        if n < stop_sz {
                            // Not even the first stripe unit came through;
                            // no later segment can hold data either.
                            stop_early = true;
                        } else {
                            match self.pipe_send(
                                kind, buf, plan, transid, pds_id, seg_fh, tstate, seg_send,
                            ) {
                                Ok(()) => {
                                    sendcnt += 1;
                                    seg_send = (seg_send + 1) % seg_cnt;
                                }
                                Err(sc) => aerr = Some(sc),
                            }
                        }
                    }
                    Err(sc) => {
                        recvcnt += 1;
                        seg_recv = (seg_recv + 1) % seg_cnt;
                        aerr = Some(sc);
                    }
                }
            }

            // Drain the pipe.
            for _ in 0..fill {
                if aerr.is_some() || stop_early {
                    break;
                }
                match self.pipe_recv(kind, buf, plan, transid, pds_id, tstate, seg_recv) {
                    Ok(n) => seg_byte[seg_recv] = n,
                    Err(sc) => aerr = Some(sc),
                }
                recvcnt += 1;
                seg_recv = (seg_recv + 1) % seg_cnt;
            }

            // Consume any replies still outstanding after an early stop or
            // an error; keep the first error encountered.
            while recvcnt < sendcnt {
                match self.pipe_recv(kind, buf, plan, transid, pds_id, tstate, seg_recv) {
                    Ok(n) => seg_byte[seg_recv] = n,
                    Err(sc) => {
                        if aerr.is_none() {
                            aerr = Some(sc);
                        }
                    }
                }
                recvcnt += 1;
                seg_recv = (seg_recv + 1) % seg_cnt;
            }
        }
        aerr
    }

    #[allow(clippy::too_many_arguments)]
    fn pipe_send(
        &mut self,
        kind: AccessKind,
        buf: &mut AccessBuf<'_>,
        plan: &StripePlan,
        transid: TransId,
        pds_id: &[SrcDest],
        seg_fh: &[FHandle],
        tstate: &[usize],
        seg: usize,
    ) -> Outcome<()> {
        let server = seg % pds_id.len();
        let sn = self.sn_postincr(tstate[server]);
        let farg = plan.farg[seg];
        match kind {
            AccessKind::Read => client::read_send(
                &self.tp,
                pds_id[server],
                transid,
                sn,
                seg_fh[seg],
                farg.offset,
                farg.nbyte,
                LockKind::Read,
            ),
            AccessKind::Write => {
                let data = match buf {
                    AccessBuf::Wr(b) => plan.vbuf[seg].gather(b, farg.nbyte),
                    AccessBuf::Rd(_) => return Err(StatusCode::Unxp),
                };
                client::write_send(
                    &self.tp,
                    pds_id[server],
                    transid,
                    sn,
                    seg_fh[seg],
                    farg.offset,
                    data,
                )
            }
        }
    }

    fn pipe_recv(
        &mut self,
        kind: AccessKind,
        buf: &mut AccessBuf<'_>,
        plan: &StripePlan,
        transid: TransId,
        pds_id: &[SrcDest],
        tstate: &[usize],
        seg: usize,
    ) -> Outcome<i64> {
        let server = seg % pds_id.len();
        let sn = self.sn_peek(tstate[server]) - 1;
        let r = match kind {
            AccessKind::Read => {
                client::read_recv(&self.tp, pds_id[server], transid, sn).map(|(n, data)| {
                    if let AccessBuf::Rd(b) = buf {
                        plan.vbuf[seg].scatter(b, &data);
                    }
                    n
                })
            }
            AccessKind::Write => client::write_recv(&self.tp, pds_id[server], transid, sn),
        };
        if r == Err(StatusCode::Abort) {
            self.sn_reset(tstate[server]);
        }
        r
    }

    /// Seek underlying pious_lseek; separate so aborted global-view seeks
    /// can be retried by the caller.
    pub(crate) fn lseek_proxy(&mut self, fd: Fd, offset: i64, whence: Whence) -> Outcome<i64> {
        let entry = self
            .files
            .get(fd)
            .and_then(|e| e.as_ref())
            .ok_or(StatusCode::BadFile)?;
        if offset.abs() > MAX_OFFSET || (whence == Whence::Set && offset < 0) {
            return Err(StatusCode::Inval);
        }

        if entry.view != View::Global {
            // Local pointer update only.
            let entry = self.files[fd].as_mut().unwrap();
            return match whence {
                Whence::Set => {
                    entry.offset = offset;
                    Ok(offset)
                }
                Whence::Cur => {
                    if (offset >= 0 && MAX_OFFSET - offset - entry.offset >= 0)
                        || (offset < 0 && entry.offset + offset >= 0)
                    {
                        entry.offset += offset;
                        Ok(entry.offset)
                    } else {
                        Err(StatusCode::Inval)
                    }
                }
            };
        }

        let pds0 = entry.pfinfo.pds_id[0];
        let sptr_fh = entry.pfinfo.sptr_fhandle;
        let sptr_idx = entry.pfinfo.sptr_idx;
        let ts0 = entry.tstate[0];
        let tstate = entry.tstate.clone();

        let utrans_active = self.utrans.is_some();
        let transid = if let Some(ut) = &self.utrans {
            let id = ut.id;
            self.files[fd].as_mut().unwrap().utrans_access = true;
            id
        } else {
            for &i in &tstate {
                self.sn_reset(i);
            }
            match self.reuse.take() {
                Some(id) => id,
                None => self.clock.assign(),
            }
        };

        let mut aerr: Option<StatusCode> = None;
        let mut bad_value = false;
        let mut new_cur = 0i64;
        match whence {
            Whence::Set => {
                let sn = self.sn_postincr(ts0);
                match client::write_sint(
                    &self.tp,
                    pds0,
                    transid,
                    sn,
                    sptr_fh,
                    sptr_idx,
                    &[offset],
                ) {
                    Ok(1) => new_cur = offset,
                    Ok(_) => aerr = Some(StatusCode::Unxp),
                    Err(sc) => {
                        if sc == StatusCode::Abort {
                            self.sn_reset(ts0);
                        }
                        aerr = Some(sc);
                    }
                }
            }
            Whence::Cur => {
                let sn = self.sn_postincr(ts0);
                match client::fa_sint(&self.tp, pds0, transid, sn, sptr_fh, sptr_idx, offset) {
                    Ok(cur) => {
                        if (offset >= 0 && MAX_OFFSET - offset - cur >= 0)
                            || (offset < 0 && cur + offset >= 0)
                        {
                            new_cur = cur + offset;
                        } else {
                            // The transaction aborts below; the updated
                            // pointer value would be out of range.
                            bad_value = true;
                        }
                    }
                    Err(sc) => {
                        if sc == StatusCode::Abort {
                            self.sn_reset(ts0);
                        }
                        aerr = Some(sc);
                    }
                }
            }
        }

        if !utrans_active {
            if aerr.is_none() && !bad_value {
                if let Some(sc) = self.commit_all(transid, &tstate) {
                    self.badstate = true;
                    aerr = Some(sc);
                }
            } else if self.abort_all(transid, &tstate).is_some() {
                self.badstate = true;
            }
        }

        match aerr {
            None => {
                if bad_value {
                    return Err(StatusCode::Inval);
                }
                self.files[fd].as_mut().unwrap().offset = new_cur;
                Ok(new_cur)
            }
            Some(sc) => {
                if sc == StatusCode::Abort {
                    self.reuse = Some(transid);
                }
                match sc {
                    StatusCode::Abort
                    | StatusCode::Insuf
                    | StatusCode::Timeout
                    | StatusCode::Tport
                    | StatusCode::Fatal => Err(sc),
                    StatusCode::BadFile | StatusCode::SrcDest | StatusCode::Proto => {
                        self.badstate = true;
                        Err(StatusCode::Unxp)
                    }
                    _ => Err(StatusCode::Unxp),
                }
            }
        }
    }

    /// Send a prepare to every server that participated in `transid` (those
    /// with a nonzero next sequence number). Servers voting abort or
    /// read-only need no commit and are marked done.
    pub(crate) fn prepare_all(&mut self, transid: TransId, idxs: &[usize]) -> Option<StatusCode> {
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 {
                let sn = ts.transsn;
                ts.transsn += 1;
                let pdsid = ts.pdsid;
                ts.rcode = match client::prepare_send(&self.tp, pdsid, transid, sn) {
                    Ok(()) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 && ts.rcode == 0 {
                let pdsid = ts.pdsid;
                let sn = ts.transsn - 1;
                ts.rcode = match client::prepare_recv(&self.tp, pdsid, transid, sn) {
                    Ok(true) => StatusCode::ReadOnly.rcode(),
                    Ok(false) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        let mut pcode = 0i64;
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 {
                // Abort is the only acceptable failure, and a later real
                // error supersedes it.
                if (pcode == 0 || pcode == StatusCode::Abort.rcode()) && ts.rcode < 0 {
                    pcode = ts.rcode;
                }
                if ts.rcode == StatusCode::ReadOnly.rcode()
                    || ts.rcode == StatusCode::Abort.rcode()
                {
                    ts.transsn = 0;
                }
            }
        }
        fold_2pc(pcode, &[StatusCode::Abort])
    }

    pub(crate) fn commit_all(&mut self, transid: TransId, idxs: &[usize]) -> Option<StatusCode> {
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 {
                let pdsid = ts.pdsid;
                let sn = ts.transsn;
                ts.rcode = match client::commit_send(&self.tp, pdsid, transid, sn) {
                    Ok(()) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 && ts.rcode == 0 {
                let pdsid = ts.pdsid;
                let sn = ts.transsn;
                ts.rcode = match client::commit_recv(&self.tp, pdsid, transid, sn) {
                    Ok(()) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        let mut ccode = 0i64;
        for &i in idxs {
            let ts = self.tstates[i].as_ref().unwrap();
            if !(ccode == 0 || ccode == StatusCode::NotLog.rcode()) {
                break;
            }
            if ts.transsn > 0 && ts.rcode < 0 {
                ccode = ts.rcode;
            }
        }
        fold_2pc(ccode, &[StatusCode::NotLog])
    }

    pub(crate) fn abort_all(&mut self, transid: TransId, idxs: &[usize]) -> Option<StatusCode> {
        debug!(target: "pious", "aborting transaction at participating servers");
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 {
                let pdsid = ts.pdsid;
                ts.rcode = match client::abort_send(&self.tp, pdsid, transid) {
                    Ok(()) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        for &i in idxs {
            let ts = self.tstates[i].as_mut().unwrap();
            if ts.transsn > 0 && ts.rcode == 0 {
                let pdsid = ts.pdsid;
                ts.rcode = match client::abort_recv(&self.tp, pdsid, transid) {
                    Ok(()) => 0,
                    Err(sc) => sc.rcode(),
                };
            }
        }
        let mut acode = 0i64;
        for &i in idxs {
            let ts = self.tstates[i].as_ref().unwrap();
            if !(acode == 0 || acode == StatusCode::NotLog.rcode()) {
                break;
            }
            if ts.transsn > 0 && ts.rcode < 0 {
                acode = ts.rcode;
            }
        }
        fold_2pc(acode, &[StatusCode::NotLog])
    }
}

/// Fold a two-phase-commit round's first error: `None` when clean, the
/// first error otherwise, with unclassifiable codes collapsed to `Unxp`.
/// `tolerated` codes pass through unchanged for the caller to interpret.
fn fold_2pc(code: i64, tolerated: &[StatusCode]) -> Option<StatusCode> {
    if code == 0 {
        return None;
    }
    match StatusCode::from_rcode(code) {
        Some(sc)
            if tolerated.contains(&sc)
                || matches!(
                    sc,
                    StatusCode::SrcDest
                        | StatusCode::Insuf
                        | StatusCode::Tport
                        | StatusCode::Timeout
                        | StatusCode::Proto
                        | StatusCode::Fatal
                ) =>
        {
            Some(sc)
        }
        _ => Some(StatusCode::Unxp),
    }
}
