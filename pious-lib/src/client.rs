// Per-server RPC stubs. Transaction operations come in non-blocking-send /
// blocking-receive pairs so the access engine can keep one request
// outstanding at each server of a pipeline; control operations are simple
// blocking calls matched by cmsgid.
//
// A client obeying the protocol has at most one outstanding transaction
// operation and one outstanding control operation of a given type per
// server, so replies that do not match the awaited (transid, transsn) or
// (op, cmsgid) are no longer of interest and are discarded here.

use pious_base::{FHandle, StatusCode, TransId};
use pious_msg::{
    CntrlReply, CntrlReplyBody, CntrlReq, CntrlReqBody, CreateFlag, LockKind, Op, Reply, Request,
    SrcDest, TransReply, TransReplyBody, TransReq, TransReqBody, Transport,
};
use std::time::Duration;

pub(crate) type Outcome<T> = std::result::Result<T, StatusCode>;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn rcode_err(rcode: i64) -> StatusCode {
    StatusCode::from_rcode(rcode).unwrap_or(StatusCode::Unxp)
}

fn send_req<T: Transport>(tp: &T, pdsid: SrcDest, req: Request) -> Outcome<()> {
    let tag = req.op().tag();
    let bytes = req.encode().map_err(|_| StatusCode::Unxp)?;
    tp.send(pdsid, tag, bytes).map_err(|_| StatusCode::Tport)
}

fn send_trans<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    body: TransReqBody,
) -> Outcome<()> {
    send_req(
        tp,
        pdsid,
        Request::Trans(TransReq {
            transid,
            transsn,
            body,
        }),
    )
}

fn recv_trans<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    op: Op,
    transid: TransId,
    transsn: i32,
) -> Outcome<TransReply> {
    loop {
        let env = tp
            .recv(Some(pdsid), Some(op.tag()), Some(REPLY_TIMEOUT))
            .map_err(|_| StatusCode::Tport)?
            .ok_or(StatusCode::Timeout)?;
        match Reply::decode(&env.bytes) {
            Ok(Reply::Trans(rep)) if rep.transid == transid && rep.transsn == transsn => {
                return Ok(rep)
            }
            Ok(_) => continue,
            Err(_) => return Err(StatusCode::Tport),
        }
    }
}

fn recv_cntrl<T: Transport>(tp: &T, pdsid: SrcDest, op: Op, cmsgid: i32) -> Outcome<CntrlReply> {
    loop {
        let env = tp
            .recv(Some(pdsid), Some(op.tag()), Some(REPLY_TIMEOUT))
            .map_err(|_| StatusCode::Tport)?
            .ok_or(StatusCode::Timeout)?;
        match Reply::decode(&env.bytes) {
            Ok(Reply::Cntrl(rep)) if rep.cmsgid == cmsgid => return Ok(rep),
            Ok(_) => continue,
            Err(_) => return Err(StatusCode::Tport),
        }
    }
}

// ---- transaction operations ----

pub(crate) fn read_send<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    nbyte: i64,
    lock: LockKind,
) -> Outcome<()> {
    send_trans(
        tp,
        pdsid,
        transid,
        transsn,
        TransReqBody::Read {
            fhandle,
            offset,
            nbyte,
            lock,
        },
    )
}

pub(crate) fn read_recv<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<(i64, Vec<u8>)> {
    let rep = recv_trans(tp, pdsid, Op::Read, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    match rep.body {
        TransReplyBody::Read(data) => Ok((rep.rcode, data)),
        _ => Err(StatusCode::Proto),
    }
}

pub(crate) fn write_send<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    data: Vec<u8>,
) -> Outcome<()> {
    send_trans(
        tp,
        pdsid,
        transid,
        transsn,
        TransReqBody::Write {
            fhandle,
            offset,
            data,
        },
    )
}

pub(crate) fn write_recv<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<i64> {
    let rep = recv_trans(tp, pdsid, Op::Write, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(rep.rcode)
}

/// Blocking byte read, for single-server callers like the resolver.
pub(crate) fn read<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    nbyte: i64,
    lock: LockKind,
) -> Outcome<(i64, Vec<u8>)> {
    read_send(tp, pdsid, transid, transsn, fhandle, offset, nbyte, lock)?;
    read_recv(tp, pdsid, transid, transsn)
}

pub(crate) fn write<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    data: Vec<u8>,
) -> Outcome<i64> {
    write_send(tp, pdsid, transid, transsn, fhandle, offset, data)?;
    write_recv(tp, pdsid, transid, transsn)
}

pub(crate) fn read_sint<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    nint: i64,
) -> Outcome<Vec<i64>> {
    send_trans(
        tp,
        pdsid,
        transid,
        transsn,
        TransReqBody::ReadSint {
            fhandle,
            offset,
            nint,
        },
    )?;
    let rep = recv_trans(tp, pdsid, Op::ReadSint, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    match rep.body {
        TransReplyBody::ReadSint(vals) => Ok(vals),
        _ => Err(StatusCode::Proto),
    }
}

pub(crate) fn write_sint_send<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    vals: &[i64],
) -> Outcome<()> {
    send_trans(
        tp,
        pdsid,
        transid,
        transsn,
        TransReqBody::WriteSint {
            fhandle,
            offset,
            vals: vals.to_vec(),
        },
    )
}

pub(crate) fn write_sint<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    vals: &[i64],
) -> Outcome<i64> {
    write_sint_send(tp, pdsid, transid, transsn, fhandle, offset, vals)?;
    let rep = recv_trans(tp, pdsid, Op::WriteSint, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(rep.rcode)
}

/// Fetch-and-add on a signed-integer slot; returns the pre-increment value.
pub(crate) fn fa_sint<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
    fhandle: FHandle,
    offset: i64,
    increment: i64,
) -> Outcome<i64> {
    send_trans(
        tp,
        pdsid,
        transid,
        transsn,
        TransReqBody::FaSint {
            fhandle,
            offset,
            increment,
        },
    )?;
    let rep = recv_trans(tp, pdsid, Op::FaSint, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    match rep.body {
        TransReplyBody::FaSint(v) => Ok(v),
        _ => Err(StatusCode::Proto),
    }
}

pub(crate) fn prepare_send<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<()> {
    send_trans(tp, pdsid, transid, transsn, TransReqBody::Prepare)
}

/// Prepare result: `Ok(true)` is the read-only vote, `Ok(false)` a regular
/// vote to commit; `Err(Abort)` is a vote to abort.
pub(crate) fn prepare_recv<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<bool> {
    let rep = recv_trans(tp, pdsid, Op::Prepare, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(rep.rcode == StatusCode::ReadOnly.rcode())
}

pub(crate) fn commit_send<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<()> {
    send_trans(tp, pdsid, transid, transsn, TransReqBody::Commit)
}

pub(crate) fn commit_recv<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<()> {
    let rep = recv_trans(tp, pdsid, Op::Commit, transid, transsn)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(())
}

pub(crate) fn commit<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    transid: TransId,
    transsn: i32,
) -> Outcome<()> {
    commit_send(tp, pdsid, transid, transsn)?;
    commit_recv(tp, pdsid, transid, transsn)
}

pub(crate) fn abort_send<T: Transport>(tp: &T, pdsid: SrcDest, transid: TransId) -> Outcome<()> {
    send_trans(tp, pdsid, transid, 0, TransReqBody::Abort)
}

pub(crate) fn abort_recv<T: Transport>(tp: &T, pdsid: SrcDest, transid: TransId) -> Outcome<()> {
    let rep = recv_trans(tp, pdsid, Op::Abort, transid, 0)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(())
}

pub(crate) fn abort<T: Transport>(tp: &T, pdsid: SrcDest, transid: TransId) -> Outcome<()> {
    abort_send(tp, pdsid, transid)?;
    abort_recv(tp, pdsid, transid)
}

// ---- control operations ----

fn cntrl<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    cmsgid: i32,
    body: CntrlReqBody,
) -> Outcome<CntrlReply> {
    let op = body.op();
    send_req(tp, pdsid, Request::Cntrl(CntrlReq { cmsgid, body }))?;
    let rep = recv_cntrl(tp, pdsid, op, cmsgid)?;
    if rep.rcode < 0 {
        return Err(rcode_err(rep.rcode));
    }
    Ok(rep)
}

pub(crate) fn lookup<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    cmsgid: i32,
    path: &str,
    cflag: CreateFlag,
    mode: u32,
) -> Outcome<(FHandle, i32)> {
    let rep = cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Lookup {
            path: path.to_string(),
            cflag,
            mode,
        },
    )?;
    match rep.body {
        CntrlReplyBody::Lookup { fhandle, amode } => Ok((fhandle, amode)),
        _ => Err(StatusCode::Proto),
    }
}

pub(crate) fn mkdir<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    cmsgid: i32,
    path: &str,
    mode: u32,
) -> Outcome<()> {
    cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Mkdir {
            path: path.to_string(),
            mode,
        },
    )
    .map(|_| ())
}

pub(crate) fn rmdir<T: Transport>(tp: &T, pdsid: SrcDest, cmsgid: i32, path: &str) -> Outcome<()> {
    cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Rmdir {
            path: path.to_string(),
        },
    )
    .map(|_| ())
}

pub(crate) fn unlink<T: Transport>(tp: &T, pdsid: SrcDest, cmsgid: i32, path: &str) -> Outcome<()> {
    cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Unlink {
            path: path.to_string(),
        },
    )
    .map(|_| ())
}

pub(crate) fn chmod<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    cmsgid: i32,
    path: &str,
    mode: u32,
) -> Outcome<()> {
    cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Chmod {
            path: path.to_string(),
            mode,
        },
    )
    .map(|_| ())
}

pub(crate) fn stat<T: Transport>(
    tp: &T,
    pdsid: SrcDest,
    cmsgid: i32,
    path: &str,
) -> Outcome<u32> {
    let rep = cntrl(
        tp,
        pdsid,
        cmsgid,
        CntrlReqBody::Stat {
            path: path.to_string(),
        },
    )?;
    match rep.body {
        CntrlReplyBody::Stat { mode } => Ok(mode),
        _ => Err(StatusCode::Proto),
    }
}

pub(crate) fn ping<T: Transport>(tp: &T, pdsid: SrcDest, cmsgid: i32) -> Outcome<()> {
    cntrl(tp, pdsid, cmsgid, CntrlReqBody::Ping).map(|_| ())
}

pub(crate) fn shutdown<T: Transport>(tp: &T, pdsid: SrcDest, cmsgid: i32) -> Outcome<()> {
    cntrl(tp, pdsid, cmsgid, CntrlReqBody::Shutdown).map(|_| ())
}
