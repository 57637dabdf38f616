// Parafile resolution: name -> {server endpoints, segment handles, striping
// parameters}. The service coordinator proper is an external collaborator;
// the library consumes this pure interface, and DirectResolver implements it
// straight against the data servers.
//
// On-disk layout, per server hosting part of a parafile:
//
//   path/                directory, mode 0755
//     .metadata          i64 slots {extant, pds_cnt, seg_cnt}, mode 0644
//     .sharptr           i64 shared-pointer slots, one per group, mode 0666
//     .groups            group-name registry; line N names slot N, mode 0666
//     segment.N          data segments hosted here, user-selected mode
//
// Creation writes the metadata with extant = false, builds every component,
// then rewrites extant = true; unlink flips extant to false before removing
// anything. A parafile is extant iff the flag says so, which makes partial
// creates and unlinks detectable.

use crate::client::{self, Outcome};
use crate::{DsInfo, OpenSpec};
use pious_base::{FHandle, StatusCode, SysConfig, TidClock, TransId};
use pious_msg::{CreateFlag, LockKind, SrcDest, Transport};
use std::time::{Duration, Instant};
use tracing::debug;

const METADATA_FNAME: &str = ".metadata";
const SHARPTR_FNAME: &str = ".sharptr";
const GROUPS_FNAME: &str = ".groups";

const PF_DIR_PERM: u32 = 0o755;
const METADATA_PERM: u32 = 0o644;
const SHARPTR_PERM: u32 = 0o666;

/// Bound on the group registry; reading it under a write lock of this size
/// serializes concurrent opens of one parafile.
const GROUPS_MAX: i64 = 65536;

/// Everything the access engine needs to know about an open parafile.
#[derive(Clone, Debug)]
pub struct ParafileInfo {
    /// Degree of declustering; seg_cnt >= pds_cnt >= 1.
    pub pds_cnt: usize,
    pub seg_cnt: usize,
    pub sptr_fhandle: FHandle,
    /// This group's slot in the shared-pointer file.
    pub sptr_idx: i64,
    pub seg_fhandle: Vec<FHandle>,
    pub pds_id: Vec<SrcDest>,
    /// Accessibility over all segment files: R_OK | W_OK bits.
    pub amode: i32,
}

pub trait Resolver {
    fn open<T: Transport>(
        &mut self,
        tp: &T,
        spec: &OpenSpec,
        path: &str,
        mode: u32,
    ) -> Outcome<ParafileInfo>;

    fn unlink<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str) -> Outcome<()>;

    fn chmod<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str, mode: u32)
        -> Outcome<()>;

    fn mkdir<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str, mode: u32)
        -> Outcome<()>;

    fn rmdir<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str) -> Outcome<()>;
}

type MemoKey = (String, OpenSpec, u32);

/// Resolution straight against the data servers, with the most recent
/// result retained for a bounded window so the identical requests a
/// same-program-multiple-data application fires in bursts are answered
/// without re-execution.
pub struct DirectResolver {
    result_valid: Duration,
    retry_max: u32,
    recent: Option<(MemoKey, ParafileInfo, Instant)>,
    cmsgid: i32,
    clock: TidClock,
}

impl DirectResolver {
    pub fn new(cfg: &SysConfig) -> DirectResolver {
        DirectResolver {
            result_valid: cfg.result_valid,
            retry_max: cfg.retry_max,
            recent: None,
            cmsgid: 0,
            clock: TidClock::for_process(),
        }
    }

    fn next_cmsgid(&mut self) -> i32 {
        self.cmsgid = self.cmsgid.wrapping_add(1);
        self.cmsgid
    }

    /// One single-server volatile transaction reading the metadata slots.
    fn read_metadata<T: Transport>(
        &mut self,
        tp: &T,
        pds0: SrcDest,
        md_fh: FHandle,
    ) -> Outcome<[i64; 3]> {
        let transid = self.clock.assign();
        let vals = client::read_sint(tp, pds0, transid, 0, md_fh, 0, 3)?;
        client::commit(tp, pds0, transid, 1)?;
        if vals.len() != 3 {
            return Err(StatusCode::NoEnt);
        }
        Ok([vals[0], vals[1], vals[2]])
    }

    fn write_metadata<T: Transport>(
        &mut self,
        tp: &T,
        pds0: SrcDest,
        md_fh: FHandle,
        vals: [i64; 3],
    ) -> Outcome<()> {
        let transid = self.clock.assign();
        match client::write_sint(tp, pds0, transid, 0, md_fh, 0, &vals) {
            Ok(3) => client::commit(tp, pds0, transid, 1),
            Ok(_) => {
                let _ = client::abort(tp, pds0, transid);
                Err(StatusCode::Unxp)
            }
            Err(StatusCode::Abort) => Err(StatusCode::Abort),
            Err(sc) => {
                let _ = client::abort(tp, pds0, transid);
                Err(sc)
            }
        }
    }

    /// Find (or register) `group` in the registry file and return its
    /// shared-pointer slot. The registry read takes a whole-file write lock,
    /// so concurrent opens serialize; a transaction aborted under contention
    /// is retried with the same id until it ages into priority.
    fn group_slot<T: Transport>(
        &mut self,
        tp: &T,
        pds0: SrcDest,
        groups_fh: FHandle,
        sptr_fh: FHandle,
        group: &str,
        zero_ptr: bool,
    ) -> Outcome<i64> {
        let transid = self.clock.assign();
        let mut attempts = self.retry_max;
        loop {
            match self.group_slot_once(tp, pds0, groups_fh, sptr_fh, group, zero_ptr, transid) {
                Err(StatusCode::Abort) if attempts > 1 => {
                    attempts -= 1;
                    debug!(target: "pious", group, "group registry contention, retrying");
                }
                other => return other,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn group_slot_once<T: Transport>(
        &mut self,
        tp: &T,
        pds0: SrcDest,
        groups_fh: FHandle,
        sptr_fh: FHandle,
        group: &str,
        zero_ptr: bool,
        transid: TransId,
    ) -> Outcome<i64> {
        match group_slot_body(tp, pds0, groups_fh, sptr_fh, group, zero_ptr, transid) {
            Ok(idx) => Ok(idx),
            // The server already discarded the transaction.
            Err(StatusCode::Abort) => Err(StatusCode::Abort),
            Err(sc) => {
                let _ = client::abort(tp, pds0, transid);
                Err(sc)
            }
        }
    }

    /// Locate an extant parafile and hand back its component handles.
    fn pf_lookup<T: Transport>(
        &mut self,
        tp: &T,
        dsv: &[DsInfo],
        group: &str,
        path: &str,
        md_fh: FHandle,
        trunc: bool,
    ) -> Outcome<ParafileInfo> {
        let pds0 = dsv[0].id;
        let md = self.read_metadata(tp, pds0, md_fh)?;
        if md[0] == 0 {
            // A partial create or unlink left components behind; the
            // parafile is not extant.
            return Err(StatusCode::NoEnt);
        }
        let pds_cnt = md[1] as usize;
        let seg_cnt = md[2] as usize;
        if pds_cnt == 0 || seg_cnt < pds_cnt || dsv.len() < pds_cnt {
            return Err(StatusCode::Inval);
        }
        let mut seg_fhandle = Vec::with_capacity(seg_cnt);
        let mut amode = 4 | 2;
        for n in 0..seg_cnt {
            let srv = dsv[n % pds_cnt].id;
            let cm = self.next_cmsgid();
            let (fh, am) = client::lookup(
                tp,
                srv,
                cm,
                &format!("{path}/segment.{n}"),
                CreateFlag {
                    creat: false,
                    trunc,
                },
                0,
            )?;
            amode &= am;
            seg_fhandle.push(fh);
        }
        let cm = self.next_cmsgid();
        let (sptr_fhandle, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{SHARPTR_FNAME}"),
            CreateFlag::default(),
            0,
        )?;
        let cm = self.next_cmsgid();
        let (groups_fh, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{GROUPS_FNAME}"),
            CreateFlag {
                creat: true,
                trunc: false,
            },
            SHARPTR_PERM,
        )?;
        let sptr_idx = self.group_slot(tp, pds0, groups_fh, sptr_fhandle, group, trunc)?;
        Ok(ParafileInfo {
            pds_cnt,
            seg_cnt,
            sptr_fhandle,
            sptr_idx,
            seg_fhandle,
            pds_id: dsv[..pds_cnt].iter().map(|d| d.id).collect(),
            amode,
        })
    }

    /// Create a parafile. Order matters: conflict probe, directories,
    /// metadata marked not-extant, component files, metadata rewritten
    /// extant, so a failed create always remains detectable and removable.
    fn pf_creat<T: Transport>(
        &mut self,
        tp: &T,
        dsv: &[DsInfo],
        group: &str,
        path: &str,
        mode: u32,
        seg: usize,
    ) -> Outcome<ParafileInfo> {
        if seg == 0 {
            return Err(StatusCode::Inval);
        }
        let pds_cnt = dsv.len().min(seg);
        let pds0 = dsv[0].id;

        // Will not adopt an existing directory anywhere.
        for ds in &dsv[..pds_cnt] {
            let cm = self.next_cmsgid();
            match client::stat(tp, ds.id, cm, path) {
                Err(StatusCode::NoEnt) => {}
                Ok(_) => return Err(StatusCode::Perm),
                Err(sc) => return Err(sc),
            }
        }
        for ds in &dsv[..pds_cnt] {
            let cm = self.next_cmsgid();
            match client::mkdir(tp, ds.id, cm, path, PF_DIR_PERM) {
                // Servers sharing one file system report Exist here; the
                // probe above already ruled out a name conflict.
                Ok(()) | Err(StatusCode::Exist) => {}
                Err(sc) => {
                    for ds in &dsv[..pds_cnt] {
                        let cm = self.next_cmsgid();
                        let _ = client::rmdir(tp, ds.id, cm, path);
                    }
                    return Err(sc);
                }
            }
        }

        let cm = self.next_cmsgid();
        let (md_fh, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{METADATA_FNAME}"),
            CreateFlag {
                creat: true,
                trunc: false,
            },
            METADATA_PERM,
        )?;
        self.write_metadata(tp, pds0, md_fh, [0, pds_cnt as i64, seg as i64])?;

        let mut seg_fhandle = Vec::with_capacity(seg);
        let mut amode = 4 | 2;
        for n in 0..seg {
            let srv = dsv[n % pds_cnt].id;
            let cm = self.next_cmsgid();
            let (fh, am) = client::lookup(
                tp,
                srv,
                cm,
                &format!("{path}/segment.{n}"),
                CreateFlag {
                    creat: true,
                    trunc: false,
                },
                mode,
            )?;
            amode &= am;
            seg_fhandle.push(fh);
        }
        let cm = self.next_cmsgid();
        let (sptr_fhandle, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{SHARPTR_FNAME}"),
            CreateFlag {
                creat: true,
                trunc: false,
            },
            SHARPTR_PERM,
        )?;
        let cm = self.next_cmsgid();
        let (groups_fh, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{GROUPS_FNAME}"),
            CreateFlag {
                creat: true,
                trunc: false,
            },
            SHARPTR_PERM,
        )?;

        // All components exist: the parafile becomes extant.
        self.write_metadata(tp, pds0, md_fh, [1, pds_cnt as i64, seg as i64])?;

        let sptr_idx = self.group_slot(tp, pds0, groups_fh, sptr_fhandle, group, false)?;
        Ok(ParafileInfo {
            pds_cnt,
            seg_cnt: seg,
            sptr_fhandle,
            sptr_idx,
            seg_fhandle,
            pds_id: dsv[..pds_cnt].iter().map(|d| d.id).collect(),
            amode,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn group_slot_body<T: Transport>(
    tp: &T,
    pds0: SrcDest,
    groups_fh: FHandle,
    sptr_fh: FHandle,
    group: &str,
    zero_ptr: bool,
    transid: TransId,
) -> Outcome<i64> {
    let mut sn = 0;
    let mut next_sn = || {
        let s = sn;
        sn += 1;
        s
    };
    let (_, data) = client::read(
        tp,
        pds0,
        transid,
        next_sn(),
        groups_fh,
        0,
        GROUPS_MAX,
        LockKind::Write,
    )?;
    let text = String::from_utf8_lossy(&data).to_string();
    let mut lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
    let (idx, grew) = match lines.iter().position(|l| *l == group) {
        Some(i) => (i as i64, false),
        None => {
            lines.push(group);
            ((lines.len() - 1) as i64, true)
        }
    };
    if grew {
        let mut content = lines.join("\n");
        content.push('\n');
        let n = client::write(
            tp,
            pds0,
            transid,
            next_sn(),
            groups_fh,
            0,
            content.into_bytes(),
        )?;
        if n == 0 {
            return Err(StatusCode::Unxp);
        }
    }
    if zero_ptr {
        client::write_sint(tp, pds0, transid, next_sn(), sptr_fh, idx, &[0])?;
    }
    let commit_sn = next_sn();
    client::commit(tp, pds0, transid, commit_sn)?;
    Ok(idx)
}

impl Resolver for DirectResolver {
    fn open<T: Transport>(
        &mut self,
        tp: &T,
        spec: &OpenSpec,
        path: &str,
        mode: u32,
    ) -> Outcome<ParafileInfo> {
        if spec.dsv.is_empty() || path.is_empty() {
            return Err(StatusCode::Inval);
        }
        let key: MemoKey = (path.to_string(), spec.clone(), mode);
        if let Some((k, info, at)) = &self.recent {
            if *k == key && at.elapsed() <= self.result_valid {
                return Ok(info.clone());
            }
        }
        self.recent = None;
        let pds0 = spec.dsv[0].id;
        let cm = self.next_cmsgid();
        let probe = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{METADATA_FNAME}"),
            CreateFlag::default(),
            0,
        );
        let info = match probe {
            Ok((md_fh, _)) => {
                self.pf_lookup(tp, &spec.dsv, &spec.group, path, md_fh, spec.trunc)?
            }
            Err(StatusCode::NoEnt) if spec.creat => {
                self.pf_creat(tp, &spec.dsv, &spec.group, path, mode, spec.seg)?
            }
            Err(sc) => return Err(sc),
        };
        self.recent = Some((key, info.clone(), Instant::now()));
        Ok(info)
    }

    fn unlink<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str) -> Outcome<()> {
        self.recent = None;
        if dsv.is_empty() || path.is_empty() {
            return Err(StatusCode::Inval);
        }
        let pds0 = dsv[0].id;
        let cm = self.next_cmsgid();
        let (md_fh, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{METADATA_FNAME}"),
            CreateFlag::default(),
            0,
        )?;
        let md = self.read_metadata(tp, pds0, md_fh)?;
        let pds_cnt = (md[1] as usize).max(1).min(dsv.len());
        let seg_cnt = md[2] as usize;

        // Not extant from here on; a failure below leaves a removable husk.
        self.write_metadata(tp, pds0, md_fh, [0, md[1], md[2]])?;

        let tolerate = |r: Outcome<()>| match r {
            Ok(()) | Err(StatusCode::NoEnt) => Ok(()),
            Err(sc) => Err(sc),
        };
        for n in 0..seg_cnt {
            let srv = dsv[n % pds_cnt].id;
            let cm = self.next_cmsgid();
            tolerate(client::unlink(tp, srv, cm, &format!("{path}/segment.{n}")))?;
        }
        for fname in [SHARPTR_FNAME, GROUPS_FNAME, METADATA_FNAME] {
            let cm = self.next_cmsgid();
            tolerate(client::unlink(tp, pds0, cm, &format!("{path}/{fname}")))?;
        }
        for ds in &dsv[..pds_cnt] {
            let cm = self.next_cmsgid();
            tolerate(client::rmdir(tp, ds.id, cm, path))?;
        }
        Ok(())
    }

    fn chmod<T: Transport>(
        &mut self,
        tp: &T,
        dsv: &[DsInfo],
        path: &str,
        mode: u32,
    ) -> Outcome<()> {
        self.recent = None;
        if dsv.is_empty() || path.is_empty() {
            return Err(StatusCode::Inval);
        }
        let pds0 = dsv[0].id;
        let cm = self.next_cmsgid();
        let (md_fh, _) = client::lookup(
            tp,
            pds0,
            cm,
            &format!("{path}/{METADATA_FNAME}"),
            CreateFlag::default(),
            0,
        )?;
        let md = self.read_metadata(tp, pds0, md_fh)?;
        if md[0] == 0 {
            return Err(StatusCode::NoEnt);
        }
        let pds_cnt = (md[1] as usize).max(1).min(dsv.len());
        for n in 0..md[2] as usize {
            let srv = dsv[n % pds_cnt].id;
            let cm = self.next_cmsgid();
            client::chmod(tp, srv, cm, &format!("{path}/segment.{n}"), mode)?;
        }
        Ok(())
    }

    /// Make a directory on every server so parafiles can live under it.
    /// Servers sharing one file system report Exist for the later creates;
    /// only a directory already present everywhere is an error.
    fn mkdir<T: Transport>(
        &mut self,
        tp: &T,
        dsv: &[DsInfo],
        path: &str,
        mode: u32,
    ) -> Outcome<()> {
        if dsv.is_empty() || path.is_empty() {
            return Err(StatusCode::Inval);
        }
        let mut all_exist = true;
        for ds in dsv {
            let cm = self.next_cmsgid();
            match client::mkdir(tp, ds.id, cm, path, mode) {
                Ok(()) => all_exist = false,
                Err(StatusCode::Exist) => {}
                Err(sc) => return Err(sc),
            }
        }
        if all_exist {
            Err(StatusCode::Exist)
        } else {
            Ok(())
        }
    }

    fn rmdir<T: Transport>(&mut self, tp: &T, dsv: &[DsInfo], path: &str) -> Outcome<()> {
        if dsv.is_empty() || path.is_empty() {
            return Err(StatusCode::Inval);
        }
        let mut all_noent = true;
        for ds in dsv {
            let cm = self.next_cmsgid();
            match client::rmdir(tp, ds.id, cm, path) {
                Ok(()) => all_noent = false,
                Err(StatusCode::NoEnt) => {}
                Err(sc) => return Err(sc),
            }
        }
        if all_noent {
            Err(StatusCode::NoEnt)
        } else {
            Ok(())
        }
    }
}
