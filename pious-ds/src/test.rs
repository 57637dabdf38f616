use crate::cache::Cache;
use crate::lock::{LockOutcome, LockTable};
use crate::sfile::SFile;
use crate::DataServer;
use pious_base::{ByteRange, FHandle, StatusCode, SysConfig, TransId};
use pious_msg::{
    ChannelEndpoint, ChannelRealm, CntrlReply, CntrlReq, CntrlReqBody, CreateFlag, LockKind, Op,
    Reply, Request, SrcDest, TransReply, TransReq, TransReqBody, Transport,
};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use test_log::test;

struct TempRoot(PathBuf);

impl TempRoot {
    fn new(tag: &str) -> TempRoot {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!(
            "pious-ds-{tag}-{}-{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&p).unwrap();
        TempRoot(p)
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn tid(sec: i64) -> TransId {
    TransId {
        sec,
        usec: 0,
        host: 1,
        pid: 1,
    }
}

// ---- lock manager ----

#[test]
fn test_lock_readers_share_writers_exclude() {
    let mut lt = LockTable::new();
    let fh = FHandle { dev: 1, ino: 1 };
    let r = ByteRange::new(0, 100);
    assert_eq!(
        lt.acquire(tid(1), fh, r, LockKind::Read),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(2), fh, r, LockKind::Read),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(3), fh, r, LockKind::Write),
        LockOutcome::Blocked
    );
    // Disjoint range writes fine.
    assert_eq!(
        lt.acquire(tid(3), fh, ByteRange::new(100, 10), LockKind::Write),
        LockOutcome::Granted
    );
    // Zero-byte request acquires nothing even under conflict.
    assert_eq!(
        lt.acquire(tid(3), fh, ByteRange::new(0, 0), LockKind::Write),
        LockOutcome::Granted
    );
    lt.release_all(tid(2));
    assert_eq!(
        lt.acquire(tid(3), fh, r, LockKind::Write),
        LockOutcome::Blocked
    );
    lt.release_all(tid(1));
    assert_eq!(
        lt.acquire(tid(3), fh, r, LockKind::Write),
        LockOutcome::Granted
    );
    assert!(lt.holds_any(tid(3)));
    lt.release_all(tid(3));
    assert!(!lt.holds_any(tid(3)));
}

#[test]
fn test_lock_upgrade_when_sole_reader() {
    let mut lt = LockTable::new();
    let fh = FHandle { dev: 1, ino: 1 };
    let r = ByteRange::new(10, 10);
    assert_eq!(
        lt.acquire(tid(1), fh, r, LockKind::Read),
        LockOutcome::Granted
    );
    // Sole reader upgrades.
    assert_eq!(
        lt.acquire(tid(1), fh, r, LockKind::Write),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(2), fh, r, LockKind::Read),
        LockOutcome::Blocked
    );

    let mut lt = LockTable::new();
    assert_eq!(
        lt.acquire(tid(1), fh, r, LockKind::Read),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(2), fh, r, LockKind::Read),
        LockOutcome::Granted
    );
    // Another reader overlaps: the upgrade blocks.
    assert_eq!(
        lt.acquire(tid(1), fh, r, LockKind::Write),
        LockOutcome::Blocked
    );
    assert_eq!(lt.conflict_holders(tid(1), fh, r, LockKind::Write), vec![tid(2)]);
}

#[test]
fn test_lock_covered_reacquire_is_noop() {
    let mut lt = LockTable::new();
    let fh = FHandle { dev: 1, ino: 1 };
    assert_eq!(
        lt.acquire(tid(1), fh, ByteRange::new(0, 100), LockKind::Write),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(1), fh, ByteRange::new(10, 20), LockKind::Read),
        LockOutcome::Granted
    );
    assert_eq!(
        lt.acquire(tid(1), fh, ByteRange::new(10, 20), LockKind::Write),
        LockOutcome::Granted
    );
}

// ---- cache ----

fn mkfile(sf: &mut SFile, name: &str) -> FHandle {
    let (fh, amode) = sf
        .lookup(
            name,
            CreateFlag {
                creat: true,
                trunc: false,
            },
            0o644,
        )
        .unwrap();
    assert_eq!(amode, 6);
    fh
}

#[test]
fn test_cache_promotion_and_eviction() {
    let root = TempRoot::new("cache");
    let mut sf = SFile::new(root.0.clone());
    let fh = mkfile(&mut sf, "data");
    // Four-block cache: two protected, two probationary, block size 8.
    let mut cache = Cache::new(8, 4);
    cache.write(&sf, fh, 0, b"aaaaaaaa").unwrap();
    let key0 = (fh, 0);
    assert_eq!(cache.residency(&key0), (false, true));
    // Re-reference promotes to protected.
    let mut buf = [0u8; 8];
    cache.read(&sf, fh, 0, &mut buf).unwrap();
    assert_eq!(cache.residency(&key0), (true, false));
    assert_eq!(&buf, b"aaaaaaaa");
    // Touch three more blocks; probationary holds the two newest.
    for n in 1..=3i64 {
        cache.write(&sf, fh, n * 8, b"bbbbbbbb").unwrap();
    }
    assert_eq!(cache.residency(&(fh, 0)), (true, false));
    assert_eq!(cache.residency(&(fh, 3)), (false, true));
    assert_eq!(cache.residency(&(fh, 2)), (false, true));
    // Block 1 was evicted from probationary and written back.
    assert_eq!(cache.residency(&(fh, 1)), (false, false));
    let mut back = [0u8; 8];
    assert_eq!(sf.read_at(fh, 8, &mut back).unwrap(), 8);
    assert_eq!(&back, b"bbbbbbbb");
}

#[test]
fn test_cache_flush_writes_dirty_blocks() {
    let root = TempRoot::new("flush");
    let mut sf = SFile::new(root.0.clone());
    let fh = mkfile(&mut sf, "data");
    let mut cache = Cache::new(16, 4);
    cache.write(&sf, fh, 0, b"hello").unwrap();
    // Dirty data not yet on disk.
    assert_eq!(sf.len(fh).unwrap(), 0);
    cache.flush_all(&sf).unwrap();
    assert_eq!(sf.len(fh).unwrap(), 5);
    let mut back = [0u8; 5];
    sf.read_at(fh, 0, &mut back).unwrap();
    assert_eq!(&back, b"hello");
}

#[test]
fn test_cache_disabled_passes_through() {
    let root = TempRoot::new("nocache");
    let mut sf = SFile::new(root.0.clone());
    let fh = mkfile(&mut sf, "data");
    let mut cache = Cache::new(16, 0);
    cache.write(&sf, fh, 0, b"direct").unwrap();
    assert_eq!(sf.len(fh).unwrap(), 6);
    let mut buf = [0u8; 6];
    cache.read(&sf, fh, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"direct");
}

// ---- dispatch loop ----

fn fast_cfg() -> SysConfig {
    SysConfig {
        block_size: 64,
        cache_blocks: 8,
        deadlock_timeout: Duration::from_millis(50),
        ..SysConfig::default()
    }
}

fn start_server(realm: &ChannelRealm, id: i32, root: PathBuf, cfg: SysConfig) -> std::thread::JoinHandle<()> {
    let ep = realm.endpoint(SrcDest(id)).unwrap();
    std::thread::spawn(move || {
        let mut ds = DataServer::new(ep, root, cfg).unwrap();
        ds.run().unwrap();
    })
}

struct Cli {
    ep: ChannelEndpoint,
    srv: SrcDest,
}

impl Cli {
    fn new(realm: &ChannelRealm, id: i32, srv: i32) -> Cli {
        Cli {
            ep: realm.endpoint(SrcDest(id)).unwrap(),
            srv: SrcDest(srv),
        }
    }

    fn cntrl(&self, cmsgid: i32, body: CntrlReqBody) -> CntrlReply {
        let op = body.op();
        let req = Request::Cntrl(CntrlReq { cmsgid, body });
        self.ep.send(self.srv, op.tag(), req.encode().unwrap()).unwrap();
        let env = self
            .ep
            .recv(Some(self.srv), Some(op.tag()), Some(Duration::from_secs(5)))
            .unwrap()
            .expect("control reply");
        match Reply::decode(&env.bytes).unwrap() {
            Reply::Cntrl(c) => c,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn lookup(&self, path: &str) -> FHandle {
        let rep = self.cntrl(
            1,
            CntrlReqBody::Lookup {
                path: path.into(),
                cflag: CreateFlag {
                    creat: true,
                    trunc: false,
                },
                mode: 0o644,
            },
        );
        assert_eq!(rep.rcode, 0, "lookup failed: {:?}", rep);
        match rep.body {
            pious_msg::CntrlReplyBody::Lookup { fhandle, .. } => fhandle,
            other => panic!("unexpected lookup body {other:?}"),
        }
    }

    fn send_trans(&self, transid: TransId, transsn: i32, body: TransReqBody) {
        let tag = body.op().tag();
        let req = Request::Trans(TransReq {
            transid,
            transsn,
            body,
        });
        self.ep.send(self.srv, tag, req.encode().unwrap()).unwrap();
    }

    fn recv_trans(&self, op: Op) -> TransReply {
        let env = self
            .ep
            .recv(Some(self.srv), Some(op.tag()), Some(Duration::from_secs(5)))
            .unwrap()
            .expect("transaction reply");
        match Reply::decode(&env.bytes).unwrap() {
            Reply::Trans(t) => t,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn trans(&self, transid: TransId, transsn: i32, body: TransReqBody) -> TransReply {
        let op = body.op();
        self.send_trans(transid, transsn, body);
        self.recv_trans(op)
    }

    fn shutdown(&self) {
        let rep = self.cntrl(99, CntrlReqBody::Shutdown);
        assert_eq!(rep.rcode, 0);
    }
}

#[test]
fn test_server_write_commit_read_back() {
    let root = TempRoot::new("srv-rw");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("seg");

    let t1 = tid(10);
    let rep = cli.trans(
        t1,
        0,
        TransReqBody::Write {
            fhandle: fh,
            offset: 0,
            data: b"transactional".to_vec(),
        },
    );
    assert_eq!(rep.rcode, 13);
    // The writer reads back its own buffered data.
    let rep = cli.trans(
        t1,
        1,
        TransReqBody::Read {
            fhandle: fh,
            offset: 6,
            nbyte: 100,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, 7);
    assert_eq!(rep.body, pious_msg::TransReplyBody::Read(b"ctional".to_vec()));
    let rep = cli.trans(t1, 2, TransReqBody::Commit);
    assert_eq!(rep.rcode, 0);

    // A later transaction observes the committed bytes.
    let t2 = tid(11);
    let rep = cli.trans(
        t2,
        0,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 5,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, 5);
    assert_eq!(rep.body, pious_msg::TransReplyBody::Read(b"trans".to_vec()));
    let rep = cli.trans(t2, 1, TransReqBody::Commit);
    assert_eq!(rep.rcode, 0);

    // After a cache flush the bytes are on disk.
    let rep = cli.cntrl(7, CntrlReqBody::CacheFlush);
    assert_eq!(rep.rcode, 0);
    let on_disk = std::fs::read(root.0.join("seg")).unwrap();
    assert_eq!(on_disk, b"transactional");

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_sequence_protocol() {
    let root = TempRoot::new("srv-seq");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("seg");

    // First operation of a transaction must carry sequence zero.
    let t = tid(20);
    let rep = cli.trans(
        t,
        3,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 1,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, StatusCode::Proto.rcode());

    // Abort is exempt from sequencing and resets the expectation.
    let rep = cli.trans(t, 0, TransReqBody::Abort);
    assert_eq!(rep.rcode, 0);
    let rep = cli.trans(
        t,
        0,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 1,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, 0); // empty file: zero bytes
    // Skipping a sequence number is a violation.
    let rep = cli.trans(
        t,
        5,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 1,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, StatusCode::Proto.rcode());

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_read_only_prepare() {
    let root = TempRoot::new("srv-ro");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("seg");

    let t = tid(30);
    let rep = cli.trans(
        t,
        0,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 8,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, 0);
    let rep = cli.trans(t, 1, TransReqBody::Prepare);
    assert_eq!(rep.rcode, StatusCode::ReadOnly.rcode());
    // The transaction retired; the same id starts fresh at sequence zero.
    let rep = cli.trans(
        t,
        0,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 8,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, 0);
    let rep = cli.trans(t, 1, TransReqBody::Commit);
    assert_eq!(rep.rcode, 0);

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_stable_prepare_logs_then_commit_truncates() {
    let root = TempRoot::new("srv-stable");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("seg");

    let t = tid(40);
    let rep = cli.trans(
        t,
        0,
        TransReqBody::Write {
            fhandle: fh,
            offset: 0,
            data: b"durable".to_vec(),
        },
    );
    assert_eq!(rep.rcode, 7);
    let rep = cli.trans(t, 1, TransReqBody::Prepare);
    assert_eq!(rep.rcode, 0);
    // The redo record exists while prepared.
    let logged: Vec<_> = std::fs::read_dir(root.0.join(".log")).unwrap().collect();
    assert_eq!(logged.len(), 1);
    let rep = cli.trans(t, 2, TransReqBody::Commit);
    assert_eq!(rep.rcode, 0);
    let logged: Vec<_> = std::fs::read_dir(root.0.join(".log")).unwrap().collect();
    assert!(logged.is_empty());
    // Stable commit forced the data down without a cache flush.
    let on_disk = std::fs::read(root.0.join("seg")).unwrap();
    assert_eq!(on_disk, b"durable");

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_abort_discards_buffered_writes() {
    let root = TempRoot::new("srv-abort");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("seg");

    let t1 = tid(50);
    cli.trans(
        t1,
        0,
        TransReqBody::Write {
            fhandle: fh,
            offset: 0,
            data: b"keep".to_vec(),
        },
    );
    assert_eq!(cli.trans(t1, 1, TransReqBody::Commit).rcode, 0);

    let t2 = tid(51);
    cli.trans(
        t2,
        0,
        TransReqBody::Write {
            fhandle: fh,
            offset: 0,
            data: b"drop".to_vec(),
        },
    );
    assert_eq!(cli.trans(t2, 1, TransReqBody::Abort).rcode, 0);

    let t3 = tid(52);
    let rep = cli.trans(
        t3,
        0,
        TransReqBody::Read {
            fhandle: fh,
            offset: 0,
            nbyte: 4,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.body, pious_msg::TransReplyBody::Read(b"keep".to_vec()));
    cli.trans(t3, 1, TransReqBody::Commit);

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_fa_sint() {
    let root = TempRoot::new("srv-fa");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);
    let fh = cli.lookup("ptr");

    let t = tid(60);
    let rep = cli.trans(
        t,
        0,
        TransReqBody::FaSint {
            fhandle: fh,
            offset: 0,
            increment: 5,
        },
    );
    assert_eq!(rep.rcode, 0);
    assert_eq!(rep.body, pious_msg::TransReplyBody::FaSint(0));
    let rep = cli.trans(
        t,
        1,
        TransReqBody::FaSint {
            fhandle: fh,
            offset: 0,
            increment: 3,
        },
    );
    assert_eq!(rep.body, pious_msg::TransReplyBody::FaSint(5));
    assert_eq!(cli.trans(t, 2, TransReqBody::Commit).rcode, 0);

    let t2 = tid(61);
    let rep = cli.trans(
        t2,
        0,
        TransReqBody::ReadSint {
            fhandle: fh,
            offset: 0,
            nint: 1,
        },
    );
    assert_eq!(rep.rcode, 1);
    assert_eq!(rep.body, pious_msg::TransReplyBody::ReadSint(vec![8]));
    cli.trans(t2, 1, TransReqBody::Commit);

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_bad_fhandle() {
    let root = TempRoot::new("srv-badf");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let cli = Cli::new(&realm, 1, 100);

    let t = tid(70);
    let rep = cli.trans(
        t,
        0,
        TransReqBody::Read {
            fhandle: FHandle { dev: 0, ino: 0 },
            offset: 0,
            nbyte: 1,
            lock: LockKind::Read,
        },
    );
    assert_eq!(rep.rcode, StatusCode::BadFile.rcode());

    cli.shutdown();
    h.join().unwrap();
}

#[test]
fn test_server_deadlock_aborts_younger_waiter() {
    let root = TempRoot::new("srv-dead");
    let realm = ChannelRealm::new();
    let h = start_server(&realm, 100, root.0.clone(), fast_cfg());
    let a = Cli::new(&realm, 1, 100);
    let b = Cli::new(&realm, 2, 100);
    let fh = a.lookup("seg");

    let ta = tid(80); // older
    let tb = tid(81); // younger

    assert_eq!(
        a.trans(
            ta,
            0,
            TransReqBody::Write {
                fhandle: fh,
                offset: 0,
                data: vec![b'a'; 10],
            },
        )
        .rcode,
        10
    );
    assert_eq!(
        b.trans(
            tb,
            0,
            TransReqBody::Write {
                fhandle: fh,
                offset: 10,
                data: vec![b'b'; 10],
            },
        )
        .rcode,
        10
    );

    // Cross over: both block, and after the deadlock timeout the younger
    // transaction is the victim.
    a.send_trans(
        ta,
        1,
        TransReqBody::Write {
            fhandle: fh,
            offset: 10,
            data: vec![b'A'; 10],
        },
    );
    b.send_trans(
        tb,
        1,
        TransReqBody::Write {
            fhandle: fh,
            offset: 0,
            data: vec![b'B'; 10],
        },
    );

    let rb = b.recv_trans(Op::Write);
    assert_eq!(rb.rcode, StatusCode::Abort.rcode());
    let ra = a.recv_trans(Op::Write);
    assert_eq!(ra.rcode, 10);
    assert_eq!(a.trans(ta, 2, TransReqBody::Commit).rcode, 0);

    // The victim retries under the same id and now gets through.
    assert_eq!(
        b.trans(
            tb,
            0,
            TransReqBody::Write {
                fhandle: fh,
                offset: 0,
                data: vec![b'B'; 20],
            },
        )
        .rcode,
        20
    );
    assert_eq!(b.trans(tb, 1, TransReqBody::Commit).rcode, 0);

    a.shutdown();
    h.join().unwrap();
}
