use crate::{
    ChannelRealm, CntrlReply, CntrlReplyBody, CntrlReq, CntrlReqBody, CreateFlag, LockKind, Op,
    Reply, Request, SrcDest, TransReq, TransReqBody, Transport, VbufSpec, OP_COUNT, TAG_BASE,
};
use pious_base::{FHandle, TransId};
use std::time::Duration;
use test_log::test;

fn tid(n: i64) -> TransId {
    TransId {
        sec: n,
        usec: n,
        host: 1,
        pid: 1,
    }
}

fn fh() -> FHandle {
    FHandle { dev: 3, ino: 77 }
}

#[test]
fn test_tag_window() {
    assert_eq!(Op::Read.tag(), TAG_BASE);
    assert_eq!(Op::Shutdown.tag(), i32::MAX);
    for code in 0..OP_COUNT {
        let op = Op::from_tag(TAG_BASE + code).unwrap();
        assert_eq!(op.tag(), TAG_BASE + code);
        assert_eq!(op.is_trans(), code <= 7);
        assert_eq!(op.is_control(), code >= 8);
    }
    assert_eq!(Op::from_tag(TAG_BASE - 1), None);
    assert_eq!(Op::from_tag(0), None);
}

#[test]
fn test_request_round_trip() {
    let reqs = vec![
        Request::Trans(TransReq {
            transid: tid(9),
            transsn: 0,
            body: TransReqBody::Read {
                fhandle: fh(),
                offset: 12,
                nbyte: 34,
                lock: LockKind::Read,
            },
        }),
        Request::Trans(TransReq {
            transid: tid(9),
            transsn: 1,
            body: TransReqBody::Write {
                fhandle: fh(),
                offset: 0,
                data: vec![1, 2, 3, 4],
            },
        }),
        Request::Trans(TransReq {
            transid: tid(9),
            transsn: 2,
            body: TransReqBody::FaSint {
                fhandle: fh(),
                offset: 0,
                increment: -5,
            },
        }),
        Request::Cntrl(CntrlReq {
            cmsgid: 42,
            body: CntrlReqBody::Lookup {
                path: "a/b".into(),
                cflag: CreateFlag {
                    creat: true,
                    trunc: false,
                },
                mode: 0o644,
            },
        }),
        Request::Cntrl(CntrlReq {
            cmsgid: 43,
            body: CntrlReqBody::Shutdown,
        }),
    ];
    for req in reqs {
        let bytes = req.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }
}

#[test]
fn test_reply_round_trip() {
    let rep = Reply::Cntrl(CntrlReply {
        cmsgid: 42,
        rcode: 0,
        body: CntrlReplyBody::Lookup {
            fhandle: fh(),
            amode: 6,
        },
    });
    let bytes = rep.encode().unwrap();
    assert_eq!(Reply::decode(&bytes).unwrap(), rep);
}

#[test]
fn test_realm_delivers_in_order() {
    let realm = ChannelRealm::new();
    let a = realm.endpoint(SrcDest(1)).unwrap();
    let b = realm.endpoint(SrcDest(2)).unwrap();
    a.send(SrcDest(2), 7, vec![1]).unwrap();
    a.send(SrcDest(2), 8, vec![2]).unwrap();
    let first = b.recv(None, None, None).unwrap().unwrap();
    let second = b.recv(None, None, None).unwrap().unwrap();
    assert_eq!((first.tag, first.bytes), (7, vec![1]));
    assert_eq!((second.tag, second.bytes), (8, vec![2]));
    assert_eq!(first.src, SrcDest(1));
}

#[test]
fn test_realm_filtered_recv_stashes() {
    let realm = ChannelRealm::new();
    let a = realm.endpoint(SrcDest(1)).unwrap();
    let b = realm.endpoint(SrcDest(2)).unwrap();
    a.send(SrcDest(2), 7, vec![1]).unwrap();
    a.send(SrcDest(2), 8, vec![2]).unwrap();
    // Ask for tag 8 first; tag 7 must survive for the next receive.
    let want8 = b.recv(None, Some(8), None).unwrap().unwrap();
    assert_eq!(want8.bytes, vec![2]);
    let want7 = b.recv(None, Some(7), None).unwrap().unwrap();
    assert_eq!(want7.bytes, vec![1]);
}

#[test]
fn test_realm_recv_timeout() {
    let realm = ChannelRealm::new();
    let a = realm.endpoint(SrcDest(1)).unwrap();
    let got = a
        .recv(None, None, Some(Duration::from_millis(10)))
        .unwrap();
    assert!(got.is_none());
}

#[test]
fn test_realm_rejects_duplicate_endpoint() {
    let realm = ChannelRealm::new();
    let _a = realm.endpoint(SrcDest(1)).unwrap();
    assert!(realm.endpoint(SrcDest(1)).is_err());
}

#[test]
fn test_vbuf_contiguous_fast_path() {
    let v = VbufSpec::contiguous(2, 4);
    let src = [0u8, 1, 2, 3, 4, 5, 6, 7];
    assert_eq!(v.gather(&src, 4), vec![2, 3, 4, 5]);
    let mut dst = [0u8; 8];
    assert_eq!(v.scatter(&mut dst, &[9, 9, 9, 9]), 4);
    assert_eq!(dst, [0, 0, 9, 9, 9, 9, 0, 0]);
}

#[test]
fn test_vbuf_strided_gather_scatter() {
    // Stripe unit 3, three segments; this descriptor covers the middle
    // segment of a linear buffer starting mid-unit: first block is the 2
    // trailing bytes of its unit, later blocks are whole units 9 bytes
    // apart.
    let v = VbufSpec {
        blksz: 3,
        stride: 3,
        first_off: 1,
        firstblk_netsz: 2,
    };
    let src: Vec<u8> = (0..24).collect();
    assert_eq!(v.gather(&src, 8), vec![1, 2, 9, 10, 11, 18, 19, 20]);

    let mut dst = vec![0u8; 24];
    let placed = v.scatter(&mut dst, &[101, 102, 109, 110, 111, 118]);
    assert_eq!(placed, 6);
    let mut want = vec![0u8; 24];
    want[1] = 101;
    want[2] = 102;
    want[9] = 109;
    want[10] = 110;
    want[11] = 111;
    want[18] = 118;
    assert_eq!(dst, want);
}

#[test]
fn test_vbuf_short_payload_scatter() {
    let v = VbufSpec {
        blksz: 4,
        stride: 2,
        first_off: 0,
        firstblk_netsz: 4,
    };
    let mut dst = vec![0u8; 16];
    // Payload stops inside the second block.
    let placed = v.scatter(&mut dst, &[1, 2, 3, 4, 5]);
    assert_eq!(placed, 5);
    assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
    assert_eq!(dst[8], 5);
}
