use crate::engine::{effective_bytes, StripePlan};
use test_log::test;


#[test]
fn test_stripe_plan_aligned_full_stripes() {
    // 21 bytes at offset 0, stripe unit 7, three segments: one full stripe.
    let p = StripePlan::linear(0, 21, 7, 3);
    assert_eq!((p.seg_first, p.seg_access), (0, 3));
    for seg in 0..3 {
        assert_eq!(p.farg[seg].offset, 0);
        assert_eq!(p.farg[seg].nbyte, 7);
        assert_eq!(p.vbuf[seg].blksz, 7);
        assert_eq!(p.vbuf[seg].stride, 3);
        assert_eq!(p.vbuf[seg].first_off, 7 * seg as i64);
        assert_eq!(p.vbuf[seg].firstblk_netsz, 7);
    }
}

#[test]
fn test_stripe_plan_mid_unit_start() {
    // 8 bytes at offset 10, stripe unit 7, three segments: starts 3 bytes
    // into stripe unit 1 (segment 1), spills 4 bytes into segment 2.
    let p = StripePlan::linear(10, 8, 7, 3);
    assert_eq!((p.seg_first, p.seg_access), (1, 2));
    assert_eq!(p.farg[1], crate::engine::FileArg { offset: 3, nbyte: 4 });
    assert_eq!(p.farg[2], crate::engine::FileArg { offset: 0, nbyte: 4 });
    assert_eq!(p.vbuf[1].first_off, 0);
    assert_eq!(p.vbuf[1].firstblk_netsz, 4);
    assert_eq!(p.vbuf[2].first_off, 4);
    assert_eq!(p.vbuf[2].firstblk_netsz, 7);
}

#[test]
fn test_stripe_plan_wraparound_offsets() {
    // 42 bytes at offset 35: starts at stripe unit 5 (segment 2), wraps, so
    // later segments read one stripe unit further into their files.
    let p = StripePlan::linear(35, 42, 7, 3);
    assert_eq!((p.seg_first, p.seg_access), (2, 3));
    // Segment 2 holds units 5 and 8 -> file offsets 7..21.
    assert_eq!(p.farg[2], crate::engine::FileArg { offset: 7, nbyte: 14 });
    // Segments 0 and 1 are reached after the wrap at file offset 14.
    assert_eq!(p.farg[0], crate::engine::FileArg { offset: 14, nbyte: 14 });
    assert_eq!(p.farg[1], crate::engine::FileArg { offset: 14, nbyte: 14 });
}

#[test]
fn test_stripe_plan_single_unit() {
    let p = StripePlan::linear(3, 2, 7, 3);
    assert_eq!((p.seg_first, p.seg_access), (0, 1));
    assert_eq!(p.farg[0], crate::engine::FileArg { offset: 3, nbyte: 2 });
}

#[test]
fn test_effective_bytes_full_transfer() {
    assert_eq!(effective_bytes(0, 7, 3, 0, 3, &[7, 7, 7]), 21);
    assert_eq!(effective_bytes(0, 7, 3, 0, 3, &[336, 336, 336]), 1008);
}

#[test]
fn test_effective_bytes_short_segment() {
    // Segment 1 accepted only 3 bytes: the transfer is contiguous through
    // segment 0's unit plus those 3 bytes.
    assert_eq!(effective_bytes(0, 7, 3, 0, 3, &[7, 3, 7]), 10);
    // Nothing accepted anywhere.
    assert_eq!(effective_bytes(0, 7, 3, 0, 3, &[0, 0, 0]), 0);
}

#[test]
fn test_effective_bytes_partial_first_unit() {
    // Access starting 3 bytes into a unit; every segment accepts a full
    // slice of 2 units except the first which accepts its remainder.
    let p = StripePlan::linear(3, 39, 7, 3);
    assert_eq!((p.seg_first, p.seg_access), (0, 3));
    let seg_byte = [p.farg[0].nbyte, p.farg[1].nbyte, p.farg[2].nbyte];
    assert_eq!(
        effective_bytes(3, 7, 3, 0, 3, &seg_byte),
        39
    );
}

#[test]
fn test_effective_bytes_not_all_segments_touched() {
    // Two of three segments touched: no full stripe counting applies.
    assert_eq!(effective_bytes(10, 7, 3, 1, 2, &[0, 4, 4]), 8);
    assert_eq!(effective_bytes(10, 7, 3, 1, 2, &[0, 4, 2]), 6);
}
