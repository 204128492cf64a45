//! Scenario (D): when the snapdata region runs out of free chunks, a new
//! exception-creating write squashes the lowest-priority idle snapshot to
//! reclaim space rather than failing outright, and never touches a
//! `PRIORITY_NEVER_DROP` snapshot while another victim is available.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::Reply;
use snapcore::snapshot::SNAPSHOT_SQUASHED;

#[test]
fn low_priority_snapshot_is_squashed_to_make_room() {
    // Two snapdata chunks total: just enough for snapshot 1's two private
    // writes, none left over for anything else.
    let mut server = util::build_store_with_snapdata(2);
    let low_prio_bit = util::create_snapshot(&mut server, 1, 1000, 1);

    util::fill_origin_chunk(&server, Chunk::new(1), 0x01);
    match util::query_write_snapshot(&mut server, Chunk::new(1), low_prio_bit, 1) {
        Reply::WriteOk { exception: Some(_) } => {}
        other => panic!("expected WriteOk, got {:?}", other),
    }
    util::fill_origin_chunk(&server, Chunk::new(2), 0x02);
    match util::query_write_snapshot(&mut server, Chunk::new(2), low_prio_bit, 1) {
        Reply::WriteOk { exception: Some(_) } => {}
        other => panic!("expected WriteOk, got {:?}", other),
    }

    assert_eq!(server.sb.snapdata_alloc.as_ref().unwrap().free_chunks(), 0, "both snapdata chunks should now be spoken for");

    let pinned_bit = util::create_snapshot(&mut server, 2, 1001, snapcore::snapshot::PRIORITY_NEVER_DROP);

    // A third private write has nowhere to go without reclaiming space;
    // snapshot 1 (priority 1) is the only eligible victim, since snapshot 2
    // is pinned.
    util::fill_origin_chunk(&server, Chunk::new(3), 0x03);
    match util::query_write_snapshot(&mut server, Chunk::new(3), pinned_bit, 1) {
        Reply::WriteOk { exception: Some(_) } => {}
        other => panic!("expected the write to succeed after reclaiming snapshot 1's space, got {:?}", other),
    }

    let snap1 = server.list_snapshots().iter().find(|s| s.tag == 1).expect("snapshot 1 still listed");
    assert_eq!(snap1.bit, SNAPSHOT_SQUASHED, "snapshot 1 must have been squashed to make room");

    let snap2 = server.list_snapshots().iter().find(|s| s.tag == 2).expect("snapshot 2 still listed");
    assert_ne!(snap2.bit, SNAPSHOT_SQUASHED, "a pinned snapshot must never be squashed while another victim exists");
}

#[test]
fn pinned_snapshot_alone_reports_full_instead_of_squashing() {
    let mut server = util::build_store_with_snapdata(1);
    let bit = util::create_snapshot(&mut server, 1, 1000, snapcore::snapshot::PRIORITY_NEVER_DROP);

    util::fill_origin_chunk(&server, Chunk::new(1), 0x09);
    match util::query_write_snapshot(&mut server, Chunk::new(1), bit, 1) {
        Reply::WriteOk { exception: Some(_) } => {}
        other => panic!("expected WriteOk, got {:?}", other),
    }

    util::fill_origin_chunk(&server, Chunk::new(2), 0x0a);
    match util::query_write_snapshot(&mut server, Chunk::new(2), bit, 1) {
        Reply::Error(_) => {}
        other => panic!("expected an error once the only snapshot is pinned and space is exhausted, got {:?}", other),
    }
}
