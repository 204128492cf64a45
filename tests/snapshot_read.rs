//! `QUERY_SNAPSHOT_READ` must stay a pure read (spec §4.7's `test_unique`):
//! a chunk that already has an exception is handed back directly, with no
//! lock and no allocation; a chunk that doesn't is read from the origin
//! under a lock, again without allocating anything. Neither case may cost a
//! copy-out — that would defeat the whole point of copy-on-write snapshots.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::{dispatch, OpCode, Reply};

#[test]
fn reading_a_chunk_with_no_exception_never_allocates() {
    let mut server = util::build_store();
    let bit = util::create_snapshot(&mut server, 1, 1000, 10);

    let chunk = Chunk::new(3);
    util::fill_origin_chunk(&server, chunk, 0x11);

    let free_before = server.sb.snapdata_alloc.as_ref().unwrap().free_chunks();

    let reader: u64 = 1;
    match util::query_snapshot_read(&mut server, chunk, bit, reader) {
        Reply::ReadFromOrigin { chunk: c } => assert_eq!(c, chunk, "an undiverged chunk reads straight from the origin"),
        other => panic!("expected ReadFromOrigin, got {:?}", other),
    }

    let free_after = server.sb.snapdata_alloc.as_ref().unwrap().free_chunks();
    assert_eq!(free_after, free_before, "a read of an unshared chunk must not allocate an exception chunk");

    // The read took a lock; releasing it cleanly reports nothing deferred.
    let reply = dispatch(&mut server, OpCode::FinishSnapshotRead { chunk, client: reader }, reader);
    assert_eq!(reply, Reply::ReadFinished { ready: vec![] });
}

#[test]
fn reading_a_chunk_with_an_existing_exception_takes_no_lock_and_mutates_nothing() {
    let mut server = util::build_store();
    let bit1 = util::create_snapshot(&mut server, 1, 1000, 10);
    util::create_snapshot(&mut server, 2, 1001, 10);

    let chunk = Chunk::new(7);
    util::fill_origin_chunk(&server, chunk, 0xAA);

    // An origin write carves out the shared exception both snapshots will
    // read through.
    let exception = match util::query_write_origin(&mut server, chunk, 9) {
        Reply::WriteOk { exception: Some(c) } => c,
        other => panic!("expected a fresh shared exception, got {:?}", other),
    };

    let free_before = server.sb.snapdata_alloc.as_ref().unwrap().free_chunks();

    let reader: u64 = 1;
    match util::query_snapshot_read(&mut server, chunk, bit1, reader) {
        Reply::ReadOk { chunk: c } => assert_eq!(c, exception),
        other => panic!("expected ReadOk, got {:?}", other),
    }

    let free_after = server.sb.snapdata_alloc.as_ref().unwrap().free_chunks();
    assert_eq!(free_after, free_before, "resolving a read against an existing exception must not allocate another");

    // No lock was taken for this read, so an origin write against the same
    // chunk must proceed immediately rather than defer.
    match dispatch(&mut server, OpCode::QueryWrite { chunk, snapbit: None }, 9) {
        Reply::WriteOk { .. } => {}
        other => panic!("a read answered from an existing exception must not hold a lock, got {:?}", other),
    }
}

#[test]
fn reading_an_unknown_or_squashed_snapshot_is_rejected() {
    let mut server = util::build_store_with_snapdata(1);
    let bit = util::create_snapshot(&mut server, 1, 1000, 0);
    let pinned = util::create_snapshot(&mut server, 2, 1001, snapcore::snapshot::PRIORITY_NEVER_DROP);

    match util::query_snapshot_read(&mut server, Chunk::new(1), 63, 1) {
        Reply::Error(_) => {}
        other => panic!("expected an error for an unknown snapshot bit, got {:?}", other),
    }

    // Exhaust the lone snapdata chunk to squash snapshot 1 (lowest
    // priority), then confirm reading through its now-squashed bit fails.
    util::fill_origin_chunk(&server, Chunk::new(1), 0x01);
    util::query_write_snapshot(&mut server, Chunk::new(1), bit, 1);
    util::fill_origin_chunk(&server, Chunk::new(2), 0x02);
    util::query_write_snapshot(&mut server, Chunk::new(2), pinned, 1);

    match util::query_snapshot_read(&mut server, Chunk::new(1), bit, 1) {
        Reply::Error(_) => {}
        other => panic!("expected squashed snapshot bit to be rejected on read, got {:?}", other),
    }
}
