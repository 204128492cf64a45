//! Scenario (F): an origin write against a chunk a snapshot reader currently
//! holds is deferred rather than racing the read; releasing the read lock
//! reports the write ready, and resubmitting it then proceeds normally.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::{dispatch, OpCode, Reply};

#[test]
fn origin_write_defers_until_snapshot_reader_releases() {
    let mut server = util::build_store();
    let bit = util::create_snapshot(&mut server, 1, 1000, 10);

    let chunk = Chunk::new(3);
    util::fill_origin_chunk(&server, chunk, 0x55);

    let reader: u64 = 1;
    let writer: u64 = 2;

    // The chunk has no exception yet, so the read resolves to the origin
    // and takes a lock on it rather than copying anything out.
    match util::query_snapshot_read(&mut server, chunk, bit, reader) {
        Reply::ReadFromOrigin { chunk: c } => assert_eq!(c, chunk),
        other => panic!("expected ReadFromOrigin, got {:?}", other),
    }

    // An origin write against the same chunk must defer rather than race
    // the in-flight read.
    let pending = match dispatch(&mut server, OpCode::QueryWrite { chunk, snapbit: None }, writer) {
        Reply::WriteDeferred(d) => d.pending,
        other => panic!("expected WriteDeferred, got {:?}", other),
    };

    let ready = match dispatch(&mut server, OpCode::FinishSnapshotRead { chunk, client: reader }, reader) {
        Reply::ReadFinished { ready } => ready,
        other => panic!("expected ReadFinished, got {:?}", other),
    };
    assert_eq!(ready, vec![pending], "releasing the only reader must ready exactly the deferred write");

    // The chunk is unlocked now, so resubmitting the write proceeds.
    match dispatch(&mut server, OpCode::QueryWrite { chunk, snapbit: None }, writer) {
        Reply::WriteOk { exception: Some(_) } => {}
        other => panic!("expected the write to finally proceed with a fresh exception, got {:?}", other),
    }
}

/// Scenario (§5 Cancellation): a reader disconnecting mid-read must release
/// its lock just as `FINISH_SNAPSHOT_READ` would, readying any origin write
/// parked behind it — and a writer disconnecting before its own deferred
/// write comes ready must have that write silently dropped, not answered.
#[test]
fn disconnect_releases_locks_and_drops_the_disconnecting_clients_own_pending() {
    let mut server = util::build_store();
    let bit = util::create_snapshot(&mut server, 1, 1000, 10);

    let chunk = Chunk::new(3);
    util::fill_origin_chunk(&server, chunk, 0x55);

    let reader: u64 = 1;
    let writer: u64 = 2;

    match util::query_snapshot_read(&mut server, chunk, bit, reader) {
        Reply::ReadFromOrigin { .. } => {}
        other => panic!("expected ReadFromOrigin, got {:?}", other),
    }

    let pending = match dispatch(&mut server, OpCode::QueryWrite { chunk, snapbit: None }, writer) {
        Reply::WriteDeferred(d) => d.pending,
        other => panic!("expected WriteDeferred, got {:?}", other),
    };

    // The reader vanishes without ever sending FINISH_SNAPSHOT_READ.
    let effects = server.client_disconnected(reader, Some(1));
    assert_eq!(effects.completed, vec![pending], "the writer's deferred write must become ready");
    assert!(effects.cancelled.is_empty());

    // A second write against a fresh chunk, this time deferred on the
    // writer's own read, must be dropped (not answered) when the writer
    // itself disconnects before the reader releases.
    let chunk2 = Chunk::new(4);
    util::fill_origin_chunk(&server, chunk2, 0x66);
    let other_reader: u64 = 3;
    match util::query_snapshot_read(&mut server, chunk2, bit, other_reader) {
        Reply::ReadFromOrigin { .. } => {}
        other => panic!("expected ReadFromOrigin, got {:?}", other),
    }
    let pending2 = match dispatch(&mut server, OpCode::QueryWrite { chunk: chunk2, snapbit: None }, writer) {
        Reply::WriteDeferred(d) => d.pending,
        other => panic!("expected WriteDeferred, got {:?}", other),
    };

    let writer_gone = server.client_disconnected(writer, None);
    assert!(writer_gone.completed.is_empty());
    assert_eq!(writer_gone.cancelled, vec![pending2]);

    // The reader releasing afterward must not report the already-cancelled
    // write as ready — there is no one left to answer it.
    let ready = server.release_read_lock(chunk2, other_reader);
    assert!(ready.is_empty());
}
