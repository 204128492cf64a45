//! `STREAM_CHANGELIST`: a full-tree walk reporting every chunk where two
//! snapshots' exceptions disagree, the input an external delta/replication
//! tool builds its transfer list from.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::{dispatch, OpCode, Reply};

#[test]
fn changelist_reports_only_chunks_where_the_two_tags_diverge() {
    let mut server = util::build_store();
    let bit1 = util::create_snapshot(&mut server, 1, 1000, 10);
    let bit2 = util::create_snapshot(&mut server, 2, 1001, 10);

    // Chunk 5: an origin write shared by both snapshots. Both see the same
    // pre-write bytes through the same exception, so this chunk must not
    // show up in the diff between tag 1 and tag 2.
    let shared_chunk = Chunk::new(5);
    util::fill_origin_chunk(&server, shared_chunk, 0xAA);
    util::query_write_origin(&mut server, shared_chunk, 9);

    // Chunk 7: a private write under snapshot 1 only. Snapshot 2 still sees
    // the origin directly, so this chunk must show up as changed.
    let private_chunk = Chunk::new(7);
    util::fill_origin_chunk(&server, private_chunk, 0xBB);
    util::query_write_snapshot(&mut server, private_chunk, bit1, 1);

    let chunks = match dispatch(&mut server, OpCode::StreamChangelist { from_tag: 1, to_tag: 2 }, 0) {
        Reply::Changelist(chunks) => chunks,
        other => panic!("expected Changelist, got {:?}", other),
    };

    assert_eq!(chunks, vec![private_chunk.as_u64()]);
    let _ = bit2;
}

#[test]
fn changelist_against_unknown_tag_is_an_error() {
    let mut server = util::build_store();
    util::create_snapshot(&mut server, 1, 1000, 10);

    match dispatch(&mut server, OpCode::StreamChangelist { from_tag: 1, to_tag: 99 }, 0) {
        Reply::Error(_) => {}
        other => panic!("expected an error for an unknown tag, got {:?}", other),
    }
}

#[test]
fn changelist_against_squashed_tag_is_rejected() {
    let mut server = util::build_store_with_snapdata(1);
    let bit = util::create_snapshot(&mut server, 1, 1000, 0);
    let pinned = util::create_snapshot(&mut server, 2, 1001, snapcore::snapshot::PRIORITY_NEVER_DROP);

    util::fill_origin_chunk(&server, Chunk::new(1), 0x01);
    util::query_write_snapshot(&mut server, Chunk::new(1), bit, 1);
    util::fill_origin_chunk(&server, Chunk::new(2), 0x02);
    // Exhausts the lone snapdata chunk, squashing snapshot 1 to make room.
    util::query_write_snapshot(&mut server, Chunk::new(2), pinned, 1);

    match dispatch(&mut server, OpCode::StreamChangelist { from_tag: 1, to_tag: 2 }, 0) {
        Reply::Error(_) => {}
        other => panic!("expected squashed tag 1 to be rejected, got {:?}", other),
    }
}
