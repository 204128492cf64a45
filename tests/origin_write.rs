//! Scenario (A): an origin write against chunks watched by more than one
//! live snapshot creates exactly one exception shared by all of them, and a
//! second write to the same chunk finds it already unique.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::Reply;

#[test]
fn origin_write_shares_one_exception_across_two_snapshots() {
    let mut server = util::build_store();
    util::create_snapshot(&mut server, 1, 1000, 10);
    util::create_snapshot(&mut server, 2, 1001, 10);

    let chunk = Chunk::new(5);
    util::fill_origin_chunk(&server, chunk, 0xAA);

    let exception = match util::query_write_origin(&mut server, chunk, 1) {
        Reply::WriteOk { exception: Some(c) } => c,
        other => panic!("expected a fresh exception, got {:?}", other),
    };

    let copied = util::read_exception_chunk(&server, exception);
    assert!(copied.iter().all(|&b| b == 0xAA), "old origin contents must be preserved before the overwrite");

    // The client's actual write now lands on the origin device directly.
    util::fill_origin_chunk(&server, chunk, 0xBB);

    // The chunk is already unique against every live snapshot: no new
    // exception is needed for a second write.
    match util::query_write_origin(&mut server, chunk, 1) {
        Reply::WriteOk { exception: None } => {}
        other => panic!("expected no new exception on a second write, got {:?}", other),
    }
}
