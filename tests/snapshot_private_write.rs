//! Scenario (B), continuing scenario (A) in `origin_write.rs`: a
//! snapshot-private write against a chunk that already has a shared
//! exception splits it — the old exception loses the writing snapshot's
//! bit, and a brand-new exception private to that snapshot takes its place.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::Reply;

#[test]
fn private_write_splits_an_existing_shared_exception() {
    let mut server = util::build_store();
    let bit10 = util::create_snapshot(&mut server, 10, 1000, 10);
    let bit20 = util::create_snapshot(&mut server, 20, 1001, 10);

    let chunk = Chunk::new(7);
    util::fill_origin_chunk(&server, chunk, 0xAA);

    // Scenario (A): the origin write creates one exception shared by both
    // snapshots.
    let shared = match util::query_write_origin(&mut server, chunk, 1) {
        Reply::WriteOk { exception: Some(c) } => c,
        other => panic!("expected a fresh shared exception, got {:?}", other),
    };

    // Scenario (B): writing under snapshot 10 finds the chunk not unique
    // against bit 10 (the shared exception still covers it) and carves out
    // a private exception, leaving the shared one to snapshot 20 alone.
    let private = match util::query_write_snapshot(&mut server, chunk, bit10, 2) {
        Reply::WriteOk { exception: Some(c) } => c,
        other => panic!("expected WriteOk, got {:?}", other),
    };
    assert_ne!(private, shared, "splitting a shared exception must allocate a new physical chunk");

    // The client's actual write lands on the freshly carved-out exception.
    util::write_exception_chunk(&server, private, 0xCC);

    // Snapshot 10 now resolves straight to its private exception (already
    // unique, no further split needed) ...
    match util::query_write_snapshot(&mut server, chunk, bit10, 2) {
        Reply::WriteOk { exception: Some(c) } => assert_eq!(c, private),
        other => panic!("expected WriteOk, got {:?}", other),
    }
    let latest = util::read_exception_chunk(&server, private);
    assert!(latest.iter().all(|&b| b == 0xCC), "snapshot 10 must see its own latest write");

    // ... while snapshot 20 still resolves to the original exception,
    // untouched, holding the first copy-out from before the split.
    match util::query_write_snapshot(&mut server, chunk, bit20, 3) {
        Reply::WriteOk { exception: Some(c) } => assert_eq!(c, shared),
        other => panic!("expected WriteOk, got {:?}", other),
    }
    let first_copyout = util::read_exception_chunk(&server, shared);
    assert!(first_copyout.iter().all(|&b| b == 0xAA), "snapshot 20 must still see the pre-write bytes");
}
