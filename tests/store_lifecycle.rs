//! Scenario (E): the on-disk `BUSY` flag gates recovery. A store left
//! attached (no clean `shutdown`) comes back `Busy` to a strict reopen and
//! needs journal replay; a store that shut down cleanly reopens straight
//! away, with every snapshot and exception chunk intact either way.

mod util;

use snapcore::block::Chunk;
use snapcore::dispatch::Reply;
use snapcore::server::SnapServer;
use snapcore::superblock::Superblock;

#[test]
fn busy_flag_forces_recovery_on_reopen_after_an_unclean_attach() {
    let mut server = util::build_store();
    util::create_snapshot(&mut server, 1, 1000, 10);
    let bit1 = util::create_snapshot(&mut server, 2, 1001, 10);

    let chunk = Chunk::new(9);
    util::fill_origin_chunk(&server, chunk, 0x77);
    let exception = match util::query_write_snapshot(&mut server, chunk, bit1, 1) {
        Reply::WriteOk { exception: Some(c) } => c,
        other => panic!("expected WriteOk, got {:?}", other),
    };

    // A periodic checkpoint, but no clean shutdown: BUSY stays set, as if
    // the process had died right here.
    server.save_state().expect("checkpoint must succeed");

    let block = util::geometry().block_bytes();
    let SnapServer { metadata_dev, snapdata_dev, origin_dev, .. } = server;

    match Superblock::load(metadata_dev.as_ref(), snapdata_dev.as_ref(), block, false) {
        Err(_) => {}
        Ok(_) => panic!("a store left BUSY must refuse a strict reopen"),
    }

    let mut reopened = SnapServer::open(metadata_dev, snapdata_dev, origin_dev, util::geometry(), block * 64, 6)
        .expect("open must replay the journal and succeed despite the stale BUSY flag");

    let tags: Vec<u32> = reopened.list_snapshots().iter().map(|s| s.tag).collect();
    assert_eq!(tags, vec![1, 2], "both snapshots must survive the reopen");

    let copied = util::read_exception_chunk(&reopened, exception);
    assert!(copied.iter().all(|&b| b == 0x77), "the exception written before the checkpoint must survive recovery");

    // Snapshot 2's bit is still unique against that exception after reopen.
    match util::query_write_snapshot(&mut reopened, chunk, bit1, 1) {
        Reply::WriteOk { exception: Some(c) } => assert_eq!(c, exception),
        other => panic!("expected WriteOk, got {:?}", other),
    }
}

#[test]
fn clean_shutdown_clears_busy_and_skips_recovery() {
    let mut server = util::build_store();
    util::create_snapshot(&mut server, 1, 1000, 10);
    server.shutdown().expect("clean shutdown must succeed");

    let block = util::geometry().block_bytes();
    let SnapServer { metadata_dev, snapdata_dev, origin_dev, .. } = server;

    let sb = Superblock::load(metadata_dev.as_ref(), snapdata_dev.as_ref(), block, false)
        .expect("a cleanly shut down store must reopen under a strict load");
    assert!(!sb.is_busy());

    let reopened = SnapServer::open(metadata_dev, snapdata_dev, origin_dev, util::geometry(), block * 64, 6)
        .expect("reopen after a clean shutdown must succeed");
    assert_eq!(reopened.list_snapshots().len(), 1);
}
