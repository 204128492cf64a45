//! Scenario: deleting a snapshot whose private exceptions span many leaves
//! (and more than one B-tree level) must still succeed in one call, and must
//! actually compact the tree back down rather than leaving a forest of
//! now-empty leaves behind.
//!
//! `util::build_store` deliberately uses a 4 KiB chunk geometry sized so
//! ordinary scenario tests never get near a leaf split, let alone the
//! journal's per-transaction commit limit. Exercising both the merge and the
//! mid-walk commit paths for real needs many more exceptions than is
//! reasonable at that geometry, so this test builds its own store on a much
//! smaller chunk size instead of going through `util::build_store`.

mod util;

use snapcore::block::{Chunk, ChunkGeometry};
use snapcore::device::{BlockDevice, MemDevice};
use snapcore::dispatch::{dispatch, OpCode, Reply};
use snapcore::server::SnapServer;

const SNAPSHOT_CHUNKS: u64 = 1536;

fn build_small_chunk_store() -> SnapServer {
    // sector_bits = 0: one 512-byte sector per chunk, the smallest geometry
    // `SnapServer::create` accepts (SB_SECTOR == 8 still lands on a whole
    // chunk boundary). Small chunks mean small leaves and a small
    // max_commit_blocks, so a delete spanning a few thousand chunks is
    // enough to force both leaf/node splits and a journal nowhere near big
    // enough to hold them all in a single transaction.
    let geo = ChunkGeometry::new(0);
    let block = geo.block_bytes();

    let metadata_chunks = 8192u64;
    let snapdata_chunks = SNAPSHOT_CHUNKS + 64;
    let origin_chunks = SNAPSHOT_CHUNKS + 64;

    let metadata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * metadata_chunks as usize));
    let snapdata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * snapdata_chunks as usize));
    let origin_sectors = origin_chunks * geo.sectors_per_chunk();
    let origin_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new((origin_sectors * 512) as usize));

    SnapServer::create(
        metadata_dev,
        snapdata_dev,
        origin_dev,
        geo,
        metadata_chunks,
        snapdata_chunks,
        origin_sectors,
        8,
        block * 128,
        6,
    )
    .expect("formatting a fresh small-chunk store must succeed")
}

fn fill_origin_chunk(server: &SnapServer, chunk: Chunk, byte: u8) {
    let buf = vec![byte; server.geometry.block_bytes()];
    server
        .origin_dev
        .write_at(&buf, server.geometry.chunk_to_sector(chunk).as_bytes())
        .expect("origin write");
}

#[test]
fn deleting_a_snapshot_across_many_leaves_compacts_the_tree_and_never_overflows_a_commit() {
    let mut server = build_small_chunk_store();
    let bit = util::create_snapshot(&mut server, 1, 1000, 10);

    let meta_free_before = server.sb.metadata_alloc.free_chunks();
    let snap_free_before = server.sb.snapdata_alloc.as_ref().unwrap().free_chunks();

    // Enough distinct, privately-written chunks to blow well past a single
    // leaf's directory and past the journal's per-transaction limit, so the
    // walk must both merge leaves back together and commit more than once.
    for i in 0..SNAPSHOT_CHUNKS {
        let chunk = Chunk::new(i);
        fill_origin_chunk(&server, chunk, 0x5a);
        match util::query_write_snapshot(&mut server, chunk, bit, 1) {
            Reply::WriteOk { exception: Some(_) } => {}
            other => panic!("expected WriteOk for chunk {}, got {:?}", i, other),
        }
    }

    assert!(
        server.sb.etree_levels >= 1,
        "{} distinct exceptions at this chunk size must have forced at least one leaf split",
        SNAPSHOT_CHUNKS
    );

    match dispatch(&mut server, OpCode::DeleteSnapshot { tag: 1 }, 0) {
        Reply::SnapshotDeleted => {}
        other => panic!(
            "delete spanning {} chunks must succeed in one call, not {:?}",
            SNAPSHOT_CHUNKS, other
        ),
    }

    assert_eq!(
        server.sb.etree_levels, 0,
        "deleting the sole snapshot must empty every leaf, and compaction must merge them all back under one root leaf"
    );
    assert_eq!(
        server.sb.metadata_alloc.free_chunks(),
        meta_free_before,
        "every metadata chunk burned by splitting must come back once the leaves merge back down"
    );
    assert_eq!(
        server.sb.snapdata_alloc.as_ref().unwrap().free_chunks(),
        snap_free_before,
        "deleting the only owner of every exception must reclaim all of their chunks"
    );

    let tags: Vec<u32> = server.list_snapshots().iter().map(|s| s.tag).collect();
    assert!(tags.is_empty(), "deleted snapshot must no longer be listed");
}
