//! Shared fixture for the end-to-end scenario tests: builds a throwaway
//! store entirely on [`MemDevice`]s and hands back the driver plus its raw
//! devices, mirroring the teacher's own `tests/src/util` pattern of building
//! a disposable database and handing the test a driver to call through.

use snapcore::block::{Chunk, ChunkGeometry};
use snapcore::device::{BlockDevice, MemDevice};
use snapcore::dispatch::{dispatch, OpCode, Reply};
use snapcore::readlock::ClientId;
use snapcore::server::SnapServer;

pub const JOURNAL_CHUNKS: u32 = 8;
pub const METADATA_CHUNKS: u64 = 512;
pub const SNAPDATA_CHUNKS: u64 = 512;
pub const ORIGIN_CHUNKS: u64 = 64;

pub fn geometry() -> ChunkGeometry {
    ChunkGeometry::new(3) // 8 sectors = 4 KiB chunks, the only geometry SB_SECTOR assumes
}

/// Formats a fresh store with separate metadata/snapdata/origin devices,
/// all backed by memory, sized generously enough that no scenario here runs
/// the allocator dry by accident.
pub fn build_store() -> SnapServer {
    let geo = geometry();
    let block = geo.block_bytes();

    let metadata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * METADATA_CHUNKS as usize));
    let snapdata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * SNAPDATA_CHUNKS as usize));
    let origin_sectors = ORIGIN_CHUNKS * geo.sectors_per_chunk();
    let origin_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new((origin_sectors * 512) as usize));

    SnapServer::create(
        metadata_dev,
        snapdata_dev,
        origin_dev,
        geo,
        METADATA_CHUNKS,
        SNAPDATA_CHUNKS,
        origin_sectors,
        JOURNAL_CHUNKS,
        block * 64,
        6,
    )
    .expect("formatting a fresh store must succeed")
}

/// Formats a store with a deliberately tiny snapdata region, so a handful
/// of exception-creating writes is enough to run the allocator dry and
/// exercise the victim-selection path in [`SnapServer::make_unique`].
pub fn build_store_with_snapdata(snapdata_chunks: u64) -> SnapServer {
    let geo = geometry();
    let block = geo.block_bytes();

    let metadata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * METADATA_CHUNKS as usize));
    let snapdata_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new(block * snapdata_chunks as usize));
    let origin_sectors = ORIGIN_CHUNKS * geo.sectors_per_chunk();
    let origin_dev: Box<dyn BlockDevice> = Box::new(MemDevice::new((origin_sectors * 512) as usize));

    SnapServer::create(
        metadata_dev,
        snapdata_dev,
        origin_dev,
        geo,
        METADATA_CHUNKS,
        snapdata_chunks,
        origin_sectors,
        JOURNAL_CHUNKS,
        block * 64,
        6,
    )
    .expect("formatting a fresh small-snapdata store must succeed")
}

/// Writes `byte` across a whole chunk's worth of origin data, the same way
/// a real client's write would land once the server had already answered
/// `QueryWrite` for that chunk.
pub fn fill_origin_chunk(server: &SnapServer, chunk: Chunk, byte: u8) {
    let geo = geometry();
    let buf = vec![byte; geo.block_bytes()];
    server
        .origin_dev
        .write_at(&buf, geo.chunk_to_sector(chunk).as_bytes())
        .expect("origin write");
}

/// Writes `byte` across a whole exception chunk, the way a snapshot-private
/// write actually lands: the client writes directly to the address
/// `QuerySnapshotRead` handed back, never to the origin device.
pub fn write_exception_chunk(server: &SnapServer, chunk: Chunk, byte: u8) {
    let geo = geometry();
    let buf = vec![byte; geo.block_bytes()];
    server
        .snapdata_dev
        .write_at(&buf, geo.chunk_to_sector(chunk).as_bytes())
        .expect("snapdata write");
}

pub fn read_exception_chunk(server: &SnapServer, chunk: Chunk) -> Vec<u8> {
    let geo = geometry();
    let mut buf = vec![0u8; geo.block_bytes()];
    server
        .snapdata_dev
        .read_at(&mut buf, geo.chunk_to_sector(chunk).as_bytes())
        .expect("snapdata read");
    buf
}

pub fn query_write_origin(server: &mut SnapServer, chunk: Chunk, client: ClientId) -> Reply {
    dispatch(server, OpCode::QueryWrite { chunk, snapbit: None }, client)
}

/// A write scoped to one snapshot: the client is about to overwrite its own
/// view of `chunk`, which must carve out (or find already carved out) a
/// private exception before the write may land.
pub fn query_write_snapshot(server: &mut SnapServer, chunk: Chunk, snapbit: u8, client: ClientId) -> Reply {
    dispatch(server, OpCode::QueryWrite { chunk, snapbit: Some(snapbit) }, client)
}

/// A snapshot *read*: the read-only `test_unique` path. Returns
/// `Reply::ReadOk` if `chunk` already has an exception for `snapbit`, or
/// `Reply::ReadFromOrigin` (with a readlock now held on the caller's
/// behalf) if it must be read straight from the origin device.
pub fn query_snapshot_read(server: &mut SnapServer, chunk: Chunk, snapbit: u8, client: ClientId) -> Reply {
    dispatch(server, OpCode::QuerySnapshotRead { chunk, snapbit }, client)
}

pub fn create_snapshot(server: &mut SnapServer, tag: u32, ctime: u32, prio: i8) -> u8 {
    match dispatch(server, OpCode::CreateSnapshot { tag, ctime, prio }, 0) {
        Reply::SnapshotCreated { bit } => bit,
        other => panic!("expected SnapshotCreated, got {:?}", other),
    }
}
