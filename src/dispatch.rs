//! Request opcodes and the typed replies they produce
//! (`dm-ddsnap.h`'s `csnap_codes`, trimmed to the data-path and
//! snapshot-lifecycle subset this engine implements — connection
//! handshaking, client-id upload, and delta-transfer opcodes are the
//! external messaging layer's job, not the engine's).
//!
//! `dispatch` only translates an [`OpCode`] + its request payload into a
//! call against [`crate::server::SnapServer`] and wraps the result as a
//! [`Reply`]; it owns no state of its own.

use thiserror::Error;

use crate::block::Chunk;
use crate::errors::Error as CoreError;
use crate::readlock::{ClientId, PendingId};
use crate::server::{DeferredWrite, OriginWrite, SnapServer};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// `snapbit = None` is an origin write (snaptag=-1 in the wire
    /// protocol); `Some(bit)` is a write scoped to one snapshot. Both rows
    /// of spec §4.7's `QUERY_WRITE` entry share this one opcode, same as
    /// the original distinguishes them only by the request's snaptag field.
    QueryWrite { chunk: Chunk, snapbit: Option<u8> },
    QuerySnapshotRead { chunk: Chunk, snapbit: u8 },
    FinishSnapshotRead { chunk: Chunk, client: ClientId },
    CreateSnapshot { tag: u32, ctime: u32, prio: i8 },
    DeleteSnapshot { tag: u32 },
    ListSnapshots,
    Status,
    Priority { tag: u32, prio: i8 },
    Usecount { tag: u32, delta: i32 },
    RequestOriginSectors,
    StreamChangelist { from_tag: u32, to_tag: u32 },
}

/// Typed protocol-level failures that cross back to a client as data
/// rather than as an internal `snapcore::Error` — these map to the
/// `*_ERROR` replies in the original wire protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("store is full")]
    Full,
    #[error("on-disk structure corrupt: {0}")]
    Corrupt(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ReplyError {
    fn from(e: CoreError) -> Self {
        use crate::errors::ErrorKind;
        match e.0 {
            ErrorKind::Full(_) => ReplyError::Full,
            ErrorKind::Protocol(msg) => ReplyError::Protocol(msg),
            ErrorKind::Corrupt(msg) => ReplyError::Corrupt(msg),
            other => ReplyError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The write may proceed immediately against this exception chunk (or
    /// the origin chunk itself, for an origin write that was already
    /// unique).
    WriteOk { exception: Option<Chunk> },
    /// A snapshot reader currently holds this chunk; the caller should
    /// park the request and answer it when the matching
    /// [`DeferredWrite`]'s pending id comes back ready.
    WriteDeferred(DeferredWrite),
    ReadOk { chunk: Chunk },
    /// `chunk` has no exception for the snapshot being read: the caller
    /// must satisfy this read from the origin device directly. The engine
    /// has already taken a readlock on `chunk` by the time this is
    /// returned, so the client must eventually answer with
    /// `FINISH_SNAPSHOT_READ` to release it.
    ReadFromOrigin { chunk: Chunk },
    /// A snapshot reader released `chunk`; `ready` lists any origin
    /// writes that were deferred on it (and possibly other chunks) and
    /// are now clear to retry.
    ReadFinished { ready: Vec<PendingId> },
    SnapshotCreated { bit: u8 },
    SnapshotDeleted,
    SnapshotList(Vec<Snapshot>),
    Status(StoreStatus),
    PriorityOk(i8),
    UsecountOk(u16),
    OriginSectors(u64),
    Changelist(Vec<u64>),
    Error(ReplyError),
}

/// Summary counters for the `STATUS` opcode, carried over from
/// `ddsnapd.c`'s status/snapinfo output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub metadata_chunks: u64,
    pub metadata_free: u64,
    pub snapdata_chunks: u64,
    pub snapdata_free: u64,
    pub snapshots: u32,
    pub etree_levels: u32,
}

/// Executes one request against `server`, translating its `Result` into a
/// `Reply` rather than letting an internal error escape the dispatch
/// boundary.
pub fn dispatch(server: &mut SnapServer, op: OpCode, client: ClientId) -> Reply {
    match op {
        OpCode::QueryWrite { chunk, snapbit: None } => match server.query_write_origin(chunk, client) {
            Ok(OriginWrite::Deferred(deferred)) => Reply::WriteDeferred(deferred),
            Ok(OriginWrite::Proceed(exception)) => Reply::WriteOk { exception },
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::QueryWrite { chunk, snapbit: Some(bit) } => match server.query_write_snapshot(chunk, bit) {
            Ok(exception) => Reply::WriteOk { exception: Some(exception) },
            Err(e) => Reply::Error(e.into()),
        },
        // test_unique (§4.4/§4.7): a pure read. If `chunk` already has an
        // exception for `snapbit`, hand it back with no lock and no
        // mutation. Only when it doesn't is this chunk still resolved from
        // the origin, so only then does the read take a lock — there is
        // nothing here for an origin write to race against until that
        // readlock exists.
        OpCode::QuerySnapshotRead { chunk, snapbit } => match server.test_unique_snapshot(chunk, snapbit) {
            Ok(Some(exception)) => Reply::ReadOk { chunk: exception },
            Ok(None) => {
                server.readlock_chunk(chunk, client);
                Reply::ReadFromOrigin { chunk }
            }
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::FinishSnapshotRead { chunk, client: holder } => {
            let ready = server.release_read_lock(chunk, holder);
            Reply::ReadFinished { ready }
        }
        OpCode::CreateSnapshot { tag, ctime, prio } => match server.create_snapshot(tag, ctime, prio) {
            Ok(bit) => Reply::SnapshotCreated { bit },
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::DeleteSnapshot { tag } => match server.delete_snapshot(tag) {
            Ok(()) => Reply::SnapshotDeleted,
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::ListSnapshots => Reply::SnapshotList(server.list_snapshots().to_vec()),
        OpCode::Status => Reply::Status(store_status(server)),
        OpCode::Priority { tag, prio } => match server.set_priority(tag, prio) {
            Ok(()) => Reply::PriorityOk(prio),
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::Usecount { tag, delta } => match server.add_usecount(tag, delta) {
            Ok(usecnt) => Reply::UsecountOk(usecnt),
            Err(e) => Reply::Error(e.into()),
        },
        OpCode::RequestOriginSectors => Reply::OriginSectors(server.sb.origin_sectors),
        OpCode::StreamChangelist { from_tag, to_tag } => match server.stream_changelist(from_tag, to_tag) {
            Ok(chunks) => Reply::Changelist(chunks),
            Err(e) => Reply::Error(e.into()),
        },
    }
}

fn store_status(server: &SnapServer) -> StoreStatus {
    let snapdata = server
        .sb
        .snapdata_alloc
        .as_ref()
        .unwrap_or(&server.sb.metadata_alloc);
    StoreStatus {
        metadata_chunks: server.sb.metadata_alloc.total_chunks(),
        metadata_free: server.sb.metadata_alloc.free_chunks(),
        snapdata_chunks: snapdata.total_chunks(),
        snapdata_free: snapdata.free_chunks(),
        snapshots: server.sb.snapshots.as_slice().len() as u32,
        etree_levels: server.sb.etree_levels,
    }
}
