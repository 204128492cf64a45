//! Copy-out engine: moves the old contents of a chunk about to be
//! overwritten into a freshly allocated exception chunk before the write
//! lands, coalescing contiguous runs into one read/write pair.
//!
//! `source_chunk`'s top bit records which device the data came from (the
//! origin, or — when making a snapshot-private copy unique against the
//! snapshot it was cloned from — the snapshot/exception store itself), the
//! same encoding `chunk_highbit` uses in the original.

use log::trace;

use crate::block::{Chunk, ChunkGeometry};
use crate::device::BlockDevice;
use crate::errors::*;

const SOURCE_IS_SNAPDATA: u64 = 1 << 63;

/// Tags a source chunk as coming from the snapshot/exception store rather
/// than the origin.
pub fn source_from_snapdata(chunk: u64) -> u64 {
    chunk | SOURCE_IS_SNAPDATA
}

fn split_source(tagged: u64) -> (bool, u64) {
    (tagged & SOURCE_IS_SNAPDATA != 0, tagged & !SOURCE_IS_SNAPDATA)
}

/// Accumulates contiguous `(source_chunk, dest_exception)` pairs and only
/// actually reads/writes once a run breaks or the buffer is full, so that a
/// dense write pattern costs one big copy instead of many small ones.
pub struct CopyOutEngine {
    buf: Vec<u8>,
    max_chunks: usize,
    source_chunk: u64,
    dest_exception: Chunk,
    run_len: usize,
}

impl CopyOutEngine {
    pub fn new(geometry: ChunkGeometry, max_chunks: usize) -> Self {
        CopyOutEngine {
            buf: vec![0u8; geometry.block_bytes() * max_chunks],
            max_chunks,
            source_chunk: 0,
            dest_exception: Chunk::new(0),
            run_len: 0,
        }
    }

    /// Appends one `(chunk, exception)` pair to the pending run, flushing
    /// first if it doesn't extend the current run or the run is full.
    pub fn copyout(
        &mut self,
        tagged_source_chunk: u64,
        exception: Chunk,
        geometry: ChunkGeometry,
        origin: &dyn BlockDevice,
        snapdata: &dyn BlockDevice,
    ) -> Result<()> {
        let extends = self.run_len > 0
            && self.source_chunk + self.run_len as u64 == tagged_source_chunk
            && self.dest_exception + self.run_len as u64 == exception
            && self.run_len < self.max_chunks;
        if extends {
            self.run_len += 1;
            return Ok(());
        }
        self.finish(geometry, origin, snapdata)?;
        self.source_chunk = tagged_source_chunk;
        self.dest_exception = exception;
        self.run_len = 1;
        Ok(())
    }

    /// Flushes the pending run, if any.
    pub fn finish(
        &mut self,
        geometry: ChunkGeometry,
        origin: &dyn BlockDevice,
        snapdata: &dyn BlockDevice,
    ) -> Result<()> {
        if self.run_len == 0 {
            return Ok(());
        }
        let (is_snap, source) = split_source(self.source_chunk);
        let block_bytes = geometry.block_bytes();
        let size = block_bytes * self.run_len;
        let scratch = &mut self.buf[..size];

        trace!(
            "copy {} chunks from {}{:#x} to {:#x}",
            self.run_len,
            if is_snap { "snapshot " } else { "origin " },
            source,
            self.dest_exception.as_u64()
        );

        let source_bytes = geometry.chunk_to_sector(Chunk::new(source)).as_bytes();
        if is_snap {
            snapdata.read_at(scratch, source_bytes)?;
        } else {
            origin.read_at(scratch, source_bytes)?;
        }
        let dest_bytes = geometry.chunk_to_sector(self.dest_exception).as_bytes();
        snapdata.write_at(scratch, dest_bytes)?;

        self.run_len = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn contiguous_runs_coalesce_into_one_copy() {
        let geo = ChunkGeometry::new(3);
        let block = geo.block_bytes();
        let origin = MemDevice::new(block * 16);
        let snapdata = MemDevice::new(block * 16);
        for i in 0..16u64 {
            let mut buf = vec![i as u8; block];
            buf[0] = i as u8;
            origin
                .write_at(&buf, geo.chunk_to_sector(Chunk::new(i)).as_bytes())
                .unwrap();
        }

        let mut engine = CopyOutEngine::new(geo, 8);
        for i in 0..4u64 {
            engine.copyout(i, Chunk::new(100 + i), geo, &origin, &snapdata).unwrap();
        }
        engine.finish(geo, &origin, &snapdata).unwrap();

        for i in 0..4u64 {
            let mut out = vec![0u8; block];
            snapdata
                .read_at(&mut out, geo.chunk_to_sector(Chunk::new(100 + i)).as_bytes())
                .unwrap();
            assert_eq!(out[0], i as u8);
        }
    }

    #[test]
    fn non_contiguous_run_forces_a_flush() {
        let geo = ChunkGeometry::new(3);
        let block = geo.block_bytes();
        let origin = MemDevice::new(block * 16);
        let snapdata = MemDevice::new(block * 16);
        origin
            .write_at(&vec![7u8; block], geo.chunk_to_sector(Chunk::new(0)).as_bytes())
            .unwrap();
        origin
            .write_at(&vec![9u8; block], geo.chunk_to_sector(Chunk::new(5)).as_bytes())
            .unwrap();

        let mut engine = CopyOutEngine::new(geo, 8);
        engine.copyout(0, Chunk::new(50), geo, &origin, &snapdata).unwrap();
        engine.copyout(5, Chunk::new(51), geo, &origin, &snapdata).unwrap(); // not contiguous
        engine.finish(geo, &origin, &snapdata).unwrap();

        let mut out = vec![0u8; block];
        snapdata
            .read_at(&mut out, geo.chunk_to_sector(Chunk::new(50)).as_bytes())
            .unwrap();
        assert_eq!(out[0], 7);
        snapdata
            .read_at(&mut out, geo.chunk_to_sector(Chunk::new(51)).as_bytes())
            .unwrap();
        assert_eq!(out[0], 9);
    }
}
