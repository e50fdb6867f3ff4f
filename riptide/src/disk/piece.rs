use std::{
    collections::HashSet,
    io::{Read, Seek, Write},
    net::SocketAddr,
    sync::Arc,
};
use sha1::{Digest, Sha1};
use crate::{block::Block, BLOCK_SIZE, ID};
use super::{storage::StorageFile, DiskError, Result};

// Staging buffer for one in-flight piece. Invisible to the picker's
// have set until it verifies and hits the disk.
#[derive(Debug)]
pub struct PieceBuf {

    // Expected hash from the metainfo.
    pub hash: ID,

    pub len: usize,

    pub data: Vec<u8>,

    // Tracks duplicate block arrivals (endgame).
    pub blocks_received: Vec<bool>,

    pub num_blocks_received: usize,

    // Peers that supplied blocks, for the strike system.
    pub contributors: HashSet<SocketAddr>,

}

impl PieceBuf {

    pub fn add_block(&mut self, block: &Block, from: SocketAddr) {
        let block_idx = block.offset / BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::warn!(
                "duplicate block in piece {} at offset {}",
                block.piece_idx,
                block.offset
            );
            return;
        }
        self.blocks_received[block_idx] = true;
        self.num_blocks_received += 1;
        self.contributors.insert(from);
        let data = block.bytes.as_slice();
        self.data[block.offset..block.offset + data.len()].copy_from_slice(data);
    }

    pub fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len()
    }

    // Computationally expensive; runs on the blocking pool.
    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    // Write the piece across the files it intersects and flush file
    // data to stable storage.
    pub fn write(&self, piece_offset: usize, files: &[StorageFile]) -> Result<()> {

        let mut total_offset = piece_offset;
        let mut bytes_written = 0;

        for file in files {
            let f = file.file.write()?;

            let byte_range = file.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = self.len - bytes_written;
            let file_remaining = byte_range.end - total_offset;
            let chunk = piece_remaining.min(file_remaining);

            let mut f = &*f;
            f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
            f.write_all(&self.data[bytes_written..bytes_written + chunk])?;
            f.sync_data()?;

            total_offset += chunk;
            bytes_written += chunk;
        }

        if bytes_written != self.len {
            return Err(DiskError::IoSize {
                expected: self.len,
                actual: bytes_written,
            });
        }

        Ok(())
    }
}

// Read `len` contiguous bytes starting at a torrent-wide offset,
// split into block-sized shared chunks for the read cache.
pub fn read_piece(offset: usize, len: usize, files: &[StorageFile]) -> Result<Vec<Arc<Vec<u8>>>> {

    let mut bytes_read = 0;
    let mut total_offset = offset;
    let mut buf = vec![0; len];

    for file in files {
        let f = file.file.write()?;

        let byte_range = file.byte_range();
        let file_offset = total_offset
            .checked_sub(byte_range.start)
            .ok_or(DiskError::IoSize {
                expected: byte_range.start,
                actual: total_offset,
            })?;
        let piece_remaining = len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let chunk = piece_remaining.min(file_remaining);

        let mut f = &*f;
        f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        f.read_exact(&mut buf[bytes_read..bytes_read + chunk])?;

        bytes_read += chunk;
        total_offset += chunk;
    }

    if bytes_read != len {
        return Err(DiskError::IoSize {
            expected: len,
            actual: bytes_read,
        });
    }

    Ok(buf
        .chunks(BLOCK_SIZE)
        .map(|chunk| Arc::new(chunk.to_vec()))
        .collect())
}
