use std::sync::Arc;
use crate::BLOCK_SIZE;

// Identifies a block on the wire: request and cancel payloads.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }
}

// Blocks served out of the disk read cache share their bytes between
// peers; blocks arriving off the wire own them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBytes {
    Owned(Vec<u8>),
    Shared(Arc<Vec<u8>>),
}

impl BlockBytes {

    pub fn len(&self) -> usize {
        match self {
            BlockBytes::Owned(data) => data.len(),
            BlockBytes::Shared(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockBytes::Owned(data) => data,
            BlockBytes::Shared(data) => data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {

    pub piece_idx: usize,

    pub offset: usize,

    pub bytes: BlockBytes,

}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.bytes.len(),
        }
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - block_idx * BLOCK_SIZE)
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + BLOCK_SIZE - 1) / BLOCK_SIZE
}
