use std::collections::HashSet;
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    BLOCK_SIZE,
};

// How many peers may hold the same block request in endgame.
pub const MAX_DUPLICATE_REQUESTS: u8 = 3;

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    #[default]
    Free,

    // Requested by this many peers; more than one only in endgame.
    Requested(u8),

    Received,

}

// What a received block meant for the piece.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Receipt {

    // First copy; `duplicates` is true when other peers still hold a
    // request for the same block and should be sent cancels.
    First { duplicates: bool },

    // Already had it, drop the payload.
    Duplicate,

}

#[derive(Debug)]
pub struct PartialPiece {

    pub idx: usize,

    pub len: usize,

    pub block_states: Vec<BlockState>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            block_states: vec![BlockState::default(); num_blocks(len)],
        }
    }

    fn block_info(&self, block_idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.idx,
            offset: block_idx * BLOCK_SIZE,
            len: block_len(self.len, block_idx),
        }
    }

    // One peer gave up on (or was told to cancel) its request.
    pub fn free_block(&mut self, block: &BlockInfo) {
        assert_eq!(block.piece_idx, self.idx);
        let state = &mut self.block_states[block.idx_in_piece()];
        *state = match *state {
            BlockState::Requested(1) => BlockState::Free,
            BlockState::Requested(n) => BlockState::Requested(n - 1),
            other => other,
        };
    }

    // Hash failure: the whole piece goes back to the pool.
    pub fn free_all_blocks(&mut self) {
        self.block_states
            .iter_mut()
            .for_each(|state| *state = BlockState::Free);
    }

    pub fn has_free_blocks(&self) -> bool {
        self.block_states
            .iter()
            .any(|state| *state == BlockState::Free)
    }

    pub fn received_block(&mut self, block: &BlockInfo) -> Receipt {
        let state = &mut self.block_states[block.idx_in_piece()];
        match *state {
            BlockState::Received => Receipt::Duplicate,
            BlockState::Requested(n) => {
                *state = BlockState::Received;
                Receipt::First { duplicates: n > 1 }
            }
            // A block we never asked for; the session filters these
            // against its own request set before we get here.
            BlockState::Free => {
                *state = BlockState::Received;
                Receipt::First { duplicates: false }
            }
        }
    }

    // Hand out blocks in ascending offset order. In endgame a block
    // already requested elsewhere may be handed out again, but never to
    // a peer that already holds it (the caller's `current` set).
    pub fn pick_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        current: &HashSet<BlockInfo>,
        endgame: bool,
    ) -> usize {
        let mut picked = 0;
        for block_idx in 0..self.block_states.len() {
            if picked == num {
                break;
            }
            let info = self.block_info(block_idx);
            match self.block_states[block_idx] {

                BlockState::Free => {
                    self.block_states[block_idx] = BlockState::Requested(1);
                    buf.push(info);
                    picked += 1;
                }

                BlockState::Requested(n) if endgame => {
                    if n < MAX_DUPLICATE_REQUESTS && !current.contains(&info) {
                        self.block_states[block_idx] = BlockState::Requested(n + 1);
                        buf.push(info);
                        picked += 1;
                    }
                }

                _ => {}
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_pick_and_receive() {
        let mut piece = PartialPiece::new(0, 3 * BLOCK_SIZE + 100);
        let mut buf = Vec::new();
        let picked = piece.pick_blocks(8, &mut buf, &HashSet::new(), false);
        assert_eq!(picked, 4);
        // Ascending offsets, last block short.
        assert_eq!(buf[0].offset, 0);
        assert_eq!(buf[3].offset, 3 * BLOCK_SIZE);
        assert_eq!(buf[3].len, 100);

        assert_eq!(
            piece.received_block(&buf[0]),
            Receipt::First { duplicates: false }
        );
        assert_eq!(piece.received_block(&buf[0]), Receipt::Duplicate);
    }

    #[test]
    fn test_no_free_blocks_outside_endgame() {
        let mut piece = PartialPiece::new(0, 2 * BLOCK_SIZE);
        let mut buf = Vec::new();
        piece.pick_blocks(2, &mut buf, &HashSet::new(), false);
        buf.clear();
        assert_eq!(piece.pick_blocks(2, &mut buf, &HashSet::new(), false), 0);
    }

    #[test]
    fn test_endgame_duplicates() {
        let mut piece = PartialPiece::new(0, 2 * BLOCK_SIZE);
        let mut first = Vec::new();
        piece.pick_blocks(2, &mut first, &HashSet::new(), false);

        // A second peer may double up on requested blocks.
        let mut second = Vec::new();
        assert_eq!(piece.pick_blocks(2, &mut second, &HashSet::new(), true), 2);
        assert_eq!(first, second);

        // But not a peer that already holds them.
        let holding: HashSet<BlockInfo> = first.iter().copied().collect();
        let mut third = Vec::new();
        assert_eq!(piece.pick_blocks(2, &mut third, &holding, true), 0);

        // First receipt reports outstanding duplicates.
        assert_eq!(
            piece.received_block(&first[0]),
            Receipt::First { duplicates: true }
        );
    }

    #[test]
    fn test_duplicate_cap() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE);
        let mut buf = Vec::new();
        for _ in 0..MAX_DUPLICATE_REQUESTS {
            buf.clear();
            assert_eq!(piece.pick_blocks(1, &mut buf, &HashSet::new(), true), 1);
        }
        buf.clear();
        assert_eq!(piece.pick_blocks(1, &mut buf, &HashSet::new(), true), 0);
    }

    #[test]
    fn test_free_block_decrements() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE);
        let mut buf = Vec::new();
        piece.pick_blocks(1, &mut buf, &HashSet::new(), false);
        piece.pick_blocks(1, &mut buf, &HashSet::new(), true);
        let block = buf[0];
        piece.free_block(&block);
        assert_eq!(piece.block_states[0], BlockState::Requested(1));
        piece.free_block(&block);
        assert_eq!(piece.block_states[0], BlockState::Free);
        assert!(piece.has_free_blocks());
    }
}
