use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;
use crate::{block::BlockInfo, Bitfield};

pub mod partial_piece;
pub mod piece_picker;

pub use partial_piece::Receipt;
use partial_piece::PartialPiece;
use piece_picker::PiecePicker;

// Block selection for a torrent: piece-level choice (availability,
// rarest-first) plus block-level bookkeeping within partial pieces.
// Peer sessions take blocks through pick_blocks and report receipts
// back; the coordinator resolves verified and rejected pieces.
#[derive(Debug)]
pub struct Picker {

    pub piece_picker: RwLock<PiecePicker>,

    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,

    // Cap on concurrently in-progress pieces, adjustable live.
    max_partial: AtomicU32,

    // Set once every remaining block is requested somewhere.
    endgame: AtomicBool,

    num_pieces: u32,

    piece_len: usize,

    last_piece_len: usize,

}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize, max_partial: u32) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            max_partial: AtomicU32::new(max_partial),
            endgame: AtomicBool::new(false),
            num_pieces,
            piece_len,
            last_piece_len,
        }
    }

    fn piece_len(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn set_max_partial(&self, max: u32) {
        self.max_partial.store(max, Ordering::Release);
    }

    pub fn in_endgame(&self) -> bool {
        self.endgame.load(Ordering::Acquire)
    }

    // Select up to `budget` block requests for a peer advertising `bf`,
    // excluding blocks in `current` (its outstanding requests).
    // In-progress pieces are drained before new ones are opened.
    pub async fn pick_blocks(
        &self,
        current: &HashSet<BlockInfo>,
        budget: usize,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {

        let mut requests = Vec::new();
        let mut remaining = budget.saturating_sub(current.len());
        if remaining == 0 {
            return requests;
        }

        let mut partial_pieces = self.partial_pieces.write().await;

        for partial in partial_pieces.values_mut() {
            if remaining == 0 {
                return requests;
            }
            let mut partial = partial.write().await;
            if !bf[partial.idx] {
                continue;
            }
            remaining -= partial.pick_blocks(remaining, &mut requests, current, false);
        }

        // Open new pieces while the in-progress cap allows.
        while remaining > 0 {
            let max_partial = self.max_partial.load(Ordering::Acquire) as usize;
            if partial_pieces.len() >= max_partial {
                break;
            }
            let picked = self
                .piece_picker
                .write()
                .await
                .pick_piece(bf, &mut rand::thread_rng());
            let Some(idx) = picked else {
                break;
            };
            tracing::trace!("opened piece {}", idx);
            let mut partial = PartialPiece::new(idx, self.piece_len(idx));
            remaining -= partial.pick_blocks(remaining, &mut requests, current, false);
            partial_pieces.insert(idx, partial.into());
        }

        // Endgame: once nothing is free anywhere, double up on blocks
        // still in flight so a straggler cannot stall completion.
        if remaining > 0 {
            if !self.in_endgame() {
                let all_in_progress =
                    self.piece_picker.read().await.all_missing_in_progress();
                let mut no_free = true;
                for partial in partial_pieces.values() {
                    if partial.read().await.has_free_blocks() {
                        no_free = false;
                        break;
                    }
                }
                if all_in_progress && no_free && !partial_pieces.is_empty() {
                    tracing::debug!("entering endgame");
                    self.endgame.store(true, Ordering::Release);
                }
            }
            if self.in_endgame() {
                // The peer must not be handed a block it already holds,
                // including ones picked earlier in this call.
                let mut held: HashSet<BlockInfo> = current.clone();
                held.extend(requests.iter().copied());
                for partial in partial_pieces.values_mut() {
                    if remaining == 0 {
                        break;
                    }
                    let mut partial = partial.write().await;
                    if !bf[partial.idx] {
                        continue;
                    }
                    remaining -= partial.pick_blocks(remaining, &mut requests, &held, true);
                }
            }
        }

        requests
    }

    // Returns None when the piece is no longer partial (already
    // verified and written, possible with endgame duplicates).
    pub async fn received_block(&self, block: &BlockInfo) -> Option<Receipt> {
        let partial_pieces = self.partial_pieces.read().await;
        let partial = partial_pieces.get(&block.piece_idx)?;
        let receipt = partial.write().await.received_block(block);
        Some(receipt)
    }

    // Return an unfulfilled request to the pool.
    pub async fn free_block(&self, block: &BlockInfo) {
        let partial_pieces = self.partial_pieces.read().await;
        if let Some(partial) = partial_pieces.get(&block.piece_idx) {
            partial.write().await.free_block(block);
        }
    }

    pub async fn piece_verified(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.received_piece(idx);
    }

    // Hash mismatch: every block goes back to the pool and endgame is
    // re-evaluated from scratch.
    pub async fn piece_rejected(&self, idx: usize) {
        let partial_pieces = self.partial_pieces.read().await;
        if let Some(partial) = partial_pieces.get(&idx) {
            partial.write().await.free_all_blocks();
        }
        self.endgame.store(false, Ordering::Release);
    }

    pub async fn own_bitfield(&self) -> Bitfield {
        self.piece_picker.read().await.own_bitfield().clone()
    }

    pub async fn missing_pieces(&self) -> usize {
        self.piece_picker.read().await.own_bitfield().count_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    fn full_bitfield(n: usize) -> Bitfield {
        BitVec::repeat(true, n)
    }

    #[tokio::test]
    async fn test_pick_blocks_unique_outside_endgame() {
        let picker = Picker::new(64, 2 * BLOCK_SIZE, 2 * BLOCK_SIZE, 60);
        let bf = full_bitfield(64);
        picker.piece_picker.write().await.register_bitfield(&bf);

        let first = picker.pick_blocks(&HashSet::new(), 8, &bf).await;
        let second = picker.pick_blocks(&HashSet::new(), 8, &bf).await;
        assert_eq!(first.len(), 8);
        assert_eq!(second.len(), 8);
        let all: HashSet<BlockInfo> = first.iter().chain(second.iter()).copied().collect();
        assert_eq!(all.len(), 16, "outstanding requests must not overlap");
    }

    #[tokio::test]
    async fn test_partial_pieces_bounded() {
        let picker = Picker::new(64, BLOCK_SIZE, BLOCK_SIZE, 4);
        let bf = full_bitfield(64);
        picker.piece_picker.write().await.register_bitfield(&bf);

        // One block per piece: a large budget would open many pieces
        // without the cap.
        let picked = picker.pick_blocks(&HashSet::new(), 16, &bf).await;
        assert_eq!(picked.len(), 4);
        assert_eq!(picker.partial_pieces.read().await.len(), 4);
    }

    #[tokio::test]
    async fn test_endgame_duplication_and_cancel_signal() {
        let picker = Picker::new(2, BLOCK_SIZE, BLOCK_SIZE, 60);
        let bf = full_bitfield(2);
        picker.piece_picker.write().await.register_bitfield(&bf);

        // Peer A requests both remaining blocks.
        let a = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(a.len(), 2);

        // Peer B doubles up on them in endgame.
        let b = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(b.len(), 2);
        assert!(picker.in_endgame());
        assert_eq!(
            a.iter().collect::<HashSet<_>>(),
            b.iter().collect::<HashSet<_>>()
        );

        // First receipt says other peers still hold the request.
        let receipt = picker.received_block(&a[0]).await.unwrap();
        assert_eq!(receipt, Receipt::First { duplicates: true });
        // The duplicate arriving later is flagged as such.
        let receipt = picker.received_block(&a[0]).await.unwrap();
        assert_eq!(receipt, Receipt::Duplicate);
    }

    #[tokio::test]
    async fn test_holder_does_not_double_its_own_request() {
        let picker = Picker::new(1, BLOCK_SIZE, BLOCK_SIZE, 60);
        let bf = full_bitfield(1);
        picker.piece_picker.write().await.register_bitfield(&bf);

        let mine = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(mine.len(), 1);
        let current: HashSet<BlockInfo> = mine.into_iter().collect();
        // Endgame now, but all remaining blocks are already ours.
        assert!(picker.pick_blocks(&current, 4, &bf).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_piece_is_repicked() {
        let picker = Picker::new(1, 2 * BLOCK_SIZE, 2 * BLOCK_SIZE, 60);
        let bf = full_bitfield(1);
        picker.piece_picker.write().await.register_bitfield(&bf);

        let first = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(first.len(), 2);
        for block in &first {
            picker.received_block(block).await;
        }

        picker.piece_rejected(0).await;
        let again = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(again.len(), 2);
        assert_eq!(
            first.iter().collect::<HashSet<_>>(),
            again.iter().collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_verified_piece_leaves_pool() {
        let picker = Picker::new(2, BLOCK_SIZE, BLOCK_SIZE, 60);
        let bf = full_bitfield(2);
        picker.piece_picker.write().await.register_bitfield(&bf);

        let blocks = picker.pick_blocks(&HashSet::new(), 4, &bf).await;
        assert_eq!(blocks.len(), 2);
        picker.piece_verified(blocks[0].piece_idx).await;
        assert_eq!(picker.missing_pieces().await, 1);
        assert!(picker
            .partial_pieces
            .read()
            .await
            .get(&blocks[0].piece_idx)
            .is_none());
    }
}
