use rand::Rng;
use crate::Bitfield;

/*
Pieces are downloaded in rarest-first order, determined by keeping a
running availability count per piece: the initial bitfield from each
peer, updated with every have message. Rarest-first must randomise
between equally-rare pieces, otherwise a swarm of clients would all
pile onto the same piece. Before the client has anything to trade it
picks at random instead, to complete a first few pieces quickly.
*/

// Below this many verified pieces selection is uniformly random.
const RANDOM_PICK_THRESHOLD: usize = 4;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of connected peers advertising this piece.
    availability: usize,
    // Whether a partial piece currently exists for it.
    in_progress: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceInfo>,
    // The pieces we have verified on disk.
    have: Bitfield,
}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn num_verified(&self) -> usize {
        self.have.count_ones()
    }

    // Returns true if the peer has at least one piece we lack.
    pub fn register_bitfield(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        for (idx, has) in bf.iter().enumerate() {
            if *has {
                self.pieces[idx].availability += 1;
                if !self.have[idx] {
                    interested = true;
                }
            }
        }
        interested
    }

    // Availability goes with the peer when it disconnects.
    pub fn unregister_bitfield(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        for (idx, has) in bf.iter().enumerate() {
            if *has {
                self.pieces[idx].availability =
                    self.pieces[idx].availability.saturating_sub(1);
            }
        }
    }

    // A have message; returns true if this makes the peer interesting.
    pub fn peer_has(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].availability += 1;
        !self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].in_progress = false;
    }

    // Resume verification failed: the piece needs downloading again.
    pub fn demote(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, false);
    }

    pub fn abandon(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].in_progress = false;
    }

    // True when every piece we lack is already being downloaded; the
    // endgame precondition together with there being no free blocks.
    pub fn all_missing_in_progress(&self) -> bool {
        (0..self.pieces.len())
            .all(|idx| self.have[idx] || self.pieces[idx].in_progress)
    }

    // Choose the next piece to open for this peer, marking it
    // in-progress. None when the peer has nothing useful.
    pub fn pick_piece(&mut self, bf: &Bitfield, rng: &mut impl Rng) -> Option<usize> {

        let candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&idx| {
                !self.have[idx]
                    && !self.pieces[idx].in_progress
                    && self.pieces[idx].availability > 0
                    && bf[idx]
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let picked = if self.num_verified() < RANDOM_PICK_THRESHOLD {
            candidates[rng.gen_range(0..candidates.len())]
        } else {
            let rarest = candidates
                .iter()
                .map(|&idx| self.pieces[idx].availability)
                .min()
                .expect("candidates is non-empty");
            let ties: Vec<usize> = candidates
                .into_iter()
                .filter(|&idx| self.pieces[idx].availability == rarest)
                .collect();
            ties[rng.gen_range(0..ties.len())]
        };

        self.pieces[picked].in_progress = true;
        Some(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn full_bitfield(n: usize) -> Bitfield {
        BitVec::repeat(true, n)
    }

    #[test]
    fn test_availability_tracking() {
        let mut picker = PiecePicker::new(4);
        let bf = full_bitfield(4);
        assert!(picker.register_bitfield(&bf));
        assert!(picker.peer_has(2));
        picker.received_piece(2);
        assert!(!picker.peer_has(2));
        picker.unregister_bitfield(&bf);
        // All availability gone, nothing to pick.
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(picker.pick_piece(&bf, &mut rng), None);
    }

    #[test]
    fn test_rarest_first_once_bootstrapped() {
        let mut picker = PiecePicker::new(8);
        // Four pieces verified puts us past the random phase.
        for idx in 0..4 {
            picker.received_piece(idx);
        }
        // Piece 6 is the unique rarest of the remainder.
        let mut common = full_bitfield(8);
        common.set(6, false);
        picker.register_bitfield(&common);
        picker.register_bitfield(&common);
        picker.register_bitfield(&full_bitfield(8));

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(picker.pick_piece(&full_bitfield(8), &mut rng), Some(6));
    }

    #[test]
    fn test_pick_respects_peer_bitfield() {
        let mut picker = PiecePicker::new(4);
        picker.register_bitfield(&full_bitfield(4));
        let mut bf = Bitfield::new();
        bf.resize(4, false);
        bf.set(3, true);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(picker.pick_piece(&bf, &mut rng), Some(3));
        // Now in progress, nothing else the peer can offer.
        assert_eq!(picker.pick_piece(&bf, &mut rng), None);
    }

    #[test]
    fn test_demote_reopens_piece() {
        let mut picker = PiecePicker::new(2);
        picker.register_bitfield(&full_bitfield(2));
        picker.received_piece(0);
        picker.received_piece(1);
        assert!(picker.all());
        picker.demote(1);
        assert!(!picker.all());
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(picker.pick_piece(&full_bitfield(2), &mut rng), Some(1));
    }
}
