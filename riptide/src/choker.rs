use std::net::SocketAddr;
use std::time::Duration;
use rand::Rng;

// One choke round every ten seconds; the optimistic slot rotates every
// third round.
pub const CHOKE_INTERVAL: Duration = Duration::from_secs(10);
const OPTIMISTIC_ROTATION: u64 = 3;

// Regular unchoke slots.
const UPLOAD_SLOTS: usize = 4;

// A peer as the choker sees it: its recent rate in the direction that
// matters (download while leeching, upload while seeding) and whether
// it wants anything from us.
#[derive(Debug, Clone)]
pub struct ChokeCandidate {

    pub address: SocketAddr,

    pub rate: u64,

    pub interested: bool,

}

#[derive(Debug, Default)]
pub struct ChokeDecision {

    pub unchoke: Vec<SocketAddr>,

    pub choke: Vec<SocketAddr>,

}

#[derive(Debug, Default)]
pub struct Choker {

    round: u64,

    optimistic: Option<SocketAddr>,

}

impl Choker {

    // Rank interested peers by rate; the top four get the regular
    // slots and one additional choked peer is unchoked optimistically.
    pub fn run_round(
        &mut self,
        mut candidates: Vec<ChokeCandidate>,
        rng: &mut impl Rng,
    ) -> ChokeDecision {

        self.round += 1;
        candidates.sort_by(|a, b| b.rate.cmp(&a.rate));

        let mut unchoke: Vec<SocketAddr> = candidates
            .iter()
            .filter(|c| c.interested)
            .take(UPLOAD_SLOTS)
            .map(|c| c.address)
            .collect();

        // Keep the optimistic pick between rotations as long as the
        // peer is still around.
        if self.round % OPTIMISTIC_ROTATION == 1 || !self.still_present(&candidates) {
            let pool: Vec<SocketAddr> = candidates
                .iter()
                .filter(|c| c.interested && !unchoke.contains(&c.address))
                .map(|c| c.address)
                .collect();
            self.optimistic = if pool.is_empty() {
                None
            } else {
                Some(pool[rng.gen_range(0..pool.len())])
            };
        }
        if let Some(optimistic) = self.optimistic {
            if !unchoke.contains(&optimistic) {
                unchoke.push(optimistic);
            }
        }

        let choke = candidates
            .iter()
            .map(|c| c.address)
            .filter(|addr| !unchoke.contains(addr))
            .collect();

        ChokeDecision { unchoke, choke }
    }

    fn still_present(&self, candidates: &[ChokeCandidate]) -> bool {
        match self.optimistic {
            Some(addr) => candidates.iter().any(|c| c.address == addr),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use rand::{rngs::StdRng, SeedableRng};

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().expect("valid address")
    }

    fn candidates(rates: &[(u8, u64)]) -> Vec<ChokeCandidate> {
        rates
            .iter()
            .map(|(n, rate)| ChokeCandidate {
                address: addr(*n),
                rate: *rate,
                interested: true,
            })
            .collect()
    }

    #[test]
    fn test_top_four_unchoked() {
        let mut choker = Choker::default();
        let mut rng = StdRng::seed_from_u64(1);
        let decision = choker.run_round(
            candidates(&[(1, 100), (2, 90), (3, 80), (4, 70), (5, 10), (6, 5)]),
            &mut rng,
        );
        for n in 1..=4 {
            assert!(decision.unchoke.contains(&addr(n)));
        }
        // Four regulars plus at most one optimistic.
        assert!(decision.unchoke.len() <= 5);
        assert_eq!(decision.unchoke.len() + decision.choke.len(), 6);
    }

    #[test]
    fn test_uninterested_peers_get_no_slot() {
        let mut choker = Choker::default();
        let mut rng = StdRng::seed_from_u64(2);
        let mut cands = candidates(&[(1, 100), (2, 90)]);
        cands[0].interested = false;
        let decision = choker.run_round(cands, &mut rng);
        assert!(!decision.unchoke.contains(&addr(1)));
        assert!(decision.unchoke.contains(&addr(2)));
    }

    // Over a minute with more interested peers than slots, rotation
    // must reach everyone.
    #[test]
    fn test_optimistic_rotation_reaches_all_peers() {
        let mut choker = Choker::default();
        let mut rng = StdRng::seed_from_u64(42);
        let cands = candidates(&[(1, 100), (2, 90), (3, 80), (4, 70), (5, 10), (6, 5), (7, 1)]);

        let mut ever_unchoked: HashSet<SocketAddr> = HashSet::new();
        for _ in 0..90 {
            let decision = choker.run_round(cands.clone(), &mut rng);
            ever_unchoked.extend(decision.unchoke.iter().copied());
        }
        for n in 1..=7 {
            assert!(
                ever_unchoked.contains(&addr(n)),
                "peer {} never unchoked",
                n
            );
        }
    }

    #[test]
    fn test_optimistic_held_between_rotations() {
        let mut choker = Choker::default();
        let mut rng = StdRng::seed_from_u64(3);
        let cands = candidates(&[(1, 100), (2, 90), (3, 80), (4, 70), (5, 10), (6, 5)]);

        let first = choker.run_round(cands.clone(), &mut rng);
        let optimistic = choker.optimistic.expect("an optimistic pick exists");
        assert!(first.unchoke.contains(&optimistic));
        // Rounds 2 and 3 keep the same pick.
        for _ in 0..2 {
            let decision = choker.run_round(cands.clone(), &mut rng);
            assert!(decision.unchoke.contains(&optimistic));
            assert_eq!(choker.optimistic, Some(optimistic));
        }
    }
}
