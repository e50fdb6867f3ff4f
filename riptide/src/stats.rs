// Per-direction transfer counters. The rolling average feeds the choke
// ranking, so its window tracks the choker's 20 second horizon.
const AVG_WINDOW_TICKS: u64 = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn tick(&mut self) {
        self.up.tick();
        self.down.tick();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Close out one second of accounting.
    pub fn tick(&mut self) {
        let w = AVG_WINDOW_TICKS as f64;
        self.avg = (self.avg * (w - 1.0) / w) + (self.round as f64 / w);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}
