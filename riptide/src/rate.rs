use tokio::{
    sync::Mutex,
    time::{self, Duration, Instant},
};

// Minimum burst: one second of rate but never less than 64 KiB.
const MIN_CAPACITY: u64 = 64 * 1024;

// Empty buckets are re-checked at 10 Hz.
const REFILL_PERIOD: Duration = Duration::from_millis(100);

// Speed settings use the decimal convention throughout.
pub fn mbps_to_bytes(mbps: u64) -> u64 {
    mbps * 1_000_000 / 8
}

// Token bucket for one transfer direction. `None` means unlimited and
// bypasses accounting entirely.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    rate: Option<u64>,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {

    fn capacity(&self) -> f64 {
        match self.rate {
            Some(rate) => rate.max(MIN_CAPACITY) as f64,
            None => f64::INFINITY,
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate as f64).min(self.capacity());
        }
        self.last_refill = now;
    }
}

impl RateLimiter {

    pub fn new(rate: Option<u64>) -> Self {
        // Starts full so short transfers are not penalised.
        let tokens = match rate {
            Some(r) => r.max(MIN_CAPACITY) as f64,
            None => 0.0,
        };
        RateLimiter {
            bucket: Mutex::new(Bucket {
                rate,
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        RateLimiter::new(None)
    }

    // Applied live; surplus tokens above the new capacity are dropped.
    pub async fn set_rate(&self, rate: Option<u64>) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.rate = rate;
        let cap = bucket.capacity();
        if bucket.tokens > cap {
            bucket.tokens = cap;
        }
    }

    // Take up to `want` tokens, suspending while the bucket is empty.
    // Returns how many were granted, at least 1.
    pub async fn acquire(&self, want: usize) -> usize {
        debug_assert!(want > 0);
        loop {
            {
                let mut bucket = self.bucket.lock().await;
                if bucket.rate.is_none() {
                    return want;
                }
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    let take = (bucket.tokens as usize).min(want);
                    bucket.tokens -= take as f64;
                    return take;
                }
            }
            time::sleep(REFILL_PERIOD).await;
        }
    }

    // Block until `len` tokens in total have been granted.
    pub async fn acquire_all(&self, len: usize) {
        let mut remaining = len;
        while remaining > 0 {
            remaining -= self.acquire(remaining).await;
        }
    }
}

// Download and upload buckets for one scope (global or per torrent).
#[derive(Debug)]
pub struct RatePair {

    pub down: RateLimiter,

    pub up: RateLimiter,

}

impl RatePair {

    pub fn new(down: Option<u64>, up: Option<u64>) -> Self {
        RatePair {
            down: RateLimiter::new(down),
            up: RateLimiter::new(up),
        }
    }

    pub fn unlimited() -> Self {
        RatePair::new(None, None)
    }
}
