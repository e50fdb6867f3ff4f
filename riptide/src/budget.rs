use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tokio::sync::Notify;

// Counted gate over a live-adjustable cap. Permits are RAII: half-open
// dial slots are held from connect until the handshake resolves,
// connection slots for the lifetime of an established peer.
#[derive(Debug)]
pub struct Gate {
    max: AtomicU32,
    current: AtomicU32,
    freed: Notify,
}

impl Gate {

    pub fn new(max: u32) -> Arc<Self> {
        Arc::new(Gate {
            max: AtomicU32::new(max),
            current: AtomicU32::new(0),
            freed: Notify::new(),
        })
    }

    // Shrinking does not revoke held permits; the gate drains down to
    // the new cap as they are released.
    pub fn set_max(&self, max: u32) {
        self.max.store(max, Ordering::Release);
        self.freed.notify_waiters();
    }

    pub fn in_use(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.in_use() >= self.max.load(Ordering::Acquire)
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current >= self.max.load(Ordering::Acquire) {
                return None;
            }
            if self
                .current
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(GatePermit {
                    gate: Arc::clone(self),
                });
            }
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> GatePermit {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            let freed = self.freed.notified();
            // A permit may have been released between the check and
            // registering the waiter.
            if !self.is_full() {
                continue;
            }
            freed.await;
        }
    }
}

#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<Gate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.current.fetch_sub(1, Ordering::AcqRel);
        self.gate.freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{sleep, Duration};

    #[tokio::test(start_paused = true)]
    async fn test_cap_is_never_exceeded() {
        let gate = Gate::new(3);
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = Arc::clone(&gate);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                peak.fetch_max(gate.in_use(), Ordering::AcqRel);
                sleep(Duration::from_millis(50)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::Acquire) <= 3);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire_and_release() {
        let gate = Gate::new(1);
        let permit = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_cap_admits_waiters() {
        let gate = Gate::new(1);
        let held = gate.acquire().await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.set_max(2);
        let _second = waiter.await.unwrap();
        drop(held);
    }
}
