use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

const REFILL_EVERY: Duration = Duration::from_secs(1);

/// Token bucket for new connections. Permits are consumed on acquire and the
/// bucket is topped back up to `per_second` once a second has passed.
#[derive(Clone)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    per_second: u32,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            tokens: Arc::new(Semaphore::new(per_second as usize)),
            per_second,
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            self.refill().await;
            if let Ok(permit) = self.tokens.try_acquire() {
                permit.forget();
                return;
            }
            sleep(self.until_refill().await).await;
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        let now = Instant::now();
        if now.duration_since(*last) >= REFILL_EVERY {
            let missing = self
                .per_second
                .saturating_sub(self.tokens.available_permits() as u32);
            if missing > 0 {
                self.tokens.add_permits(missing as usize);
            }
            *last = now;
        }
    }

    async fn until_refill(&self) -> Duration {
        let last = self.last_refill.lock().await;
        REFILL_EVERY
            .saturating_sub(last.elapsed())
            .max(Duration::from_millis(1))
    }

    /// Short random pause between launches so scans do not start in lockstep.
    pub async fn sleep_jitter(&self) {
        let jitter_ms: u64 = thread_rng().gen_range(5..20);
        sleep(Duration::from_millis(jitter_ms)).await;
    }
}
