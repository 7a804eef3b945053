// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket shared by every transfer of one downloader, so
/// `max_bandwidth_bps` bounds the aggregate rate.
#[derive(Clone)]
pub struct SpeedLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

struct TokenBucket {
    /// Burst size in bytes; one second worth of the rate.
    capacity: u64,
    tokens: u64,
    /// Bytes per second, 0 when unlimited.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// A rate of 0 disables limiting.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = capacity_for(rate_bytes_per_sec);
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.state.lock().await;
        bucket.rate = rate_bytes_per_sec;
        bucket.capacity = capacity_for(rate_bytes_per_sec);
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
    }

    pub async fn rate(&self) -> u64 {
        self.state.lock().await.rate
    }

    /// Waits until `amount` bytes may pass. Amounts larger than the burst
    /// size are taken in burst-sized slices.
    pub async fn take(&self, amount: u64) {
        let mut remaining = amount;
        while remaining > 0 {
            let mut bucket = self.state.lock().await;
            if bucket.rate == 0 {
                return;
            }
            bucket.refill(Instant::now());

            let wanted = remaining.min(bucket.capacity);
            if bucket.tokens >= wanted {
                bucket.tokens -= wanted;
                remaining -= wanted;
                continue;
            }

            let missing = wanted - bucket.tokens;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate as f64);
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

fn capacity_for(rate: u64) -> u64 {
    if rate == 0 {
        u64::MAX
    } else {
        rate
    }
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}
