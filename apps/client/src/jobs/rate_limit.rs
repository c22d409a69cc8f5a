use std::collections::HashMap;

use tokio::time::Instant;

/// Per-key token bucket guarding against runaway resubscription loops.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<String, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(0.0),
            buckets: HashMap::new(),
        }
    }

    /// Takes one token for `key`; `false` when the bucket is empty.
    pub fn try_acquire(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let capacity = self.capacity;
        let refill = self.refill_per_sec;
        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets that have refilled completely.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let capacity = self.capacity;
        let refill = self.refill_per_sec;
        self.buckets.retain(|_, bucket| {
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens + elapsed * refill < capacity
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
