//! Token-bucket rate limiting for syscalls
//!
//! Buckets are keyed by (principal, capability kind). The map lock is held
//! only long enough to find or insert a bucket; each bucket has its own lock,
//! so unrelated principals never contend. Once the map grows past a
//! threshold, buckets that have refilled completely and are not in use are
//! dropped: a full bucket is indistinguishable from a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

use crate::module::security::permissions::CapabilityKind;

/// Token bucket
///
/// Starts full at `burst_limit` tokens and refills at `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    /// Current number of tokens available
    tokens: f64,
    /// Maximum burst size (initial token count)
    burst_limit: u32,
    /// Tokens per second refill rate
    rate: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(burst_limit: u32, rate: u32) -> Self {
        Self::new_at(burst_limit, rate, Instant::now())
    }

    pub fn new_at(burst_limit: u32, rate: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst_limit),
            burst_limit,
            rate,
            last_refill: now,
        }
    }

    /// Check if a request is allowed and consume a token
    pub fn check_and_consume(&mut self) -> bool {
        self.check_and_consume_at(Instant::now())
    }

    pub fn check_and_consume_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * f64::from(self.rate)).min(f64::from(self.burst_limit));
            self.last_refill = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available
    pub fn tokens_remaining(&self) -> u32 {
        self.tokens.floor() as u32
    }

    /// Whether refill would have topped the bucket up by `now`
    pub fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * f64::from(self.rate) >= f64::from(self.burst_limit)
    }
}

type BucketKey = (String, CapabilityKind);

const DEFAULT_SWEEP_THRESHOLD: usize = 4096;

/// Partitioned limiter map
pub struct SyscallRateLimiter {
    buckets: Mutex<HashMap<BucketKey, Arc<Mutex<TokenBucket>>>>,
    sweep_threshold: usize,
}

impl Default for SyscallRateLimiter {
    fn default() -> Self {
        Self::with_sweep_threshold(DEFAULT_SWEEP_THRESHOLD)
    }
}

impl SyscallRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter that evicts idle buckets once more than `sweep_threshold` exist
    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            sweep_threshold,
        }
    }

    /// Consume one token for (principal, kind), creating the bucket on first use
    pub async fn check(&self, principal: &str, kind: CapabilityKind, burst: u32, rate: u32) -> bool {
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            let key = (principal.to_string(), kind);
            if !buckets.contains_key(&key) && buckets.len() >= self.sweep_threshold {
                evict_idle(&mut buckets);
            }
            buckets
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(burst, rate))))
                .clone()
        };
        let allowed = bucket.lock().await.check_and_consume();
        if !allowed {
            debug!("Rate limit exhausted for {} ({})", principal, kind);
        }
        allowed
    }

    /// Number of live buckets (for monitoring)
    pub async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

/// Drop buckets that are full and not borrowed by an in-flight check
fn evict_idle(buckets: &mut HashMap<BucketKey, Arc<Mutex<TokenBucket>>>) {
    let now = Instant::now();
    let before = buckets.len();
    buckets.retain(|_, bucket| {
        if Arc::strong_count(bucket) > 1 {
            return true;
        }
        match bucket.try_lock() {
            Ok(guard) => !guard.is_full_at(now),
            Err(_) => true,
        }
    });
    debug!("Evicted {} idle rate-limit buckets", before - buckets.len());
}
