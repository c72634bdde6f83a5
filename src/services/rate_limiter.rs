/// Sliding-window rate limiter keyed by arbitrary composite strings
///
/// Thread-safe, in-memory, integer-counted over an exact 60 s window.
/// Callers build composite keys themselves: `pg_abc…` (global per-key),
/// `pg_abc…:tool:search` (per-tool), `ip:1.2.3.4`, or a token fingerprint.
///
/// The clock is monotonic (`Instant`), so wall-clock jumps cannot widen or
/// shrink a window; only deltas are compared.
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default window: exactly one minute.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check, with everything header injection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Slots left in the window after this check.
    pub remaining: u32,
    /// Milliseconds until the oldest timestamp falls out of the window.
    pub reset_in_ms: u64,
}

struct Bucket {
    timestamps: Vec<Instant>,
}

impl Bucket {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.timestamps.retain(|&t| now.duration_since(t) < window);
    }

    fn reset_in_ms(&self, now: Instant, window: Duration) -> u64 {
        match self.timestamps.first() {
            Some(&oldest) => {
                let elapsed = now.duration_since(oldest);
                window.saturating_sub(elapsed).as_millis() as u64
            }
            None => 0,
        }
    }
}

/// Pure map of composite key → recent timestamps. Entries whose bucket has
/// drained are evicted by a background sweep.
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let limiter = Self {
            buckets: Arc::new(DashMap::new()),
        };

        // Sweep empty buckets so one-off composite keys don't accumulate.
        let buckets = limiter.buckets.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(300)).await;
                let now = Instant::now();
                buckets.retain(|_, bucket| {
                    bucket.prune(now, DEFAULT_WINDOW);
                    !bucket.timestamps.is_empty()
                });
                tracing::debug!("rate limiter sweep done, {} buckets live", buckets.len());
            }
        });

        limiter
    }

    /// Construct without the background sweep, for synchronous tests.
    #[cfg(test)]
    pub fn new_unswept() -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Atomically prune, then admit iff `count < limit` (strict less-than:
    /// the request exactly at the boundary is admitted). Admission appends
    /// the current instant to the bucket.
    pub fn check(&self, composite_key: &str, limit: u32) -> RateDecision {
        self.check_with_window(composite_key, limit, DEFAULT_WINDOW)
    }

    pub fn check_with_window(
        &self,
        composite_key: &str,
        limit: u32,
        window: Duration,
    ) -> RateDecision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(composite_key.to_string())
            .or_insert_with(|| Bucket {
                timestamps: Vec::new(),
            });

        bucket.prune(now, window);

        if (bucket.timestamps.len() as u32) < limit {
            bucket.timestamps.push(now);
            RateDecision {
                allowed: true,
                remaining: limit - bucket.timestamps.len() as u32,
                reset_in_ms: bucket.reset_in_ms(now, window),
            }
        } else {
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_in_ms: bucket.reset_in_ms(now, window),
            }
        }
    }

    /// Same computation as `check` without recording a tick.
    pub fn peek(&self, composite_key: &str, limit: u32) -> RateDecision {
        let now = Instant::now();
        match self.buckets.get_mut(composite_key) {
            Some(mut bucket) => {
                bucket.prune(now, DEFAULT_WINDOW);
                let count = bucket.timestamps.len() as u32;
                RateDecision {
                    allowed: count < limit,
                    remaining: limit.saturating_sub(count),
                    reset_in_ms: bucket.reset_in_ms(now, DEFAULT_WINDOW),
                }
            }
            None => RateDecision {
                allowed: true,
                remaining: limit,
                reset_in_ms: 0,
            },
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Composite key for the per-tool dimension.
pub fn tool_bucket(api_key: &str, tool: &str) -> String {
    format!("{api_key}:tool:{tool}")
}
