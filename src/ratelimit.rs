use crate::clock::SharedClock;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::debug;

struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

/// Token buckets keyed by tenant (or a single shared key).
#[derive(Clone)]
pub struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
    clock: SharedClock,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatePermit {
    pub capacity: f64,
    pub tokens: f64,
    pub rate: f64,
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    pub retry_after: f64,
    pub capacity: f64,
    pub tokens: f64,
    pub rate: f64,
}

impl TokenBuckets {
    pub fn new(rate_per_sec: f64, capacity: f64, clock: SharedClock) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            capacity: capacity.max(1.0),
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn from_env(clock: SharedClock) -> Self {
        let rate_per_sec = crate::config::env_parse::<f64>("RATE_LIMIT_PER_SEC")
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = crate::config::env_parse::<f64>("RATE_LIMIT_CAPACITY")
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity, clock)
    }

    pub async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = self.clock.now_millis();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill_ms: now,
        });

        let elapsed = (now - state.last_refill_ms).max(0) as f64 / 1000.0;
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill_ms = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

/// Process-wide budget for generative calls, shared by every running job.
#[derive(Clone)]
pub struct AiCallBudget {
    buckets: TokenBuckets,
}

const AI_BUDGET_KEY: &str = "ai";

impl AiCallBudget {
    pub fn per_minute(calls: u32, clock: SharedClock) -> Self {
        let calls = calls.max(1) as f64;
        Self {
            buckets: TokenBuckets::new(calls / 60.0, calls, clock),
        }
    }

    pub async fn try_acquire(&self) -> Result<(), Duration> {
        self.buckets
            .consume(AI_BUDGET_KEY)
            .await
            .map(|_| ())
            .map_err(|exceeded| Duration::from_secs_f64(exceeded.retry_after.max(0.05)))
    }

    /// Waits until a call slot is free. Holds no lock while sleeping.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait) => {
                    debug!(
                        target = "smartenrich.llm",
                        wait_ms = wait.as_millis() as u64,
                        "ai_budget_wait"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfter {
    pub secs: u64,
}

/// Rolling-window cap on manual batch triggers per tenant.
#[derive(Clone)]
pub struct TriggerLimiter {
    max: usize,
    window_secs: i64,
    hits: Arc<Mutex<HashMap<String, VecDeque<i64>>>>,
    clock: SharedClock,
}

impl TriggerLimiter {
    pub fn new(max: usize, window: Duration, clock: SharedClock) -> Self {
        Self {
            max: max.max(1),
            window_secs: window.as_secs().max(1) as i64,
            hits: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub async fn check_and_record(&self, shop: &str) -> Result<(), RetryAfter> {
        let now = self.clock.now_secs();
        let mut hits = self.hits.lock().await;
        let window = hits.entry(shop.to_string()).or_default();
        while window.front().is_some_and(|t| now - *t >= self.window_secs) {
            window.pop_front();
        }
        if window.len() >= self.max {
            let oldest = window.front().copied().unwrap_or(now);
            let secs = (oldest + self.window_secs - now).max(1) as u64;
            return Err(RetryAfter { secs });
        }
        window.push_back(now);
        Ok(())
    }
}
