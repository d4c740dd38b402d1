//! Adaptive request pacing
//!
//! Proactive throttling for Graph calls, one token bucket per endpoint
//! category (`"delta"`, `"download"`, `"upload"`, `"metadata"`). A 429
//! halves the category's effective capacity and opens a cooldown window
//! sized by the server's `Retry-After` hint; sustained successes restore
//! capacity step by step.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Successes required before one capacity step is restored
const RECOVERY_STEP_SUCCESSES: u64 = 20;

/// Cooldown applied on throttle when the server sends no hint
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Pacing configuration
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Bucket capacity per category
    pub capacity: u32,
    /// Token refill rate per second
    pub refill_per_sec: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_sec: 4.0,
        }
    }
}

#[derive(Debug)]
struct CategoryState {
    tokens: f64,
    last_refill: Instant,
    effective_capacity: u32,
    successes_since_throttle: u64,
    cooldown_until: Option<Instant>,
}

impl CategoryState {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
            effective_capacity: capacity,
            successes_since_throttle: 0,
            cooldown_until: None,
        }
    }

    fn refill(&mut self, rate: f64) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate).min(self.effective_capacity as f64);
            self.last_refill = Instant::now();
        }
    }
}

/// Per-category pacer shared by the pipelines
pub struct RequestPacer {
    config: PacingConfig,
    categories: Mutex<HashMap<String, CategoryState>>,
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            categories: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PacingConfig::default())
    }

    /// Waits until the category may issue a request
    ///
    /// Blocks through any active cooldown window, then through token refill.
    pub async fn acquire(&self, category: &str) {
        loop {
            let wait = {
                let mut categories = self.categories.lock().unwrap();
                let state = categories
                    .entry(category.to_string())
                    .or_insert_with(|| CategoryState::new(self.config.capacity));

                if let Some(until) = state.cooldown_until {
                    let now = Instant::now();
                    if now < until {
                        until - now
                    } else {
                        state.cooldown_until = None;
                        Duration::ZERO
                    }
                } else {
                    state.refill(self.config.refill_per_sec);
                    if state.tokens >= 1.0 {
                        state.tokens -= 1.0;
                        return;
                    }
                    let deficit = 1.0 - state.tokens;
                    Duration::from_secs_f64(deficit / self.config.refill_per_sec.max(0.001))
                }
            };

            if !wait.is_zero() {
                debug!(category, wait_ms = wait.as_millis() as u64, "Pacing request");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Records a throttle signal for the category
    pub fn on_throttle(&self, category: &str, retry_after: Option<Duration>) {
        let mut categories = self.categories.lock().unwrap();
        let state = categories
            .entry(category.to_string())
            .or_insert_with(|| CategoryState::new(self.config.capacity));

        state.effective_capacity = (state.effective_capacity / 2).max(1);
        state.tokens = state.tokens.min(state.effective_capacity as f64);
        state.successes_since_throttle = 0;
        let cooldown = retry_after.unwrap_or(DEFAULT_COOLDOWN);
        state.cooldown_until = Some(Instant::now() + cooldown);

        warn!(
            category,
            effective_capacity = state.effective_capacity,
            cooldown_ms = cooldown.as_millis() as u64,
            "Throttled, reducing request pace"
        );
    }

    /// Records a success; sustained successes restore capacity
    pub fn on_success(&self, category: &str) {
        let mut categories = self.categories.lock().unwrap();
        let Some(state) = categories.get_mut(category) else {
            return;
        };

        if state.effective_capacity >= self.config.capacity {
            return;
        }
        state.successes_since_throttle += 1;
        if state.successes_since_throttle >= RECOVERY_STEP_SUCCESSES {
            state.successes_since_throttle = 0;
            state.effective_capacity =
                (state.effective_capacity * 2).min(self.config.capacity);
            info!(
                category,
                effective_capacity = state.effective_capacity,
                "Request pace recovering"
            );
        }
    }

    /// Current effective capacity of a category (full capacity when unseen)
    pub fn effective_capacity(&self, category: &str) -> u32 {
        let categories = self.categories.lock().unwrap();
        categories
            .get(category)
            .map(|s| s.effective_capacity)
            .unwrap_or(self.config.capacity)
    }
}
