// =============================================================================
// Rate-Limit Budget — tracks exchange weight and order quotas to avoid 429s
// =============================================================================
//
// Exchanges enforce two quota families: request weight per minute, and order
// submissions per 10-second window and per day. The budget keeps atomic
// counters for all three that any task may query lock-free, and the adapter
// refuses calls that would exceed a remaining budget instead of letting the
// exchange reject them.
//
// Counters are fed from response headers where the exchange returns them
// (`X-MBX-USED-WEIGHT-1M`, `X-MBX-ORDER-COUNT-10S`, `X-MBX-ORDER-COUNT-1D`)
// and counted locally otherwise. Stale windows roll lazily on the next
// check rather than via reset timers.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Length of the order-rate window, milliseconds.
const ORDER_WINDOW_MS: u64 = 10_000;
/// Length of the daily order window, milliseconds.
const ORDER_DAY_MS: u64 = 86_400_000;

/// Thread-safe request-weight and order-count budget backed by atomic
/// counters.
pub struct RateLimitBudget {
    /// Hard ceiling at which further requests are refused.
    weight_limit: u32,
    /// Soft warning threshold.
    warn_threshold: u32,
    used_weight_1m: AtomicU32,
    /// Millisecond timestamp of the minute window the counter belongs to.
    window_start_ms: AtomicU64,

    /// Maximum orders per 10-second window.
    order_limit_10s: u32,
    /// Maximum orders per day.
    order_limit_1d: u32,
    order_count_10s: AtomicU32,
    order_window_start_ms: AtomicU64,
    order_count_1d: AtomicU32,
    order_day_start_ms: AtomicU64,
}

/// Immutable snapshot of the current budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub weight_limit: u32,
    pub order_count_10s: u32,
    pub order_limit_10s: u32,
    pub order_count_1d: u32,
    pub order_limit_1d: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RateLimitBudget {
    /// Create a budget with the given per-minute weight ceiling and order
    /// quotas. The warning threshold sits at 80 % of the weight ceiling.
    pub fn new(weight_limit: u32, order_limit_10s: u32, order_limit_1d: u32) -> Self {
        let now = now_ms();
        Self {
            weight_limit,
            warn_threshold: weight_limit / 5 * 4,
            used_weight_1m: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(now),
            order_limit_10s,
            order_limit_1d,
            order_count_10s: AtomicU32::new(0),
            order_window_start_ms: AtomicU64::new(now),
            order_count_1d: AtomicU32::new(0),
            order_day_start_ms: AtomicU64::new(now),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Record the consumed weight reported by the exchange for the current
    /// minute window.
    pub fn record_used_weight(&self, weight: u32) {
        let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
        self.window_start_ms.store(now_ms(), Ordering::Relaxed);
        if weight >= self.warn_threshold && prev < self.warn_threshold {
            warn!(
                used_weight = weight,
                limit = self.weight_limit,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated");
    }

    /// Record the authoritative order counts returned by the exchange.
    pub fn record_order_counts(&self, count_10s: Option<u32>, count_1d: Option<u32>) {
        if let Some(count) = count_10s {
            self.order_count_10s.store(count, Ordering::Relaxed);
            self.order_window_start_ms.store(now_ms(), Ordering::Relaxed);
        }
        if let Some(count) = count_1d {
            self.order_count_1d.store(count, Ordering::Relaxed);
        }
        debug!(?count_10s, ?count_1d, "order counts updated from headers");
    }

    // -------------------------------------------------------------------------
    // Window rolls
    // -------------------------------------------------------------------------

    /// Reset order counters whose window has elapsed.
    fn roll_order_windows(&self) {
        let now = now_ms();
        let window_age = now.saturating_sub(self.order_window_start_ms.load(Ordering::Relaxed));
        if window_age >= ORDER_WINDOW_MS {
            self.order_count_10s.store(0, Ordering::Relaxed);
            self.order_window_start_ms.store(now, Ordering::Relaxed);
        }
        let day_age = now.saturating_sub(self.order_day_start_ms.load(Ordering::Relaxed));
        if day_age >= ORDER_DAY_MS {
            self.order_count_1d.store(0, Ordering::Relaxed);
            self.order_day_start_ms.store(now, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Returns `Ok(())` when `weight` more units fit under the ceiling, or
    /// `Err(retry_after_ms)` with the time remaining in the current minute
    /// window.
    pub fn try_acquire(&self, weight: u32) -> Result<(), u64> {
        // A stale window means the counter has rolled over on the exchange.
        let window_age = now_ms().saturating_sub(self.window_start_ms.load(Ordering::Relaxed));
        if window_age >= 60_000 {
            self.used_weight_1m.store(0, Ordering::Relaxed);
            self.window_start_ms.store(now_ms(), Ordering::Relaxed);
        }

        let current = self.used_weight_1m.load(Ordering::Relaxed);
        if current + weight <= self.weight_limit {
            Ok(())
        } else {
            let retry_after_ms = 60_000u64.saturating_sub(window_age).max(100);
            warn!(
                current_weight = current,
                requested_weight = weight,
                limit = self.weight_limit,
                retry_after_ms,
                "request refused — would exceed rate-limit budget"
            );
            Err(retry_after_ms)
        }
    }

    /// Returns `Ok(())` when another order fits under both the 10-second and
    /// daily quotas, or `Err(retry_after_ms)` with the time remaining in the
    /// tripped window.
    pub fn try_place_order(&self) -> Result<(), u64> {
        self.roll_order_windows();
        let now = now_ms();

        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        if count_10s >= self.order_limit_10s {
            let window_age =
                now.saturating_sub(self.order_window_start_ms.load(Ordering::Relaxed));
            let retry_after_ms = ORDER_WINDOW_MS.saturating_sub(window_age).max(100);
            warn!(
                count_10s,
                limit = self.order_limit_10s,
                retry_after_ms,
                "order refused — 10 s order quota reached"
            );
            return Err(retry_after_ms);
        }

        let count_1d = self.order_count_1d.load(Ordering::Relaxed);
        if count_1d >= self.order_limit_1d {
            let day_age = now.saturating_sub(self.order_day_start_ms.load(Ordering::Relaxed));
            let retry_after_ms = ORDER_DAY_MS.saturating_sub(day_age).max(100);
            warn!(
                count_1d,
                limit = self.order_limit_1d,
                retry_after_ms,
                "order refused — daily order quota reached"
            );
            return Err(retry_after_ms);
        }

        Ok(())
    }

    /// Count an order locally, before the exchange responds with updated
    /// headers.
    pub fn record_order_sent(&self) {
        self.roll_order_windows();
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            weight_limit: self.weight_limit,
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_limit_10s: self.order_limit_10s,
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
            order_limit_1d: self.order_limit_1d,
        }
    }
}

impl std::fmt::Debug for RateLimitBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitBudget")
            .field("weight_limit", &self.weight_limit)
            .field(
                "used_weight_1m",
                &self.used_weight_1m.load(Ordering::Relaxed),
            )
            .field(
                "order_count_10s",
                &self.order_count_10s.load(Ordering::Relaxed),
            )
            .field(
                "order_count_1d",
                &self.order_count_1d.load(Ordering::Relaxed),
            )
            .finish()
    }
}
