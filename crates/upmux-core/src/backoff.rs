//! Overflow-safe exponential backoff.
//!
//! Connection retries and OAuth refresh retries use separate policies;
//! they share only [`BackoffPolicy::delay_for`].

use std::time::Duration;

/// Largest exponent applied before the cap takes over.
///
/// `2^25` times any base of at least one millisecond already exceeds every
/// cap used in practice, and `1u32 << 25` cannot overflow.
pub const MAX_BACKOFF_EXPONENT: u32 = 25;

const MIN_BASE: Duration = Duration::from_millis(1);

/// Exponential backoff with a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Connection retries: 1s doubling, capped at 5 minutes.
    pub const CONNECTION: Self = Self {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(300),
    };

    /// OAuth refresh retries: 10s doubling, capped at 5 minutes.
    pub const OAUTH_REFRESH: Self = Self {
        base: Duration::from_secs(10),
        cap: Duration::from_secs(300),
    };

    /// Build a policy. The base is floored at one millisecond and the cap is
    /// never below the base, so every delay is strictly positive.
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.max(MIN_BASE);
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub const fn base(&self) -> Duration {
        self.base
    }

    pub const fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before retry number `retry_count` (0-based): `base * 2^n`, capped.
    ///
    /// The exponent is clamped before shifting, so large retry counts yield
    /// the cap instead of wrapping to zero.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count > MAX_BACKOFF_EXPONENT {
            return self.cap;
        }
        let factor = 1u32 << retry_count;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::CONNECTION
    }
}
