//! Reconnect delays.
//!
//! ```text
//! Failures    Expected delay    With jitter (±20%)
//! ─────────────────────────────────────────────────
//!     0            0s               0s
//!     1            1s             0.8s - 1.2s
//!     2            3s             2.4s - 3.6s
//!     3            7s             5.6s - 8.4s
//!     4           15s              12s - 18s
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Maps the number of consecutive failures to the wait before reconnecting.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.8;

/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.2;

/// Exponents above this would overflow; the delay stops growing there.
const MAX_EXPONENT: u32 = 32;

/// `(2^failures - 1)` seconds, without jitter.
pub fn expected_delay(failures: u32) -> Duration {
    let exponent = failures.min(MAX_EXPONENT);
    Duration::from_secs((1u64 << exponent) - 1)
}

/// Default policy: [`expected_delay`] scaled by a uniform factor in
/// `[JITTER_MIN, JITTER_MAX]`.
pub fn default_retry_delay(failures: u32) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    expected_delay(failures).mul_f64(factor)
}

pub fn default_retry_delay_fn() -> RetryDelayFn {
    Arc::new(default_retry_delay)
}
