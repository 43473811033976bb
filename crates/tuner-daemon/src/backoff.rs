//! Retry delay schedule for general playback errors.

use std::time::Duration;

/// Delay before the first retry; each later attempt doubles it.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap for the doubling schedule.
pub const MAX_DELAY: Duration = Duration::from_secs(8);

/// Wait before retry `attempt` (1-indexed): 1s, 2s, 4s, 8s, 8s.
///
/// Attempt 0 is treated as 1; anything past the cap stays at `MAX_DELAY`.
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.max(1) - 1;
    // 1s << 4 already exceeds the cap, so clamp the shift before it can overflow.
    let delay = BASE_DELAY * (1u32 << exp.min(4));
    delay.min(MAX_DELAY)
}
