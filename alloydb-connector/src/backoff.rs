//! Jittered exponential backoff iterators.

use std::{cmp::min, time::Duration};

use rand::Rng;

const EXP_BASE: u64 = 2;
/// Each delay is scaled by a random factor in `[1 - JITTER, 1 + JITTER)` so
/// that concurrent clients don't retry in lockstep.
const JITTER: f64 = 0.25;

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// `tokio::time::sleep` to observe time-based exponential backoff: `initial`,
/// then doubling each step, bounded by `max`, with multiplicative jitter.
///
/// ```ignore
/// let mut delays = backoff::iter_with(INITIAL, MAX);
/// loop {
///     // ... attempt ...
///     tokio::time::sleep(delays.next().unwrap()).await;
/// }
/// ```
pub(crate) fn iter_with(
    initial: Duration,
    max: Duration,
) -> impl Iterator<Item = Duration> {
    let initial_ms = initial.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    // The initial wait being greater than the maximum wait won't cause any
    // problems, but the programmer probably didn't intend this.
    debug_assert!(initial_ms > 0);
    debug_assert!(initial_ms <= max_ms);

    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_ms.saturating_mul(factor);
        let bounded_wait = Duration::from_millis(min(wait_ms, max_ms));
        jittered(bounded_wait)
    })
}

fn jittered(duration: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..1.0 + JITTER);
    duration.mul_f64(factor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_integer_overflow() {
        let mut delays =
            iter_with(Duration::from_millis(200), Duration::from_secs(60));
        for _ in 0..200 {
            delays.next();
        }
    }

    #[test]
    fn delays_stay_bounded() {
        let initial = Duration::from_millis(200);
        let max = Duration::from_secs(30);
        let ceiling = max.mul_f64(1.0 + JITTER);
        for delay in iter_with(initial, max).take(64) {
            assert!(delay <= ceiling, "{delay:?} exceeds {ceiling:?}");
        }
    }

    /// The first five delays (the Admin API retry budget) sum to well under
    /// ten seconds even at maximum jitter.
    #[test]
    fn api_retry_schedule_is_quick() {
        let total: Duration =
            iter_with(Duration::from_millis(200), Duration::from_secs(60))
                .take(5)
                .sum();
        assert!(total < Duration::from_secs(10), "{total:?}");
    }
}
