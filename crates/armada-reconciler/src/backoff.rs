use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter: a uniformly random delay in
/// `[0, min(base * 2^failures, cap)]`. Full jitter keeps a burst of failing
/// changesets from thundering back onto the code host in lockstep.
pub fn backoff_duration(base: Duration, cap: Duration, failures: i32) -> Duration {
    let exp = failures.clamp(0, 30) as u32;
    let ceiling = base
        .checked_mul(2u32.saturating_pow(exp))
        .unwrap_or(cap)
        .min(cap);
    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(3600);

    #[test]
    fn backoff_never_exceeds_the_cap() {
        for failures in 0..100 {
            let d = backoff_duration(BASE, CAP, failures);
            assert!(d <= CAP, "failures={failures} gave {d:?}");
        }
    }

    #[test]
    fn ceiling_doubles_until_capped() {
        // With full jitter the sample is random, so probe the ceiling by
        // sampling repeatedly.
        let max_at = |failures| {
            (0..200)
                .map(|_| backoff_duration(BASE, CAP, failures))
                .max()
                .unwrap()
        };
        assert!(max_at(0) <= Duration::from_secs(5));
        assert!(max_at(3) <= Duration::from_secs(40));
        assert!(max_at(20) <= CAP);
    }

    #[test]
    fn extreme_failure_counts_do_not_overflow() {
        let d = backoff_duration(BASE, CAP, i32::MAX);
        assert!(d <= CAP);
        let d = backoff_duration(BASE, CAP, -5);
        assert!(d <= BASE);
    }
}
