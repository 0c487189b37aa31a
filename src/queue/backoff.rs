use rand::Rng;

/// Exponential backoff with equal jitter.
///
/// Attempt `n` (1-based) has a raw delay of `base * 2^(n-1)` capped at
/// `max`. The returned delay is drawn from `[raw / 2, raw]`, so it never
/// exceeds `max` and the lower bound never shrinks as attempts grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 300_000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms: base_ms.max(1),
            max_ms: max_ms.max(base_ms.max(1)),
        }
    }

    /// Un-jittered delay for `attempt`.
    pub fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(63);
        self.base_ms
            .checked_mul(1u64 << exp)
            .unwrap_or(u64::MAX)
            .min(self.max_ms)
    }

    pub fn delay_ms<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let raw = self.raw_delay_ms(attempt);
        let floor = raw / 2;
        if raw == floor {
            return raw;
        }
        rng.gen_range(floor..=raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn raw_delay_doubles_then_caps() {
        let p = BackoffPolicy::new(1_000, 10_000);
        let raws: Vec<u64> = (1..=6).map(|n| p.raw_delay_ms(n)).collect();
        assert_eq!(raws, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(p.raw_delay_ms(500), 10_000);
    }

    proptest! {
        #[test]
        fn jittered_delay_is_bounded(base in 1u64..5_000, extra in 0u64..1_000_000, attempt in 1u32..80, seed in any::<u64>()) {
            let p = BackoffPolicy::new(base, base + extra);
            let mut rng = StdRng::seed_from_u64(seed);
            let d = p.delay_ms(attempt, &mut rng);
            prop_assert!(d <= p.max_ms);
            prop_assert!(d >= p.raw_delay_ms(attempt) / 2);
        }
    }
}
