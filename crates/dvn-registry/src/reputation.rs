use dvn_types::Reputation;

/// Apply a signed delta to a reputation score, clamping the result to `[0, max]`.
///
/// Never panics or wraps: the arithmetic is carried out in `i128`, which holds
/// any `u64` plus any `i64` exactly. A starting value above `max` is treated as
/// `max`.
pub fn apply_reputation_delta(current: Reputation, delta: i64, max: Reputation) -> Reputation {
    let start = i128::from(current.min(max));
    let next = (start + i128::from(delta)).clamp(0, i128::from(max));
    // In [0, max] after the clamp, so the conversion cannot fail.
    Reputation::try_from(next).unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvn_types::MAX_REPUTATION;
    use proptest::prelude::*;

    #[test]
    fn test_delta_within_bounds() {
        assert_eq!(apply_reputation_delta(1000, 10, MAX_REPUTATION), 1010);
        assert_eq!(apply_reputation_delta(1000, -10, MAX_REPUTATION), 990);
    }

    #[test]
    fn test_clamps_at_zero() {
        assert_eq!(apply_reputation_delta(0, -1, MAX_REPUTATION), 0);
        assert_eq!(apply_reputation_delta(5, -6, MAX_REPUTATION), 0);
        assert_eq!(apply_reputation_delta(MAX_REPUTATION, i64::MIN, MAX_REPUTATION), 0);
    }

    #[test]
    fn test_clamps_at_max() {
        assert_eq!(
            apply_reputation_delta(MAX_REPUTATION, 1, MAX_REPUTATION),
            MAX_REPUTATION
        );
        assert_eq!(
            apply_reputation_delta(MAX_REPUTATION - 1, 2, MAX_REPUTATION),
            MAX_REPUTATION
        );
        assert_eq!(apply_reputation_delta(0, i64::MAX, MAX_REPUTATION), MAX_REPUTATION);
    }

    #[test]
    fn test_out_of_range_start_treated_as_max() {
        assert_eq!(
            apply_reputation_delta(MAX_REPUTATION + 1, 0, MAX_REPUTATION),
            MAX_REPUTATION
        );
        assert_eq!(
            apply_reputation_delta(u64::MAX, -1, MAX_REPUTATION),
            MAX_REPUTATION - 1
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_reputation_stays_bounded(
            start in 0u64..=MAX_REPUTATION,
            deltas in prop::collection::vec(any::<i64>(), 0..32),
        ) {
            let mut rep = start;
            for delta in deltas {
                rep = apply_reputation_delta(rep, delta, MAX_REPUTATION);
                prop_assert!(rep <= MAX_REPUTATION);
            }
        }

        #[test]
        fn prop_small_deltas_are_exact(
            start in 100u64..=9_900,
            delta in -100i64..=100,
        ) {
            let expected = (start as i64 + delta) as u64;
            prop_assert_eq!(apply_reputation_delta(start, delta, MAX_REPUTATION), expected);
        }
    }
}
