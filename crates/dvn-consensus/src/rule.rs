use dvn_types::{SubmissionStatus, Tally, Weight};

/// Truncating percentage of `part` in `total`. `total` must be non-zero.
fn percent(part: u128, total: u128) -> u128 {
    match part.checked_mul(100) {
        Some(scaled) => scaled / total,
        // Only reachable with weights near u128::MAX; loses the remainder.
        None => part / (total / 100).max(1),
    }
}

/// Map approval and rejection mass to a verdict.
///
/// `VERIFIED` if approvals reach `threshold` percent, `REJECTED` if rejections
/// do, `DISPUTED` otherwise or when nothing was cast.
pub fn decide(approve: u128, reject: u128, threshold: u64) -> SubmissionStatus {
    let total = approve.saturating_add(reject);
    if total == 0 {
        return SubmissionStatus::Disputed;
    }
    let threshold = u128::from(threshold);
    if percent(approve, total) >= threshold {
        SubmissionStatus::Verified
    } else if percent(reject, total) >= threshold {
        SubmissionStatus::Rejected
    } else {
        SubmissionStatus::Disputed
    }
}

/// One verifier, one vote.
pub fn count_verdict(tally: &Tally, threshold: u64) -> SubmissionStatus {
    decide(
        u128::from(tally.approvals),
        u128::from(tally.rejections),
        threshold,
    )
}

/// Votes weighted by `stake × reputation`. Zero-weight votes count for nothing.
pub fn weighted_verdict(votes: &[(bool, Weight)], threshold: u64) -> SubmissionStatus {
    let (approve, reject) = votes
        .iter()
        .fold((0u128, 0u128), |(a, r), (approved, weight)| {
            if *approved {
                (a.saturating_add(*weight), r)
            } else {
                (a, r.saturating_add(*weight))
            }
        });
    decide(approve, reject, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvn_types::CONSENSUS_THRESHOLD;
    use proptest::prelude::*;

    fn tally(approvals: u64, rejections: u64) -> Tally {
        Tally {
            approvals,
            rejections,
        }
    }

    #[test]
    fn test_count_threshold_cases() {
        assert_eq!(count_verdict(&tally(2, 1), CONSENSUS_THRESHOLD), SubmissionStatus::Verified);
        assert_eq!(count_verdict(&tally(1, 2), CONSENSUS_THRESHOLD), SubmissionStatus::Rejected);
        assert_eq!(count_verdict(&tally(1, 1), CONSENSUS_THRESHOLD), SubmissionStatus::Disputed);
        assert_eq!(count_verdict(&tally(0, 0), CONSENSUS_THRESHOLD), SubmissionStatus::Disputed);
    }

    #[test]
    fn test_percentages_truncate() {
        // 2/3 = 66.67% truncates to 66, which meets the threshold.
        assert_eq!(count_verdict(&tally(2, 1), 66), SubmissionStatus::Verified);
        assert_eq!(count_verdict(&tally(2, 1), 67), SubmissionStatus::Disputed);
        // 4/7 = 57%.
        assert_eq!(count_verdict(&tally(4, 3), 66), SubmissionStatus::Disputed);
        assert_eq!(count_verdict(&tally(5, 0), 100), SubmissionStatus::Verified);
    }

    #[test]
    fn test_weighted_outvotes_count() {
        // Two light approvals against one heavy rejection.
        let votes = [(true, 10), (true, 10), (false, 100)];
        assert_eq!(weighted_verdict(&votes, 66), SubmissionStatus::Rejected);
        assert_eq!(count_verdict(&tally(2, 1), 66), SubmissionStatus::Verified);
    }

    #[test]
    fn test_weighted_zero_total_is_disputed() {
        assert_eq!(weighted_verdict(&[], 66), SubmissionStatus::Disputed);
        assert_eq!(
            weighted_verdict(&[(true, 0), (false, 0)], 66),
            SubmissionStatus::Disputed
        );
    }

    #[test]
    fn test_weighted_handles_huge_weights() {
        let votes = [(true, Weight::MAX / 2), (true, Weight::MAX / 2), (false, 1)];
        assert_eq!(weighted_verdict(&votes, 66), SubmissionStatus::Verified);
    }

    proptest! {
        #[test]
        fn prop_verdict_never_both(approve in 0u64..1000, reject in 0u64..1000, threshold in 51u64..=100) {
            let verdict = count_verdict(&tally(approve, reject), threshold);
            let total = approve + reject;
            if total == 0 {
                prop_assert_eq!(verdict, SubmissionStatus::Disputed);
            } else if approve * 100 / total >= threshold {
                prop_assert_eq!(verdict, SubmissionStatus::Verified);
            } else if reject * 100 / total >= threshold {
                prop_assert_eq!(verdict, SubmissionStatus::Rejected);
            } else {
                prop_assert_eq!(verdict, SubmissionStatus::Disputed);
            }
        }
    }
}
