/// Weight applied to base priority so it always dominates the age bonus.
pub const PRIORITY_WEIGHT: i64 = 1000;

/// Ceiling the age bonus saturates at: `5 * K / 10`, i.e. half a priority
/// level, so aging can never let a low-priority batch overtake one two
/// levels higher.
pub const AGE_BONUS_CEILING: i64 = 5 * PRIORITY_WEIGHT / 10;

/// `effective_priority = base_priority * K + age_bonus(age_seconds)` where
/// `age_bonus = min(age_seconds / 60, ceiling)`. Applied here at the batch
/// level: `age_seconds` is how long the batch has sat PENDING waiting for
/// dispatch, i.e. `now - sealed_at`.
pub fn effective_priority(priority: i32, age_seconds: u64) -> i64 {
    let age_bonus = (age_seconds / 60) as i64;
    priority as i64 * PRIORITY_WEIGHT + age_bonus.min(AGE_BONUS_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_bonus_never_lets_priority_ordering_invert() {
        // A priority-1 batch, however old, never outranks a priority-2 batch
        // fresh off the press.
        let old_low = effective_priority(1, 1_000_000);
        let fresh_high = effective_priority(2, 0);
        assert!(old_low < fresh_high);
    }

    #[test]
    fn age_bonus_saturates_at_ceiling() {
        let capped = effective_priority(5, 1_000_000);
        let at_ceiling = effective_priority(5, (AGE_BONUS_CEILING as u64) * 60);
        assert_eq!(capped, at_ceiling);
    }

    #[test]
    fn higher_priority_wins_at_equal_age() {
        assert!(effective_priority(9, 10) > effective_priority(3, 10));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]
        #[test]
        fn test_effective_priority_invariants(
            priority in 1..=10i32,
            age_seconds in 0..=100_000_000u64,
            older_age_seconds in 0..=100_000_000u64,
        ) {
            let ep = effective_priority(priority, age_seconds);

            // --- INVARIANT 1: age bonus never exceeds the ceiling ---
            assert!(ep <= priority as i64 * PRIORITY_WEIGHT + AGE_BONUS_CEILING);
            assert!(ep >= priority as i64 * PRIORITY_WEIGHT);

            // --- INVARIANT 2: effective_priority is monotonic non-decreasing in age ---
            let (younger, older) = if age_seconds <= older_age_seconds {
                (age_seconds, older_age_seconds)
            } else {
                (older_age_seconds, age_seconds)
            };
            assert!(effective_priority(priority, younger) <= effective_priority(priority, older));

            // --- INVARIANT 3: a full priority level always dominates any amount of aging ---
            if priority < 10 {
                let lower = effective_priority(priority, age_seconds.max(older_age_seconds));
                let higher_fresh = effective_priority(priority + 1, 0);
                assert!(lower < higher_fresh,
                    "priority {} aged to {} must never outrank fresh priority {}",
                    priority, lower, priority + 1);
            }
        }
    }
}
