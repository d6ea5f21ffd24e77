//! The order in which due triggers are serviced.
//!
//! 1. A trigger without a next fire time sorts after every trigger that has one.
//! 2. Earlier next fire time first.
//! 3. Higher priority first.
//! 4. Trigger key ascending (group, then name).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::trigger::Trigger;
use crate::types::TriggerKey;

/// Compare two triggers by fire order.
pub fn compare_fire_order(a: &Trigger, b: &Trigger) -> Ordering {
    compare_parts(
        (a.next_fire_time, a.priority, &a.key),
        (b.next_fire_time, b.priority, &b.key),
    )
}

fn compare_parts(
    (a_time, a_priority, a_key): (Option<DateTime<Utc>>, i32, &TriggerKey),
    (b_time, b_priority, b_key): (Option<DateTime<Utc>>, i32, &TriggerKey),
) -> Ordering {
    let by_time = match (a_time, b_time) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| b_priority.cmp(&a_priority))
        .then_with(|| a_key.cmp(b_key))
}

/// A trigger's position in the fire order, detached from the trigger.
///
/// Used as the element of ordered indexes such as the in-memory store's
/// time index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FireOrderKey {
    pub next_fire_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub key: TriggerKey,
}

impl From<&Trigger> for FireOrderKey {
    fn from(trigger: &Trigger) -> Self {
        Self {
            next_fire_time: trigger.next_fire_time,
            priority: trigger.priority,
            key: trigger.key.clone(),
        }
    }
}

impl Ord for FireOrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_parts(
            (self.next_fire_time, self.priority, &self.key),
            (other.next_fire_time, other.priority, &other.key),
        )
    }
}

impl PartialOrd for FireOrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn key(name: &str, group: &str) -> TriggerKey {
        TriggerKey::new(name, group)
    }

    fn entry(offset_s: Option<i64>, priority: i32, k: TriggerKey) -> FireOrderKey {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FireOrderKey {
            next_fire_time: offset_s.map(|s| base + Duration::seconds(s)),
            priority,
            key: k,
        }
    }

    #[test]
    fn higher_priority_wins_a_tie() {
        let low = entry(Some(10), 5, key("low", "grp"));
        let high = entry(Some(10), 10, key("high", "grp"));
        assert!(high < low);
    }

    #[test]
    fn key_breaks_remaining_ties() {
        let a = entry(Some(10), 5, key("a", "grp"));
        let b = entry(Some(10), 5, key("b", "grp"));
        assert!(a < b);
    }

    #[test]
    fn earlier_time_beats_priority() {
        let early = entry(Some(5), 1, key("z", "grp"));
        let late = entry(Some(6), 100, key("a", "grp"));
        assert!(early < late);
    }

    #[test]
    fn missing_fire_time_sorts_last() {
        let never = entry(None, 100, key("a", "a"));
        let someday = entry(Some(1_000_000), 1, key("z", "z"));
        assert!(someday < never);
        // Both missing: priority decides.
        let never_low = entry(None, 1, key("a", "a"));
        assert!(never < never_low);
    }

    fn arb_entry() -> impl Strategy<Value = FireOrderKey> {
        (
            proptest::option::of(0i64..5),
            0i32..3,
            prop_oneof![Just("a"), Just("b"), Just("c")],
            prop_oneof![Just("g1"), Just("g2")],
        )
            .prop_map(|(t, p, n, g)| entry(t, p, key(n, g)))
    }

    proptest! {
        #[test]
        fn is_a_strict_weak_order(a in arb_entry(), b in arb_entry(), c in arb_entry()) {
            // Irreflexive.
            prop_assert!(!(a < a));
            // Asymmetric and consistent with equality.
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            // Transitive.
            if a < b && b < c {
                prop_assert!(a < c);
            }
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn sorting_is_deterministic(mut items in proptest::collection::vec(arb_entry(), 0..20)) {
            let mut reversed = items.clone();
            reversed.reverse();
            items.sort();
            reversed.sort();
            prop_assert_eq!(items, reversed);
        }
    }
}
