//! Membership delta calculation with threshold gating.
//!
//! Pure and deterministic: the same inputs always yield the same result, with
//! both user lists sorted by object id.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::AzureAdUser;

/// Which configured limits a delta exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThresholdOutcome {
    WithinBounds,
    ExceededForAdditions,
    ExceededForRemovals,
    ExceededForBoth,
}

impl ThresholdOutcome {
    fn from_flags(additions: bool, removals: bool) -> Self {
        match (additions, removals) {
            (false, false) => ThresholdOutcome::WithinBounds,
            (true, false) => ThresholdOutcome::ExceededForAdditions,
            (false, true) => ThresholdOutcome::ExceededForRemovals,
            (true, true) => ThresholdOutcome::ExceededForBoth,
        }
    }

    pub fn additions_exceeded(&self) -> bool {
        matches!(
            self,
            ThresholdOutcome::ExceededForAdditions | ThresholdOutcome::ExceededForBoth
        )
    }

    pub fn removals_exceeded(&self) -> bool {
        matches!(
            self,
            ThresholdOutcome::ExceededForRemovals | ThresholdOutcome::ExceededForBoth
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaResult {
    pub to_add: Vec<AzureAdUser>,
    pub to_remove: Vec<AzureAdUser>,
    /// Additions as a percentage of the destination; `None` when it was empty
    pub addition_percentage: Option<f64>,
    /// Removals as a percentage of the destination; `None` when it was empty
    pub removal_percentage: Option<f64>,
    pub outcome: ThresholdOutcome,
}

impl DeltaResult {
    /// True when the delta must not be applied.
    pub fn is_rejected(&self) -> bool {
        self.outcome != ThresholdOutcome::WithinBounds
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes the changes that turn `destination` into `source`.
///
/// A negative threshold disables its check. An empty destination skips both
/// checks so a new group can be populated.
pub fn compute_delta(
    destination: &[AzureAdUser],
    source: &[AzureAdUser],
    threshold_additions: i32,
    threshold_removals: i32,
) -> DeltaResult {
    let current: BTreeSet<AzureAdUser> = destination.iter().copied().collect();
    let desired: BTreeSet<AzureAdUser> = source.iter().copied().collect();

    let to_add: Vec<AzureAdUser> = desired.difference(&current).copied().collect();
    let to_remove: Vec<AzureAdUser> = current.difference(&desired).copied().collect();

    if current.is_empty() {
        return DeltaResult {
            to_add,
            to_remove,
            addition_percentage: None,
            removal_percentage: None,
            outcome: ThresholdOutcome::WithinBounds,
        };
    }

    let base = current.len() as f64;
    let addition_percentage = to_add.len() as f64 * 100.0 / base;
    let removal_percentage = to_remove.len() as f64 * 100.0 / base;

    let exceeds = |percentage: f64, threshold: i32| {
        threshold >= 0 && percentage > f64::from(threshold)
    };

    DeltaResult {
        outcome: ThresholdOutcome::from_flags(
            exceeds(addition_percentage, threshold_additions),
            exceeds(removal_percentage, threshold_removals),
        ),
        to_add,
        to_remove,
        addition_percentage: Some(addition_percentage),
        removal_percentage: Some(removal_percentage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn users(n: usize) -> Vec<AzureAdUser> {
        let mut users: Vec<AzureAdUser> = (0..n).map(|_| AzureAdUser::new(Uuid::new_v4())).collect();
        users.sort();
        users
    }

    #[test]
    fn removal_threshold_rejects_large_shrink() {
        let destination = users(10);
        let source = destination[..6].to_vec();

        let delta = compute_delta(&destination, &source, 100, 10);

        assert!(delta.to_add.is_empty());
        assert_eq!(delta.to_remove, destination[6..].to_vec());
        assert_eq!(delta.removal_percentage, Some(40.0));
        assert_eq!(delta.outcome, ThresholdOutcome::ExceededForRemovals);
        assert!(delta.is_rejected());
    }

    #[test]
    fn empty_destination_bypasses_thresholds() {
        let source = users(50);

        let delta = compute_delta(&[], &source, 10, 10);

        assert_eq!(delta.to_add, source);
        assert!(delta.to_remove.is_empty());
        assert_eq!(delta.outcome, ThresholdOutcome::WithinBounds);
    }

    #[test]
    fn negative_threshold_disables_check() {
        let destination = users(2);
        let mut source = users(10);
        source.extend(destination.iter().copied());

        let delta = compute_delta(&destination, &source, -1, -1);
        assert_eq!(delta.to_add.len(), 10);
        assert_eq!(delta.outcome, ThresholdOutcome::WithinBounds);
    }

    #[test]
    fn percentage_equal_to_threshold_is_allowed() {
        let destination = users(10);
        let source = destination[1..].to_vec();

        let delta = compute_delta(&destination, &source, 100, 10);
        assert_eq!(delta.outcome, ThresholdOutcome::WithinBounds);
    }

    #[test]
    fn both_limits_can_be_exceeded() {
        let destination = users(4);
        let mut source = destination[..2].to_vec();
        source.extend(users(3));

        let delta = compute_delta(&destination, &source, 50, 25);
        assert_eq!(delta.outcome, ThresholdOutcome::ExceededForBoth);
        assert!(delta.outcome.additions_exceeded());
        assert!(delta.outcome.removals_exceeded());
    }

    #[test]
    fn swapping_sides_swaps_additions_and_removals() {
        let left = users(5);
        let mut right = left[..3].to_vec();
        right.extend(users(2));

        let forward = compute_delta(&left, &right, -1, -1);
        let backward = compute_delta(&right, &left, -1, -1);
        assert_eq!(forward.to_add, backward.to_remove);
        assert_eq!(forward.to_remove, backward.to_add);
    }

    #[test]
    fn identical_membership_yields_empty_delta() {
        let members = users(5);
        let mut shuffled = members.clone();
        shuffled.reverse();

        let delta = compute_delta(&members, &shuffled, 0, 0);
        assert!(delta.is_empty());
        assert!(!delta.is_rejected());
    }

    #[test]
    fn applying_delta_reaches_source_set() {
        let destination = users(6);
        let mut source = destination[2..].to_vec();
        source.extend(users(2));

        let delta = compute_delta(&destination, &source, -1, -1);
        let mut result: BTreeSet<AzureAdUser> = destination.iter().copied().collect();
        for user in &delta.to_remove {
            result.remove(user);
        }
        result.extend(delta.to_add.iter().copied());

        assert_eq!(result, source.iter().copied().collect());
        assert_eq!(delta, compute_delta(&destination, &source, -1, -1));
    }
}
