//! Demand voting counter: votes for an extra car on a (route, travel date) group.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::models::VoteKey;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteSummary {
    pub votes_count: u32,
    pub remaining_to_trigger: u32,
    pub total_needed: u32,
}

impl VoteSummary {
    pub fn new(votes_count: u32, threshold: u32) -> Self {
        Self {
            votes_count,
            remaining_to_trigger: threshold.saturating_sub(votes_count),
            total_needed: threshold,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.remaining_to_trigger == 0
    }
}

/// Unconsumed votes for one group, as shown on the owner dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteGroup {
    pub route: String,
    pub travel_date: NaiveDate,
    pub votes_count: u32,
}

/// Result of consuming a group into a new car.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraCar {
    pub car_id: uuid::Uuid,
    pub capacity: u32,
    pub consumed_votes: u32,
}

/// Seats for a car created from `votes_count` votes.
pub fn capacity_for_votes(votes_count: u32, standard_capacity: u32) -> u32 {
    votes_count.min(standard_capacity)
}

/// Reject empty routes and travel dates in the past.
pub fn validate(key: &VoteKey, today: NaiveDate) -> CoreResult<()> {
    if key.route.is_empty() {
        return Err(CoreError::Validation("route must not be empty".to_string()));
    }
    if key.travel_date < today {
        return Err(CoreError::Validation(format!(
            "travel date {} is in the past",
            key.travel_date
        )));
    }
    Ok(())
}

/// Dashboard ordering: most votes first, then earliest date, then route.
pub fn sort_groups(groups: &mut [VoteGroup]) {
    groups.sort_by(|a, b| {
        b.votes_count
            .cmp(&a.votes_count)
            .then(a.travel_date.cmp(&b.travel_date))
            .then_with(|| a.route.cmp(&b.route))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    #[test]
    fn test_summary_counts_down_to_zero() {
        assert_eq!(VoteSummary::new(0, 14).remaining_to_trigger, 14);
        assert_eq!(VoteSummary::new(13, 14).remaining_to_trigger, 1);
        let full = VoteSummary::new(20, 14);
        assert_eq!(full.remaining_to_trigger, 0);
        assert_eq!(full.total_needed, 14);
        assert!(full.is_triggered());
    }

    #[test]
    fn test_capacity_is_capped_at_standard() {
        assert_eq!(capacity_for_votes(9, 14), 9);
        assert_eq!(capacity_for_votes(14, 14), 14);
        assert_eq!(capacity_for_votes(30, 14), 14);
    }

    #[test]
    fn test_validation() {
        assert!(validate(&VoteKey::new("Cairo-Alex", date(2)), date(1)).is_ok());
        assert!(validate(&VoteKey::new("Cairo-Alex", date(1)), date(1)).is_ok());
        assert!(validate(&VoteKey::new("   ", date(2)), date(1)).is_err());
        assert!(validate(&VoteKey::new("Cairo-Alex", date(1)), date(2)).is_err());
    }

    #[test]
    fn test_groups_sorted_by_count() {
        let mut groups = vec![
            VoteGroup { route: "A".to_string(), travel_date: date(2), votes_count: 3 },
            VoteGroup { route: "B".to_string(), travel_date: date(1), votes_count: 9 },
            VoteGroup { route: "C".to_string(), travel_date: date(1), votes_count: 3 },
        ];
        sort_groups(&mut groups);
        let routes: Vec<_> = groups.iter().map(|g| g.route.as_str()).collect();
        assert_eq!(routes, vec!["B", "C", "A"]);
    }
}
