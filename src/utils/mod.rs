//! Small shared helpers.

use crate::models::Opportunity;

/// Count records whose deadline falls within the next `days` days.
pub fn count_upcoming_deadlines(records: &[Opportunity], days: i64) -> usize {
    records
        .iter()
        .filter(|record| record.deadline_within_days(days))
        .count()
}

/// Join names for a subject line: "a", "a and b", "a, b and c".
pub fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{} and {}", first, second),
        [rest @ .., last] => format!("{} and {}", rest.join(", "), last),
    }
}
