use std::collections::HashMap;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::TransactionInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringPattern {
    Monthly,
    Weekly,
}

impl RecurringPattern {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecurringPattern::Monthly => "monthly",
            RecurringPattern::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringResult {
    pub transaction_id: Uuid,
    pub is_recurring: bool,
    pub pattern: Option<RecurringPattern>,
    pub occurrences: usize,
}

fn normalize_counterparty(counterparty: Option<&str>) -> String {
    counterparty
        .unwrap_or_default()
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Median of consecutive booking-date intervals, in days.
fn median_interval(mut dates: Vec<chrono::NaiveDate>) -> Option<f64> {
    dates.sort_unstable();
    if dates.len() < 2 {
        return None;
    }
    let mut intervals: Vec<i64> = dates
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_days())
        .collect();
    intervals.sort_unstable();
    let mid = intervals.len() / 2;
    let median = if intervals.len() % 2 == 0 {
        (intervals[mid - 1] + intervals[mid]) as f64 / 2.0
    } else {
        intervals[mid] as f64
    };
    Some(median)
}

fn pattern_for(median: f64) -> Option<RecurringPattern> {
    if (25.0..=35.0).contains(&median) {
        Some(RecurringPattern::Monthly)
    } else if (6.0..=8.0).contains(&median) {
        Some(RecurringPattern::Weekly)
    } else {
        None
    }
}

/// Groups a user's transactions by (normalised counterparty, exact
/// amount) and flags groups whose median interval looks monthly or
/// weekly. Off the import critical path.
#[derive(Default)]
pub struct RecurringDetector;

impl RecurringDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, transactions: &[TransactionInput]) -> Vec<RecurringResult> {
        let mut groups: HashMap<(String, Decimal), Vec<&TransactionInput>> = HashMap::new();
        for transaction in transactions {
            let key = (
                normalize_counterparty(transaction.counterparty_name.as_deref()),
                transaction.amount,
            );
            groups.entry(key).or_default().push(transaction);
        }

        let mut recurring: HashMap<Uuid, (RecurringPattern, usize)> = HashMap::new();
        for members in groups.values() {
            if members.len() < 2 {
                continue;
            }
            let dates = members.iter().map(|member| member.booking_date).collect();
            let Some(median) = median_interval(dates) else {
                continue;
            };
            let Some(pattern) = pattern_for(median) else {
                continue;
            };
            for member in members {
                recurring.insert(member.transaction_id, (pattern, members.len()));
            }
        }

        transactions
            .iter()
            .map(|transaction| {
                let found = recurring.get(&transaction.transaction_id);
                RecurringResult {
                    transaction_id: transaction.transaction_id,
                    is_recurring: found.is_some(),
                    pattern: found.map(|(pattern, _)| *pattern),
                    occurrences: found.map(|(_, count)| *count).unwrap_or(0),
                }
            })
            .collect()
    }
}
