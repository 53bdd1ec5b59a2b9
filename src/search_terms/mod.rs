pub mod aggregate;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Visits of the same term closer together than this are one visit for
/// ranking purposes.
pub const DUPLICATE_VISIT_INTERVAL_SECS: i64 = 5 * 60;

pub(crate) fn is_duplicate_visit(previous: DateTime<Utc>, next: DateTime<Utc>) -> bool {
    next - previous <= Duration::seconds(DUPLICATE_VISIT_INTERVAL_SECS)
}

/// One search term as seen by the aggregation engines. Rows read from the
/// store carry their URL's visit count; aggregated records carry the sum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordSearchTermVisit {
    pub term: String,
    pub normalized_term: String,
    pub visit_count: i32,
    pub last_visit_time: DateTime<Utc>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTermRankingPolicy {
    #[default]
    Recency,
    Frecency,
}

/// Lower-cases and collapses runs of whitespace into single spaces, trimming
/// both ends.
pub fn normalize_term(term: &str) -> String {
    term.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn frecency_score(visit_count: i32, last_visit_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let recency_seconds = (now - last_visit_time).num_seconds().max(0) as f64;
    f64::from(visit_count).powf(1.15) * 60.0 / (60.0 + recency_seconds)
}

/// Score of one calendar day's visits: grows with the count and decays with
/// whole local days since that day.
pub fn day_score(visit_count: i32, day_last_visit: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days_ago = (local_day(now) - local_day(day_last_visit)).num_days().max(0) as f64;
    (1.0 + f64::from(visit_count.max(1)).ln()) * (1.0 + 2.0 / (1.0 + days_ago / 7.0))
}

pub(crate) fn local_day(time: DateTime<Utc>) -> NaiveDate {
    time.with_timezone(&Local).date_naive()
}
