use super::{
    KeywordSearchTermVisit, SearchTermRankingPolicy, day_score, frecency_score,
    is_duplicate_visit, local_day,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MostRepeatedOptions {
    pub ignore_duplicate_visits: bool,
    pub min_visit_count: i32,
    pub max_age_days: i64,
}

impl Default for MostRepeatedOptions {
    fn default() -> Self {
        Self {
            ignore_duplicate_visits: false,
            min_visit_count: 1,
            max_age_days: 90,
        }
    }
}

/// Collapses visits that share a normalized term into one record each and
/// returns the best `count` of them.
///
/// `visits` must arrive grouped by normalized term and in ascending time
/// within a group, which is how the store enumerators yield them. A visit
/// within five minutes of the term's accumulated last visit is dropped.
pub fn autocomplete_search_terms<I>(
    visits: I,
    policy: SearchTermRankingPolicy,
    count: usize,
    now: DateTime<Utc>,
) -> Vec<KeywordSearchTermVisit>
where
    I: IntoIterator<Item = KeywordSearchTermVisit>,
{
    let mut terms: Vec<KeywordSearchTermVisit> = Vec::new();

    for visit in visits {
        match terms.last_mut() {
            Some(current) if current.normalized_term == visit.normalized_term => {
                if is_duplicate_visit(current.last_visit_time, visit.last_visit_time) {
                    continue;
                }
                current.visit_count += visit.visit_count;
                current.last_visit_time = current.last_visit_time.max(visit.last_visit_time);
                current.term = visit.term;
            }
            _ => terms.push(visit),
        }
    }

    match policy {
        SearchTermRankingPolicy::Recency => select_top(terms, count, |a, b| {
            b.last_visit_time.cmp(&a.last_visit_time)
        }),
        SearchTermRankingPolicy::Frecency => {
            for term in &mut terms {
                term.score = Some(frecency_score(term.visit_count, term.last_visit_time, now));
            }
            select_top(terms, count, by_score_desc)
        }
    }
}

struct RepeatedTerm {
    visit: KeywordSearchTermVisit,
    score: f64,
    day: NaiveDate,
    day_visit_count: i32,
    day_last_visit: DateTime<Utc>,
}

impl RepeatedTerm {
    fn start(visit: KeywordSearchTermVisit) -> Self {
        Self {
            day: local_day(visit.last_visit_time),
            day_visit_count: visit.visit_count,
            day_last_visit: visit.last_visit_time,
            score: 0.0,
            visit,
        }
    }

    fn add(&mut self, visit: KeywordSearchTermVisit, ignore_duplicates: bool, now: DateTime<Utc>) {
        let day = local_day(visit.last_visit_time);
        if day == self.day {
            if ignore_duplicates && is_duplicate_visit(self.day_last_visit, visit.last_visit_time) {
                return;
            }
            self.day_visit_count += visit.visit_count;
        } else {
            self.close_day(now);
            self.day = day;
            self.day_visit_count = visit.visit_count;
        }

        self.day_last_visit = visit.last_visit_time;
        self.visit.visit_count += visit.visit_count;
        self.visit.last_visit_time = self.visit.last_visit_time.max(visit.last_visit_time);
        self.visit.term = visit.term;
    }

    fn close_day(&mut self, now: DateTime<Utc>) {
        self.score += day_score(self.day_visit_count, self.day_last_visit, now);
    }

    fn finish(mut self, now: DateTime<Utc>) -> KeywordSearchTermVisit {
        self.close_day(now);
        self.visit.score = Some(self.score);
        self.visit
    }
}

/// Ranks terms the user keeps coming back to. Visits sharing a normalized
/// term and a local calendar day count as one day; each day contributes
/// `day_score` and a term's score is the sum over its days.
pub fn most_repeated_search_terms<I>(
    visits: I,
    options: MostRepeatedOptions,
    count: usize,
    now: DateTime<Utc>,
) -> Vec<KeywordSearchTermVisit>
where
    I: IntoIterator<Item = KeywordSearchTermVisit>,
{
    let mut terms = Vec::new();
    let mut current: Option<RepeatedTerm> = None;

    for visit in visits {
        match current.as_mut() {
            Some(term) if term.visit.normalized_term == visit.normalized_term => {
                term.add(visit, options.ignore_duplicate_visits, now);
            }
            _ => {
                if let Some(finished) = current.replace(RepeatedTerm::start(visit)) {
                    terms.push(finished.finish(now));
                }
            }
        }
    }
    if let Some(finished) = current {
        terms.push(finished.finish(now));
    }

    let oldest = now - Duration::days(options.max_age_days);
    terms.retain(|term| {
        term.last_visit_time >= oldest && term.visit_count >= options.min_visit_count
    });

    select_top(terms, count, by_score_desc)
}

fn by_score_desc(a: &KeywordSearchTermVisit, b: &KeywordSearchTermVisit) -> Ordering {
    b.score
        .unwrap_or_default()
        .total_cmp(&a.score.unwrap_or_default())
}

/// Partial sort: keeps the first `count` items under `compare`, breaking
/// ties by input position.
fn select_top<T, F>(items: Vec<T>, count: usize, compare: F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    if count == 0 {
        return Vec::new();
    }

    let mut indexed: Vec<(usize, T)> = items.into_iter().enumerate().collect();
    let by_rank = |a: &(usize, T), b: &(usize, T)| compare(&a.1, &b.1).then(a.0.cmp(&b.0));

    if indexed.len() > count {
        indexed.select_nth_unstable_by(count - 1, &by_rank);
        indexed.truncate(count);
    }
    indexed.sort_unstable_by(&by_rank);

    indexed.into_iter().map(|(_, item)| item).collect()
}
